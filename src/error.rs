use thiserror::Error;

use crate::page::Side;
use crate::sense::Condition;

#[derive(Debug, Error)]
pub enum Error {
    #[error("scanner {vid:04x}:{pid:04x} not found")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("usb access to the scanner is not supported on this platform")]
    UnsupportedPlatform,

    #[error("usb: {0}")]
    Usb(#[from] rusb::Error),

    #[error("device: {0}")]
    Device(#[from] Condition),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("no data on {side} channel after {tries} attempts")]
    DataTimeout { side: Side, tries: u32 },

    #[error("no document inserted")]
    NoDocument,

    #[error("pipeline: {0}")]
    Pipeline(String),

    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// The device condition behind this error, if it came from the scanner.
    pub fn condition(&self) -> Option<Condition> {
        match self {
            Self::Device(c) => Some(*c),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
