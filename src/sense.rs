//! REQUEST SENSE decoding and the device condition taxonomy.
//!
//! Every failed command is followed by a REQUEST SENSE whose 18-byte payload
//! carries a sense key (the category), an additional sense code (ASC) and its
//! qualifier (ASCQ). The key selects one of the per-category tables below;
//! codes missing from a table surface as [`Condition::Unknown`] with the raw
//! values so they can be looked up offline.

use crate::error::{Error, Result};

/// Semantic device conditions. No raw sense bytes escape past this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Condition {
    // no sense
    #[error("end of page")]
    EndOfPage,
    #[error("short read")]
    ShortRead,

    // not ready
    #[error("busy")]
    Busy,

    // medium error
    #[error("paper jam")]
    PaperJam,
    #[error("cover open")]
    CoverOpen,
    #[error("hopper empty")]
    HopperEmpty,
    #[error("unusual paper")]
    UnusualPaper,
    #[error("double feed")]
    DoubleFeed,
    #[error("ADF setup error")]
    AdfSetup,
    #[error("carrier sheet")]
    CarrierSheet,
    #[error("no ink cartridge")]
    NoInkCartridge,
    #[error("no data yet")]
    NoDataYet,
    #[error("endorser error")]
    Endorser,
    #[error("stop button")]
    StopButton,
    #[error("scanning halted")]
    ScanningHalted,
    #[error("not enough paper")]
    NotEnoughPaper,
    #[error("scanning disabled")]
    ScanningDisabled,
    #[error("scanning paused")]
    ScanningPaused,
    #[error("WiFi control error")]
    WifiControl,

    // hardware error
    #[error("EEPROM error")]
    Eeprom,
    #[error("flatbed motor fuse")]
    FlatbedMotorFuse,
    #[error("heater fuse")]
    HeaterFuse,
    #[error("lamp fuse")]
    LampFuse,
    #[error("ADF motor fuse")]
    AdfMotorFuse,
    #[error("mechanical error")]
    Mechanical,
    #[error("optical error")]
    Optical,
    #[error("fan error")]
    Fan,
    #[error("IPC option error")]
    IpcOption,
    #[error("endorser hardware error")]
    EndorserHardware,
    #[error("endorser fuse")]
    EndorserFuse,
    #[error("interface board timeout")]
    InterfaceBoardTimeout,
    #[error("interface board error 1")]
    InterfaceBoard1,
    #[error("interface board error 2")]
    InterfaceBoard2,

    // illegal request
    #[error("paper edge detected too soon")]
    PaperEdgeTooSoon,
    #[error("parameter list error")]
    ParameterList,
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid CDB field")]
    InvalidCdbField,
    #[error("unsupported logical unit")]
    UnsupportedLogicalUnit,
    #[error("invalid field in parameter list")]
    InvalidParameterField,
    #[error("command sequence error")]
    CommandSequence,
    #[error("wrong window combination")]
    WrongWindowCombination,

    // unit attention
    #[error("device reset")]
    DeviceReset,
    #[error("power saving")]
    PowerSaving,

    // aborted command
    #[error("message error")]
    MessageError,
    #[error("select failure")]
    SelectFailure,
    #[error("SCSI parity error")]
    ParityError,
    #[error("initiator error message")]
    InitiatorError,
    #[error("overlapped commands")]
    OverlappedCommands,
    #[error("image transfer error")]
    ImageTransfer,
    #[error("JPEG overflow")]
    JpegOverflow,

    #[error("unknown code: sense key {sense:#04x}, ASC {asc:#04x}, ASCQ {ascq:#04x}")]
    Unknown { sense: u8, asc: u8, ascq: u8 },
}

impl Condition {
    /// Conditions that end a read normally rather than failing it.
    pub fn is_expected(self) -> bool {
        matches!(self, Self::EndOfPage | Self::ShortRead)
    }

    /// Conditions worth waiting out and retrying.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NoDataYet | Self::Busy)
    }
}

/// Sense key, the top-level category of a REQUEST SENSE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    AbortedCommand,
    Other(u8),
}

impl SenseKey {
    /// Only 0x00..=0x0F are sense keys; anything else is [`SenseKey::Other`].
    pub fn from_u8(key: u8) -> Self {
        match key {
            0x00 => Self::NoSense,
            0x02 => Self::NotReady,
            0x03 => Self::MediumError,
            0x04 => Self::HardwareError,
            0x05 => Self::IllegalRequest,
            0x06 => Self::UnitAttention,
            0x0B => Self::AbortedCommand,
            k => Self::Other(k),
        }
    }
}

type Table = &'static [((u8, u8), Condition)];

const MEDIUM_ERROR: Table = &[
    ((0x80, 0x01), Condition::PaperJam),
    ((0x80, 0x02), Condition::CoverOpen),
    ((0x80, 0x03), Condition::HopperEmpty),
    ((0x80, 0x04), Condition::UnusualPaper),
    ((0x80, 0x07), Condition::DoubleFeed),
    ((0x80, 0x08), Condition::AdfSetup),
    ((0x80, 0x09), Condition::CarrierSheet),
    ((0x80, 0x10), Condition::NoInkCartridge),
    ((0x80, 0x13), Condition::NoDataYet),
    ((0x80, 0x14), Condition::Endorser),
    ((0x80, 0x20), Condition::StopButton),
    ((0x80, 0x22), Condition::ScanningHalted),
    ((0x80, 0x30), Condition::NotEnoughPaper),
    ((0x80, 0x31), Condition::ScanningDisabled),
    ((0x80, 0x32), Condition::ScanningPaused),
    ((0x80, 0x33), Condition::WifiControl),
];

const HARDWARE_ERROR: Table = &[
    ((0x44, 0x00), Condition::Eeprom),
    ((0x80, 0x01), Condition::FlatbedMotorFuse),
    ((0x80, 0x02), Condition::HeaterFuse),
    ((0x80, 0x03), Condition::LampFuse),
    ((0x80, 0x04), Condition::AdfMotorFuse),
    ((0x80, 0x05), Condition::Mechanical),
    ((0x80, 0x06), Condition::Optical),
    ((0x80, 0x07), Condition::Fan),
    ((0x80, 0x08), Condition::IpcOption),
    ((0x80, 0x10), Condition::EndorserHardware),
    ((0x80, 0x11), Condition::EndorserFuse),
    ((0x80, 0x80), Condition::InterfaceBoardTimeout),
    ((0x80, 0x81), Condition::InterfaceBoard1),
    ((0x80, 0x82), Condition::InterfaceBoard2),
];

const ILLEGAL_REQUEST: Table = &[
    ((0x00, 0x00), Condition::PaperEdgeTooSoon),
    ((0x1A, 0x00), Condition::ParameterList),
    ((0x20, 0x00), Condition::InvalidCommand),
    ((0x24, 0x00), Condition::InvalidCdbField),
    ((0x25, 0x00), Condition::UnsupportedLogicalUnit),
    ((0x26, 0x00), Condition::InvalidParameterField),
    ((0x2C, 0x00), Condition::CommandSequence),
    ((0x2C, 0x02), Condition::WrongWindowCombination),
];

const UNIT_ATTENTION: Table = &[
    ((0x00, 0x00), Condition::DeviceReset),
    ((0x80, 0x01), Condition::PowerSaving),
];

const ABORTED_COMMAND: Table = &[
    ((0x43, 0x00), Condition::MessageError),
    ((0x45, 0x00), Condition::SelectFailure),
    ((0x47, 0x00), Condition::ParityError),
    ((0x48, 0x00), Condition::InitiatorError),
    ((0x4E, 0x00), Condition::OverlappedCommands),
    ((0x80, 0x01), Condition::ImageTransfer),
    ((0x80, 0x03), Condition::JpegOverflow),
];

fn lookup(table: Table, asc: u8, ascq: u8) -> Option<Condition> {
    table
        .iter()
        .find(|(code, _)| *code == (asc, ascq))
        .map(|&(_, c)| c)
}

/// Translate a sense triple into a condition. `None` means the device is
/// ready and nothing went wrong.
///
/// The EOM/ILI flags of the no-sense category are handled by
/// [`Sense::condition`] before this table lookup.
pub fn translate(sense: u8, asc: u8, ascq: u8) -> Option<Condition> {
    let unknown = Condition::Unknown { sense, asc, ascq };
    let found = match SenseKey::from_u8(sense) {
        SenseKey::NoSense => {
            return match (asc, ascq) {
                (0x80, _) | (0x00, 0x00) => None,
                _ => Some(unknown),
            };
        }
        SenseKey::NotReady => ((asc, ascq) == (0, 0)).then_some(Condition::Busy),
        SenseKey::MediumError => lookup(MEDIUM_ERROR, asc, ascq),
        SenseKey::HardwareError => lookup(HARDWARE_ERROR, asc, ascq),
        SenseKey::IllegalRequest => lookup(ILLEGAL_REQUEST, asc, ascq),
        SenseKey::UnitAttention => lookup(UNIT_ATTENTION, asc, ascq),
        SenseKey::AbortedCommand => lookup(ABORTED_COMMAND, asc, ascq),
        SenseKey::Other(_) => None,
    };
    Some(found.unwrap_or(unknown))
}

/// Length of the REQUEST SENSE payload.
pub const SENSE_LEN: usize = 18;

/// Decoded REQUEST SENSE payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sense {
    pub key: u8,
    pub asc: u8,
    pub ascq: u8,
    /// Residual byte count when `ili` is set.
    pub info: u32,
    /// End of medium: the current page has no more data.
    pub eom: bool,
    /// Incorrect length indicator: fewer bytes were sent than requested.
    pub ili: bool,
}

impl Sense {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 14 {
            return Err(Error::Protocol(format!(
                "sense payload too short: {} bytes",
                buf.len()
            )));
        }
        Ok(Self {
            key: buf[2] & 0x0F,
            asc: buf[12],
            ascq: buf[13],
            info: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
            eom: (buf[2] >> 6) & 1 == 1,
            ili: (buf[2] >> 5) & 1 == 1,
        })
    }

    pub fn condition(&self) -> Option<Condition> {
        if SenseKey::from_u8(self.key) == SenseKey::NoSense {
            if self.asc == 0x80 {
                return None;
            }
            if (self.asc, self.ascq) != (0, 0) {
                return translate(self.key, self.asc, self.ascq);
            }
            if self.eom {
                return Some(Condition::EndOfPage);
            }
            if self.ili {
                return Some(Condition::ShortRead);
            }
            return None;
        }
        translate(self.key, self.asc, self.ascq)
    }
}
