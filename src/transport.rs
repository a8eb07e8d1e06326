//! Raw bulk transfers to the scanner.
//!
//! The iX500 uses vendor-specific USB (class FF:FF:FF) with one bulk
//! endpoint per direction. Every command, payload and status block travels
//! over this pair; there is no interrupt or control traffic.

use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};

pub const VID: u16 = 0x04C5;
pub const PID: u16 = 0x132B;
pub const EP_OUT: u8 = 0x02;
pub const EP_IN: u8 = 0x81;
pub const IFACE: u8 = 0;

pub const USB_TIMEOUT: Duration = Duration::from_secs(3);

/// A single blocking bulk endpoint pair.
///
/// Errors are surfaced as-is; a transport never retries on its own.
pub trait Transport: Send {
    /// Read up to `buf.len()` bytes from the device, returning the count.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` to the device.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        (**self).write(buf)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
mod usb {
    use super::*;

    /// libusb-backed transport holding the claimed scanner interface.
    pub struct UsbTransport {
        handle: rusb::DeviceHandle<rusb::Context>,
    }

    impl UsbTransport {
        /// Open the scanner and claim its interface. Claiming is exclusive,
        /// so only one session can talk to the device at a time.
        pub fn open(ctx: &rusb::Context) -> Result<Self> {
            use rusb::UsbContext;

            let handle = ctx
                .open_device_with_vid_pid(VID, PID)
                .ok_or(Error::DeviceNotFound { vid: VID, pid: PID })?;
            let _ = handle.set_auto_detach_kernel_driver(true);
            handle.claim_interface(IFACE)?;
            debug!("usb: claimed {VID:04x}:{PID:04x}");
            Ok(Self { handle })
        }

        /// Release the interface. The transport is consumed.
        pub fn close(self) -> Result<()> {
            self.handle.release_interface(IFACE)?;
            debug!("usb: released");
            Ok(())
        }
    }

    impl Transport for UsbTransport {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            Ok(self.handle.read_bulk(EP_IN, buf, USB_TIMEOUT)?)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize> {
            Ok(self.handle.write_bulk(EP_OUT, buf, USB_TIMEOUT)?)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
mod usb {
    use super::*;

    pub struct UsbTransport;

    impl UsbTransport {
        pub fn open(_ctx: &rusb::Context) -> Result<Self> {
            Err(Error::UnsupportedPlatform)
        }

        pub fn close(self) -> Result<()> {
            Ok(())
        }
    }

    impl Transport for UsbTransport {
        fn read(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Err(Error::UnsupportedPlatform)
        }

        fn write(&mut self, _buf: &[u8]) -> Result<usize> {
            Err(Error::UnsupportedPlatform)
        }
    }
}

pub use usb::UsbTransport;

/// Hex dump of the first `max` bytes, for debug logging.
pub fn hex(buf: &[u8], max: usize) -> String {
    let mut s = buf
        .iter()
        .take(max)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ");
    if buf.len() > max {
        s.push_str(&format!(" … ({} bytes)", buf.len()));
    }
    s
}
