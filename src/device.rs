//! Device session: the fixed setup sequence and the per-sheet commands.
//!
//! The command bytes below were taken from USB captures of the vendor
//! software. Operand layouts follow SCSI-2 where the device is faithful to
//! it; vendor pages are replayed verbatim.

use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::{execute, Request, Response};
use crate::error::{Error, Result};
use crate::page::{Geometry, Side};
use crate::sense::Condition;
use crate::transport::Transport;

/// Bytes requested per READ of image data: 17 rows of A4 at 600 dpi.
pub const CHUNK_LEN: usize = 0x03_dc20;

const INQUIRY: [u8; 6] = [0x12, 0x00, 0x00, 0x00, 0x60, 0x00];
const INQUIRY_LEN: usize = 96;

/// SEND DIAGNOSTIC with a 32-byte parameter list.
const SEND_DIAGNOSTIC: [u8; 6] = [0x1D, 0x00, 0x00, 0x00, 0x20, 0x00];

/// MODE SELECT(6), page format, 12 byte parameter list.
const MODE_SELECT_12: [u8; 6] = [0x15, 0x10, 0x00, 0x00, 0x0C, 0x00];
/// MODE SELECT(6), page format, 14 byte parameter list.
const MODE_SELECT_14: [u8; 6] = [0x15, 0x10, 0x00, 0x00, 0x0E, 0x00];

const SET_WINDOW: [u8; 10] = [0x24, 0, 0, 0, 0, 0, 0x00, 0x00, 0x88, 0];

/// Front and back window descriptors: 600x600 dpi, A4, 24-bit color.
const WINDOW_DESCRIPTORS: [u8; 136] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x00, 0x02, 0x58, 0x02, 0x58, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x26, 0xc0, 0x00, 0x00, 0x36, 0xd0, 0x00, 0x00,
    0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xc1, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x00,
    0x26, 0xc3, 0x00, 0x00, 0x36, 0xd1, 0x00, 0x00, 0x80, 0x00, 0x02, 0x58, 0x02, 0x58, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x26, 0xc0, 0x00, 0x00, 0x36, 0xd0, 0x00, 0x00,
    0x00, 0x05, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0xc1, 0x80, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// SEND, data type 0x83 (brightness lookup table), 266 bytes.
const SEND_LUT: [u8; 10] = [0x2A, 0x00, 0x83, 0x00, 0x00, 0x00, 0x00, 0x01, 0x0A, 0x00];
/// SEND, data type 0x88 (JPEG quantization tables), 138 bytes.
const SEND_QTABLE: [u8; 10] = [0x2A, 0x00, 0x88, 0x00, 0x00, 0x00, 0x00, 0x00, 0x8A, 0x00];

const QTABLE: [u8; 138] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x40, 0x00, 0x00, 0x04, 0x03, 0x03, 0x04, 0x03, 0x03,
    0x04, 0x04, 0x03, 0x04, 0x05, 0x05, 0x04, 0x05, 0x07, 0x0c, 0x07, 0x07, 0x06, 0x06, 0x07, 0x0e,
    0x0a, 0x0b, 0x08, 0x0c, 0x11, 0x0f, 0x12, 0x12, 0x11, 0x0f, 0x10, 0x10, 0x13, 0x15, 0x1b, 0x17,
    0x13, 0x14, 0x1a, 0x14, 0x10, 0x10, 0x18, 0x20, 0x18, 0x1a, 0x1c, 0x1d, 0x1e, 0x1f, 0x1e, 0x12,
    0x17, 0x21, 0x24, 0x21, 0x1e, 0x24, 0x1b, 0x1e, 0x1e, 0x1d, 0x05, 0x05, 0x05, 0x07, 0x06, 0x07,
    0x0e, 0x07, 0x07, 0x0e, 0x1d, 0x13, 0x10, 0x13, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d,
    0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d,
    0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d,
    0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d, 0x1d,
];

/// SCANNER CONTROL, function 0x05: lamp on.
const LAMP_ON: [u8; 10] = [0xF1, 0x05, 0, 0, 0, 0, 0, 0, 0, 0];

/// GET_HW_STATUS CDB: opcode 0xC2, allocation length 12 (at CDB bytes 7-8).
const GET_HW_STATUS: [u8; 10] = [0xC2, 0, 0, 0, 0, 0, 0, 0, 0x0C, 0];
const HW_STATUS_LEN: usize = 12;

/// OBJECT POSITION, load object.
const OBJECT_POSITION: [u8; 10] = [0x31, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];

/// SCAN with a two-entry window list.
const SCAN: [u8; 6] = [0x1B, 0x00, 0x00, 0x00, 0x02, 0x00];
const SCAN_WINDOWS: [u8; 2] = [Side::Front.window_id(), Side::Back.window_id()];

/// READ, vendor data type 0x80: pixel size of the current object.
const READ_PIXEL_SIZE: [u8; 10] = [0x28, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00];
const PIXEL_SIZE_LEN: usize = 32;

fn brightness_lut() -> [u8; 266] {
    let mut lut = [0u8; 266];
    lut[..11].copy_from_slice(&[0x00, 0x00, 0x10, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
    // identity ramp 0x00..=0xfe
    for (i, b) in lut[11..].iter_mut().enumerate() {
        *b = i as u8;
    }
    lut
}

fn preread_params() -> Vec<u8> {
    let mut p = b"SET PRE READMODE".to_vec();
    p.extend_from_slice(&[
        0x02, 0x58, // x resolution: 600 dpi
        0x02, 0x58, // y resolution: 600 dpi
        0x00, 0x00, 0x26, 0xc3, // paper width
        0x00, 0x00, 0x36, 0xd1, // paper length
        0x05, // composition
        0x7f, 0x00, 0x00,
    ]);
    p
}

/// Twelve-byte mode parameter list carrying one vendor page.
fn mode_page(code: u8, b6: u8, b7: u8) -> [u8; 12] {
    [0, 0, 0, 0, code, 0x06, b6, b7, 0, 0, 0, 0]
}

/// The device's answer to INQUIRY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub vendor: String,
    pub product: String,
    pub revision: String,
}

impl Identity {
    pub fn from_inquiry(buf: &[u8]) -> Result<Self> {
        if buf.len() < 36 {
            return Err(Error::Protocol(format!(
                "INQUIRY returned {} bytes",
                buf.len()
            )));
        }
        let field = |r: std::ops::Range<usize>| {
            String::from_utf8_lossy(&buf[r]).trim_end().to_string()
        };
        Ok(Self {
            vendor: field(8..16),
            product: field(16..32),
            revision: field(32..36),
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.vendor, self.product, self.revision)
    }
}

/// Snapshot of scanner hardware state, decoded from GET_HW_STATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HardwareStatus {
    /// Paper present in the hopper.
    pub paper: bool,
    pub omr: bool,
    pub adf_open: bool,
    pub sleep: bool,
    pub send_switch: bool,
    pub manual_feed: bool,
    /// Scan button pressed.
    pub button: bool,
    pub function: u8,
    pub ink_empty: bool,
    pub double_feed: bool,
    pub error_code: u8,
    pub skew_angle: u16,
}

impl HardwareStatus {
    pub fn from_response(buf: &[u8]) -> Result<Self> {
        if buf.len() < 10 {
            return Err(Error::Protocol(format!(
                "GET_HW_STATUS returned {} bytes",
                buf.len()
            )));
        }
        let bit = |byte: usize, n: u8| (buf[byte] >> n) & 1 == 1;
        Ok(Self {
            // inverted: 1 = hopper empty
            paper: !bit(3, 7),
            omr: bit(3, 6),
            adf_open: bit(3, 5),
            sleep: bit(4, 7),
            send_switch: bit(4, 2),
            manual_feed: bit(4, 1),
            button: bit(4, 0),
            function: buf[5] & 0x0F,
            ink_empty: bit(6, 7),
            double_feed: bit(6, 0),
            error_code: buf[7],
            skew_angle: u16::from_be_bytes([buf[8], buf[9]]),
        })
    }
}

/// Dimensions of the object in the feeder, from READ pixel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelSize {
    pub scan_x: u32,
    pub scan_y: u32,
    pub paper_width: u32,
    pub paper_length: u32,
}

impl PixelSize {
    pub fn from_response(buf: &[u8]) -> Result<Self> {
        if buf.len() < 16 {
            return Err(Error::Protocol(format!(
                "pixel size response of {} bytes",
                buf.len()
            )));
        }
        let be = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Ok(Self {
            scan_x: be(0),
            scan_y: be(4),
            paper_width: be(8),
            paper_length: be(12),
        })
    }
}

/// Where a session is in its life.
///
/// ```text
/// Disconnected → Initializing → Ready → Scanning(sheet, side) → Ready → …
///       ↑                                                              │
///       └────────────────────── error / close ─────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Initializing,
    Ready,
    Scanning { sheet: u32, side: Side, phase: Phase },
}

/// Sub-state of a channel while a sheet is being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    AwaitingChunk,
    Buffering,
    Flushing,
}

/// Retry policy for the "no data yet" condition.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    pub limit: u32,
    pub delay: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            limit: 120,
            delay: Duration::from_millis(500),
        }
    }
}

/// A chunk of raw image data for one side.
#[derive(Debug)]
pub struct Chunk {
    pub data: Vec<u8>,
    /// The device has no more data for this side of the sheet.
    pub end_of_page: bool,
    /// The device sent less than requested.
    pub short_read: bool,
}

/// An open connection to the scanner.
pub struct Session<T: Transport> {
    dev: T,
    state: State,
    geometry: Geometry,
    retry: Retry,
}

impl<T: Transport> Session<T> {
    pub fn new(dev: T, geometry: Geometry, retry: Retry) -> Self {
        Self {
            dev,
            state: State::Disconnected,
            geometry,
            retry,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn retry(&self) -> Retry {
        self.retry
    }

    pub fn set_state(&mut self, state: State) {
        if state != self.state {
            debug!("session: {:?} → {:?}", self.state, state);
            self.state = state;
        }
    }

    pub fn into_transport(self) -> T {
        self.dev
    }

    fn run(&mut self, req: &Request) -> Result<Response> {
        match execute(&mut self.dev, req) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                self.set_state(State::Disconnected);
                Err(e)
            }
        }
    }

    /// Run the fixed setup sequence. Any failure aborts the session.
    pub fn initialize(&mut self) -> Result<Identity> {
        self.set_state(State::Initializing);

        let identity = self.inquire()?;
        info!("scanner: {identity}");

        // 600 dpi preread
        self.run(&Request::new(&SEND_DIAGNOSTIC).payload(&preread_params()))?;

        // auto paper size / overscan
        self.run(&Request::new(&MODE_SELECT_12).payload(&mode_page(0x3C, 0, 0)))?;
        // double feed detection
        self.run(&Request::new(&MODE_SELECT_12).payload(&mode_page(0x38, 0, 0)))?;
        // background color
        self.run(&Request::new(&MODE_SELECT_12).payload(&mode_page(0x37, 0, 0)))?;
        // dropout color
        let mut dropout = [0u8; 14];
        dropout[4] = 0x39;
        dropout[5] = 0x08;
        self.run(&Request::new(&MODE_SELECT_14).payload(&dropout))?;
        // buffering
        self.run(&Request::new(&MODE_SELECT_12).payload(&mode_page(0x3A, 0x80, 0xC0)))?;
        // prepick
        self.run(&Request::new(&MODE_SELECT_12).payload(&mode_page(0x33, 0, 0)))?;

        self.run(&Request::new(&SET_WINDOW).payload(&WINDOW_DESCRIPTORS))?;
        self.run(&Request::new(&SEND_LUT).payload(&brightness_lut()))?;
        self.run(&Request::new(&SEND_QTABLE).payload(&QTABLE))?;
        self.run(&Request::new(&LAMP_ON))?;

        let status = self.hardware_status()?;
        debug!("initial status: {status:?}");

        self.set_state(State::Ready);
        Ok(identity)
    }

    pub fn inquire(&mut self) -> Result<Identity> {
        let resp = self.run(&Request::new(&INQUIRY).response_len(INQUIRY_LEN))?;
        Identity::from_inquiry(&resp.data)
    }

    pub fn hardware_status(&mut self) -> Result<HardwareStatus> {
        let resp = self.run(&Request::new(&GET_HW_STATUS).response_len(HW_STATUS_LEN))?;
        HardwareStatus::from_response(&resp.data)
    }

    /// Pull the next sheet into the feeder. Returns `false` when the hopper
    /// is empty.
    pub fn load_paper(&mut self) -> Result<bool> {
        match execute(&mut self.dev, &Request::new(&OBJECT_POSITION)) {
            Ok(_) => Ok(true),
            Err(Error::Device(Condition::HopperEmpty)) => Ok(false),
            Err(e) => {
                self.set_state(State::Disconnected);
                Err(e)
            }
        }
    }

    pub fn start_scan(&mut self) -> Result<()> {
        self.run(&Request::new(&SCAN).payload(&SCAN_WINDOWS))?;
        Ok(())
    }

    /// Read the pixel size of the sheet and check it against the geometry
    /// the pipeline was set up for.
    pub fn pixel_size(&mut self) -> Result<PixelSize> {
        let resp = self.run(&Request::new(&READ_PIXEL_SIZE).response_len(PIXEL_SIZE_LEN))?;
        let size = PixelSize::from_response(&resp.data)?;
        if size.scan_x as usize != self.geometry.width {
            return Err(Error::Protocol(format!(
                "scan width {} does not match expected {}",
                size.scan_x, self.geometry.width
            )));
        }
        if size.scan_y as usize != self.geometry.height {
            warn!(
                "scan height {} differs from expected {}",
                size.scan_y, self.geometry.height
            );
        }
        Ok(size)
    }

    /// Select `side` for the next READ (vendor "read image control").
    /// Waits out transient conditions up to the retry limit.
    pub fn select_channel(&mut self, side: Side) -> Result<()> {
        let [hi, mid, lo] = len24(CHUNK_LEN);
        let cdb = [0xF1, 0x10, side.window_id(), 0, 0, 0, hi, mid, lo, 0];
        let req = Request::new(&cdb);
        let mut tries = 0;
        loop {
            tries += 1;
            match execute(&mut self.dev, &req) {
                Ok(_) => return Ok(()),
                Err(Error::Device(c)) if c.is_transient() && tries < self.retry.limit => {
                    warn!("{side}: {c}, retrying ({tries} of {})", self.retry.limit);
                    thread::sleep(self.retry.delay);
                }
                Err(Error::Device(c)) if c.is_transient() => {
                    self.set_state(State::Disconnected);
                    return Err(Error::DataTimeout { side, tries });
                }
                Err(e) => {
                    self.set_state(State::Disconnected);
                    return Err(e);
                }
            }
        }
    }

    /// READ one chunk of image data for `side`. Transient conditions are
    /// returned as errors so the caller can pace its retries.
    pub fn read_chunk(&mut self, side: Side) -> Result<Chunk> {
        let [hi, mid, lo] = len24(CHUNK_LEN);
        let cdb = [0x28, 0x00, 0x00, 0x00, 0x00, side.window_id(), hi, mid, lo, 0x00];
        let resp = match execute(&mut self.dev, &Request::new(&cdb).response_len(CHUNK_LEN)) {
            Ok(resp) => resp,
            Err(Error::Device(c)) if c.is_transient() => return Err(Error::Device(c)),
            Err(e) => {
                self.set_state(State::Disconnected);
                return Err(e);
            }
        };
        let mut data = resp.data;
        // the device sends inverted samples
        for b in &mut data {
            *b = !*b;
        }
        let end_of_page = resp.condition == Some(Condition::EndOfPage);
        let short_read = resp.condition == Some(Condition::ShortRead);
        if short_read {
            debug!("{side}: short read of {} bytes", data.len());
        }
        Ok(Chunk {
            data,
            end_of_page,
            short_read,
        })
    }
}

fn len24(n: usize) -> [u8; 3] {
    let b = (n as u32).to_be_bytes();
    [b[1], b[2], b[3]]
}
