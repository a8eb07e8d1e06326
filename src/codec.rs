//! Command/response framing.
//!
//! SCSI commands are wrapped in a 31-byte envelope:
//!
//! ```text
//! byte 0:     0x43  (Fujitsu USB_COMMAND_CODE)
//! bytes 1-18: 0x00  (padding)
//! bytes 19+:  SCSI CDB (up to 12 bytes)
//! ```
//!
//! A command runs in three phases: the envelope (plus an optional outgoing
//! payload), an optional incoming payload, and a status envelope starting
//! with 0x53 whose byte 9 is zero on success.

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::sense::{Condition, Sense, SENSE_LEN};
use crate::transport::{hex, Transport};

pub const COMMAND_LEN: usize = 31;
const CDB_OFFSET: usize = 0x13;
const MAX_CDB_LEN: usize = COMMAND_LEN - CDB_OFFSET;
const STATUS_BUF_LEN: usize = 32;
const STATUS_OFFSET: usize = 9;

/// REQUEST SENSE CDB with an 18-byte allocation length.
const REQUEST_SENSE: [u8; 6] = [0x03, 0x00, 0x00, 0x00, SENSE_LEN as u8, 0x00];

/// Wrap a SCSI CDB in the 31-byte Fujitsu USB command envelope.
pub fn envelope(cdb: &[u8]) -> [u8; COMMAND_LEN] {
    let mut buf = [0u8; COMMAND_LEN];
    buf[0] = 0x43;
    let n = cdb.len().min(MAX_CDB_LEN);
    buf[CDB_OFFSET..CDB_OFFSET + n].copy_from_slice(&cdb[..n]);
    buf
}

/// A command to issue: CDB, outgoing payload and expected incoming length.
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub cdb: &'a [u8],
    pub payload: &'a [u8],
    pub response_len: usize,
}

impl<'a> Request<'a> {
    pub fn new(cdb: &'a [u8]) -> Self {
        Self {
            cdb,
            payload: &[],
            response_len: 0,
        }
    }

    pub fn payload(mut self, payload: &'a [u8]) -> Self {
        self.payload = payload;
        self
    }

    pub fn response_len(mut self, len: usize) -> Self {
        self.response_len = len;
        self
    }
}

#[derive(Debug, Default)]
pub struct Response {
    /// Raw status envelope.
    pub status: Vec<u8>,
    /// Incoming payload, truncated to what the device actually sent.
    pub data: Vec<u8>,
    /// Set when the command completed with an expected condition
    /// (end of page, short read). `data` is valid in both cases.
    pub condition: Option<Condition>,
}

impl Response {
    fn status_byte(&self) -> Result<u8> {
        self.status.get(STATUS_OFFSET).copied().ok_or_else(|| {
            Error::Protocol(format!(
                "status envelope too short: {}",
                hex(&self.status, STATUS_BUF_LEN)
            ))
        })
    }
}

/// Run one command without the automatic REQUEST SENSE follow-up.
pub fn execute_raw<T: Transport + ?Sized>(dev: &mut T, req: &Request) -> Result<Response> {
    let cmd = envelope(req.cdb);
    debug!("cmd: {}", hex(&req.cdb[..req.cdb.len().min(MAX_CDB_LEN)], MAX_CDB_LEN));
    dev.write(&cmd)?;

    if !req.payload.is_empty() {
        debug!("payload: {}", hex(req.payload, 16));
        dev.write(req.payload)?;
    }

    let mut resp = Response::default();
    if req.response_len > 0 {
        resp.data = vec![0u8; req.response_len];
        let n = dev.read(&mut resp.data)?;
        resp.data.truncate(n);
        debug!("data: {}", hex(&resp.data, 10));
    }

    resp.status = vec![0u8; STATUS_BUF_LEN];
    let n = dev.read(&mut resp.status)?;
    resp.status.truncate(n);
    debug!("status: {}", hex(&resp.status, STATUS_BUF_LEN));
    Ok(resp)
}

/// Issue REQUEST SENSE and decode the answer.
pub fn request_sense<T: Transport + ?Sized>(dev: &mut T) -> Result<Sense> {
    let resp = execute_raw(dev, &Request::new(&REQUEST_SENSE).response_len(SENSE_LEN))?;
    if resp.status_byte()? != 0 {
        warn!("REQUEST SENSE itself reported failure");
    }
    Sense::parse(&resp.data)
}

/// Run one command. A non-zero status triggers REQUEST SENSE; the sense is
/// translated into a [`Condition`].
///
/// Failing status does not always mean failure: the device reports end of
/// page and short reads this way, and a sense of "no sense" means the
/// command succeeded after all. Those come back as `Ok` with
/// [`Response::condition`] set (or unset). Every other condition is an
/// `Err(Error::Device)`.
pub fn execute<T: Transport + ?Sized>(dev: &mut T, req: &Request) -> Result<Response> {
    let mut resp = execute_raw(dev, req)?;
    if resp.status_byte()? == 0 {
        return Ok(resp);
    }

    let sense = request_sense(dev)?;
    debug!("sense: {sense:?}");

    if sense.ili {
        let keep = resp.data.len().saturating_sub(sense.info as usize);
        resp.data.truncate(keep);
    }

    match sense.condition() {
        None => Ok(resp),
        Some(c) if c.is_expected() => {
            resp.condition = Some(c);
            Ok(resp)
        }
        Some(c) => Err(Error::Device(c)),
    }
}
