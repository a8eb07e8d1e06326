//! Test doubles for the transport.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::page::{Geometry, Side};
use crate::sense::SENSE_LEN;
use crate::transport::Transport;

fn read_into(reads: &mut VecDeque<Vec<u8>>, buf: &mut [u8]) -> Result<usize> {
    let Some(next) = reads.pop_front() else {
        return Err(Error::Usb(rusb::Error::Timeout));
    };
    let n = next.len().min(buf.len());
    buf[..n].copy_from_slice(&next[..n]);
    Ok(n)
}

/// Replays canned reads and records every write.
pub struct ScriptedTransport {
    reads: VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
}

impl ScriptedTransport {
    pub fn new(reads: Vec<Vec<u8>>) -> Self {
        Self {
            reads: reads.into(),
            written: Vec::new(),
        }
    }
}

impl Transport for ScriptedTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_into(&mut self.reads, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.written.push(buf.to_vec());
        Ok(buf.len())
    }
}

/// Page content of one sheet, as it would appear upright on paper.
pub struct Sheet {
    pub front: Vec<u8>,
    pub back: Vec<u8>,
}

impl Sheet {
    pub fn filled(g: &Geometry, front: u8, back: u8) -> Self {
        let len = g.row_bytes() * g.height;
        Self {
            front: vec![front; len],
            back: vec![back; len],
        }
    }

    pub fn blank(g: &Geometry) -> Self {
        Self::filled(g, 0xff, 0xff)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    Load,
    Select(u8),
}

type SenseTriple = (u8, u8, u8);

const HOPPER_EMPTY: SenseTriple = (0x03, 0x80, 0x03);
const NO_DATA: SenseTriple = (0x03, 0x80, 0x13);
const PAPER_JAM: SenseTriple = (0x03, 0x80, 0x01);
const BUSY: SenseTriple = (0x02, 0x00, 0x00);

/// A simulated iX500 speaking the command protocol.
pub struct FakeScanner {
    geometry: Geometry,
    sheets: VecDeque<Sheet>,
    current: Option<Sheet>,
    cursor: [usize; 2],
    rows_per_read: usize,
    reads: VecDeque<Vec<u8>>,
    sense: [u8; SENSE_LEN],
    expect_payload: Option<u8>,
    commands: Vec<Vec<u8>>,
    payloads: Vec<(u8, Vec<u8>)>,
    failures: HashMap<u8, SenseTriple>,
    busy_selects: u32,
    no_data_reads: u32,
    image_reads: u32,
    jam_on_read: Option<u32>,
    width: u32,
}

impl FakeScanner {
    pub fn new(geometry: Geometry, sheets: Vec<Sheet>) -> Self {
        Self {
            geometry,
            sheets: sheets.into(),
            current: None,
            cursor: [0; 2],
            rows_per_read: 3,
            reads: VecDeque::new(),
            sense: [0; SENSE_LEN],
            expect_payload: None,
            commands: Vec::new(),
            payloads: Vec::new(),
            failures: HashMap::new(),
            busy_selects: 0,
            no_data_reads: 0,
            image_reads: 0,
            jam_on_read: None,
            width: geometry.width as u32,
        }
    }

    /// Fail every command with `opcode` with the given sense.
    pub fn fail_opcode(&mut self, opcode: u8, sense: SenseTriple) {
        self.failures.insert(opcode, sense);
    }

    pub fn busy_selects(&mut self, n: u32) {
        self.busy_selects = n;
    }

    /// Answer the next `n` image reads with "no data yet".
    pub fn no_data_reads(&mut self, n: u32) {
        self.no_data_reads = n;
    }

    /// Jam on the `n`-th image read (1-based).
    pub fn jam_on_read(&mut self, n: u32) {
        self.jam_on_read = Some(n);
    }

    pub fn rows_per_read(&mut self, n: usize) {
        self.rows_per_read = n;
    }

    pub fn report_width(&mut self, width: u32) {
        self.width = width;
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.commands.iter().map(|c| c[0]).collect()
    }

    /// Vendor page codes sent with MODE SELECT, in order.
    pub fn mode_pages(&self) -> Vec<u8> {
        self.payloads
            .iter()
            .filter(|(op, _)| *op == 0x15)
            .map(|(_, p)| p[4])
            .collect()
    }

    pub fn channel_trace(&self) -> Vec<TraceEvent> {
        self.commands
            .iter()
            .filter_map(|c| match (c[0], c[1]) {
                (0x31, _) => Some(TraceEvent::Load),
                (0xF1, 0x10) => Some(TraceEvent::Select(c[2])),
                _ => None,
            })
            .collect()
    }

    fn status(&mut self, code: u8) {
        let mut s = vec![0u8; 13];
        s[0] = 0x53;
        s[9] = code;
        self.reads.push_back(s);
    }

    fn ok(&mut self, data: Option<Vec<u8>>) {
        if let Some(d) = data {
            self.reads.push_back(d);
        }
        self.status(0);
    }

    fn fail(&mut self, data: Option<Vec<u8>>, byte2: u8, (key, asc, ascq): SenseTriple) {
        self.sense = [0; SENSE_LEN];
        self.sense[0] = 0xF0;
        self.sense[2] = byte2 | key;
        self.sense[12] = asc;
        self.sense[13] = ascq;
        if let Some(d) = data {
            self.reads.push_back(d);
        }
        self.status(1);
    }

    fn read_image(&mut self, window: u8) {
        self.image_reads += 1;
        if self.jam_on_read == Some(self.image_reads) {
            return self.fail(Some(Vec::new()), 0, PAPER_JAM);
        }
        if self.no_data_reads > 0 {
            self.no_data_reads -= 1;
            return self.fail(Some(Vec::new()), 0, NO_DATA);
        }
        let side = if window == Side::Back.window_id() {
            Side::Back
        } else {
            Side::Front
        };
        let Some(sheet) = &self.current else {
            return self.fail(Some(Vec::new()), 0, (0x05, 0x2C, 0x00));
        };
        let page = match side {
            Side::Front => &sheet.front,
            Side::Back => &sheet.back,
        };
        let at = self.cursor[side.index()];
        let end = (at + self.rows_per_read * self.geometry.row_bytes()).min(page.len());
        let data: Vec<u8> = page[at..end].iter().map(|b| !b).collect();
        self.cursor[side.index()] = end;
        if end == page.len() {
            // end of medium
            self.fail(Some(data), 0x40, (0, 0, 0));
        } else {
            self.ok(Some(data));
        }
    }

    fn command(&mut self, cdb: &[u8]) {
        self.commands.push(cdb.to_vec());
        let op = cdb[0];
        if matches!(op, 0x1D | 0x15 | 0x24 | 0x2A | 0x1B) {
            self.expect_payload = Some(op);
        }
        let has_data = matches!(op, 0x03 | 0x12 | 0xC2 | 0x28);
        if let Some(&sense) = self.failures.get(&op) {
            return self.fail(has_data.then(Vec::new), 0, sense);
        }
        match op {
            0x03 => {
                let sense = self.sense.to_vec();
                self.sense = [0; SENSE_LEN];
                self.ok(Some(sense));
            }
            0x12 => {
                let mut id = vec![0u8; 96];
                id[8..16].copy_from_slice(b"FUJITSU ");
                id[16..32].copy_from_slice(b"ScanSnap iX500  ");
                id[32..36].copy_from_slice(b"0M00");
                self.ok(Some(id));
            }
            0xC2 => {
                let mut st = vec![0u8; 12];
                if self.sheets.is_empty() {
                    st[3] = 0x80;
                }
                self.ok(Some(st));
            }
            0x31 => match self.sheets.pop_front() {
                Some(sheet) => {
                    self.current = Some(sheet);
                    self.cursor = [0; 2];
                    self.ok(None);
                }
                None => {
                    self.current = None;
                    self.fail(None, 0, HOPPER_EMPTY);
                }
            },
            0x28 if cdb[2] == 0x80 => {
                let mut size = vec![0u8; 32];
                size[0..4].copy_from_slice(&self.width.to_be_bytes());
                size[4..8].copy_from_slice(&(self.geometry.height as u32).to_be_bytes());
                self.ok(Some(size));
            }
            0x28 => self.read_image(cdb[5]),
            0xF1 if cdb[1] == 0x10 && self.busy_selects > 0 => {
                self.busy_selects -= 1;
                self.fail(None, 0, BUSY);
            }
            _ => self.ok(None),
        }
    }
}

impl Transport for FakeScanner {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        read_into(&mut self.reads, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if let Some(op) = self.expect_payload.take() {
            self.payloads.push((op, buf.to_vec()));
            return Ok(buf.len());
        }
        if buf.len() != 31 || buf[0] != 0x43 {
            return Err(Error::Protocol(format!("fake: bad envelope of {} bytes", buf.len())));
        }
        self.command(&buf[0x13..]);
        Ok(buf.len())
    }
}
