//! Per-page processing that overlaps with acquisition.
//!
//! Each side of the sheet in the feeder gets its own worker thread. The
//! acquisition loop appends raw bytes to the side's [`RowBuffer`]; whenever
//! at least one row block has accumulated, the aligned part is handed to the
//! worker, which feeds the encoder and binarizes into the page bitmap.
//!
//! ```text
//! read chunk ──→ RowBuffer ──(row blocks)──→ worker ─┬─→ encoder
//!                                                    └─→ binarize + rotate
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};

use crate::encoder::{EncoderFactory, StreamEncoder};
use crate::error::{Error, Result};
use crate::page::{Bitmap, Geometry, Page, Side};
use crate::pixel::{binarize_rotated, PixelStrategy};

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub geometry: Geometry,
    pub strategy: PixelStrategy,
    /// Chunks a worker may have queued before the hand-off is considered
    /// broken.
    pub backlog: usize,
    /// White ratio above which a page is flagged blank.
    pub blank_threshold: f64,
}

/// Pending bytes of one channel, cut into row-block-aligned pieces.
#[derive(Debug)]
pub struct RowBuffer {
    pending: Vec<u8>,
    block_bytes: usize,
}

impl RowBuffer {
    pub fn new(block_bytes: usize) -> Self {
        Self {
            pending: Vec::with_capacity(block_bytes),
            block_bytes,
        }
    }

    /// Append `data` and return the largest whole number of row blocks
    /// available, if any. The returned buffer is owned by the caller; the
    /// remainder stays pending.
    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let n = self.pending.len() / self.block_bytes * self.block_bytes;
        if n == 0 {
            return None;
        }
        let rest = self.pending.split_off(n);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Take whatever is left, usually less than a row block.
    pub fn take_rest(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

struct WorkerOutput {
    encoded: Vec<u8>,
    bitmap: Bitmap,
    white: usize,
    rows: usize,
}

fn run_worker(
    rx: Receiver<Vec<u8>>,
    mut enc: Box<dyn StreamEncoder>,
    geometry: Geometry,
    strategy: PixelStrategy,
    cancel: &AtomicBool,
) -> Result<WorkerOutput> {
    let row_bytes = geometry.row_bytes();
    let block_bytes = geometry.block_bytes();
    let mut bitmap = Bitmap::new(geometry.width, geometry.height);
    let mut white = 0;
    let mut offset = 0;

    for mut chunk in rx {
        if cancel.load(Ordering::Relaxed) {
            // keep draining so the sender never sees a full channel
            continue;
        }
        if chunk.len() % row_bytes != 0 {
            warn!(
                "dropping {} trailing bytes of a partial row",
                chunk.len() % row_bytes
            );
        }
        let rows = chunk.len() / row_bytes;
        if rows == 0 {
            continue;
        }
        chunk.truncate(rows * row_bytes);
        let padded = chunk.len().div_ceil(block_bytes) * block_bytes;
        chunk.resize(padded, 0);

        enc.encode_rows(&chunk, rows)?;
        white += binarize_rotated(&chunk, rows, &geometry, &mut bitmap, offset, strategy);
        offset += rows;
    }

    if cancel.load(Ordering::Relaxed) {
        return Err(Error::Pipeline("discarded".into()));
    }
    Ok(WorkerOutput {
        encoded: enc.finish()?,
        bitmap,
        white,
        rows: offset,
    })
}

struct Channel {
    side: Side,
    buffer: RowBuffer,
    tx: Option<SyncSender<Vec<u8>>>,
    /// `None` once the worker has been joined.
    handle: Option<JoinHandle<Result<WorkerOutput>>>,
    cancel: Arc<AtomicBool>,
}

impl Channel {
    fn spawn(side: Side, opts: &PipelineOptions, factory: &EncoderFactory) -> Result<Self> {
        let enc = factory(side, &opts.geometry)?;
        let (tx, rx) = mpsc::sync_channel(opts.backlog);
        let geometry = opts.geometry;
        let strategy = opts.strategy;
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("page-{side}"))
            .spawn(move || run_worker(rx, enc, geometry, strategy, &flag))?;
        Ok(Self {
            side,
            buffer: RowBuffer::new(opts.geometry.block_bytes()),
            tx: Some(tx),
            handle: Some(handle),
            cancel,
        })
    }

    fn dispatch(&mut self, chunk: Vec<u8>) -> Result<()> {
        let Some(tx) = &self.tx else {
            return Err(Error::Pipeline(format!("{} worker already closed", self.side)));
        };
        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Pipeline(format!(
                "{} worker backlog full",
                self.side
            ))),
            Err(TrySendError::Disconnected(_)) => {
                // the worker only hangs up when it failed; report why
                match self.wait() {
                    Err(e) => Err(e),
                    Ok(_) => Err(Error::Pipeline(format!("{} worker exited early", self.side))),
                }
            }
        }
    }

    /// Close the channel and wait for the worker.
    fn wait(&mut self) -> Result<WorkerOutput> {
        self.tx = None;
        let Some(handle) = self.handle.take() else {
            return Err(Error::Pipeline(format!("{} worker already stopped", self.side)));
        };
        handle
            .join()
            .map_err(|_| Error::Pipeline(format!("{} worker panicked", self.side)))?
    }

    fn flush(&mut self) -> Result<()> {
        let rest = self.buffer.take_rest();
        if rest.is_empty() {
            return Ok(());
        }
        debug!("{}: flushing {} remaining bytes", self.side, rest.len());
        self.dispatch(rest)
    }
}

/// Workers and buffers for both sides of the sheet in the feeder.
pub struct SheetPipeline {
    channels: [Channel; 2],
    opts: PipelineOptions,
}

impl SheetPipeline {
    pub fn start(opts: &PipelineOptions, factory: &EncoderFactory) -> Result<Self> {
        let mut front = Channel::spawn(Side::Front, opts, factory)?;
        let back = match Channel::spawn(Side::Back, opts, factory) {
            Ok(c) => c,
            Err(e) => {
                let _ = front.wait();
                return Err(e);
            }
        };
        Ok(Self {
            channels: [front, back],
            opts: *opts,
        })
    }

    /// Buffer raw bytes for `side`, dispatching whole row blocks.
    pub fn push(&mut self, side: Side, data: &[u8]) -> Result<()> {
        let ch = &mut self.channels[side.index()];
        match ch.buffer.push(data) {
            Some(chunk) => ch.dispatch(chunk),
            None => Ok(()),
        }
    }

    /// Bytes buffered but not yet dispatched for `side`.
    pub fn pending(&self, side: Side) -> usize {
        self.channels[side.index()].buffer.pending()
    }

    /// Hand the remainder buffered for `side` to its worker.
    pub fn flush(&mut self, side: Side) -> Result<()> {
        self.channels[side.index()].flush()
    }

    /// Flush what is still buffered, wait for both workers and build the
    /// pages, front first.
    pub fn finish(self) -> Result<[Page; 2]> {
        let [mut front, mut back] = self.channels;
        // a flush into a failed worker already carries that worker's error
        let flushed = front.flush().and_then(|()| back.flush());
        let [f, b] = [front.wait(), back.wait()];
        flushed?;
        let (f, b) = (f?, b?);

        let pixels = self.opts.geometry.pixels() as f64;
        let threshold = self.opts.blank_threshold;
        let page = |side: Side, out: WorkerOutput| {
            let white_ratio = out.white as f64 / pixels;
            debug!(
                "{side}: {} rows, {} encoded bytes, {:.4} white",
                out.rows,
                out.encoded.len(),
                white_ratio
            );
            Page {
                side,
                encoded: out.encoded,
                bitmap: out.bitmap,
                white_ratio,
                blank: white_ratio > threshold,
            }
        };
        Ok([page(Side::Front, f), page(Side::Back, b)])
    }

    /// Stop both workers and discard whatever they produced. Chunks still
    /// queued are drained without being encoded.
    pub fn abort(self) {
        for ch in &self.channels {
            ch.cancel.store(true, Ordering::Relaxed);
        }
        for mut ch in self.channels {
            if let Err(e) = ch.wait() {
                debug!("{}: discarded worker result: {e}", ch.side);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{PageEncoder, PageFormat};
    use image::GenericImageView;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    const G: Geometry = Geometry {
        width: 4,
        height: 6,
        row_block: 2,
    };

    fn opts() -> PipelineOptions {
        PipelineOptions {
            geometry: G,
            strategy: PixelStrategy::Table,
            backlog: 16,
            blank_threshold: 0.99,
        }
    }

    #[test]
    fn row_buffer_cuts_whole_blocks() {
        let mut buf = RowBuffer::new(10);
        assert_eq!(buf.push(&[1; 7]), None);
        assert_eq!(buf.push(&[2; 15]).map(|c| c.len()), Some(20));
        assert_eq!(buf.pending(), 2);
        assert_eq!(buf.take_rest(), vec![2, 2]);
        assert_eq!(buf.pending(), 0);
    }

    proptest! {
        #[test]
        fn row_buffer_conserves_bytes(
            block in 1usize..64,
            sizes in proptest::collection::vec(0usize..300, 0..40),
        ) {
            let mut buf = RowBuffer::new(block);
            let mut input = Vec::new();
            let mut output = Vec::new();
            for (i, n) in sizes.iter().enumerate() {
                let data: Vec<u8> = (0..*n).map(|j| (i * 31 + j) as u8).collect();
                input.extend_from_slice(&data);
                if let Some(chunk) = buf.push(&data) {
                    prop_assert_eq!(chunk.len() % block, 0);
                    output.extend_from_slice(&chunk);
                }
            }
            let rest = buf.take_rest();
            prop_assert!(rest.len() < block);
            output.extend_from_slice(&rest);
            prop_assert_eq!(output.len(), input.len());
            prop_assert_eq!(output, input);
        }
    }

    fn rows(n: usize, value: u8) -> Vec<u8> {
        vec![value; n * G.row_bytes()]
    }

    fn png() -> Box<EncoderFactory> {
        PageEncoder::factory(PageFormat::Png)
    }

    fn dimensions(encoded: &[u8]) -> (u32, u32) {
        image::load_from_memory(encoded).unwrap().dimensions()
    }

    #[test]
    fn full_page_round_trip() {
        let mut p = SheetPipeline::start(&opts(), &*png()).unwrap();
        p.push(Side::Front, &rows(3, 255)).unwrap();
        p.push(Side::Back, &rows(6, 0)).unwrap();
        p.push(Side::Front, &rows(3, 255)).unwrap();
        let [front, back] = p.finish().unwrap();

        assert_eq!(front.side, Side::Front);
        assert_eq!(front.white_ratio, 1.0);
        assert!(front.blank);
        assert!(front.bitmap.pix.iter().all(|&b| b == 0xff));

        assert_eq!(back.white_ratio, 0.0);
        assert!(!back.blank);
        assert_eq!(dimensions(&back.encoded), (4, 6));
    }

    #[test]
    fn one_row_short_leaves_last_bitmap_row_zero() {
        let mut p = SheetPipeline::start(&opts(), &*png()).unwrap();
        // 5 of 6 rows, delivered unevenly: 1 block, then the remainder
        p.push(Side::Front, &rows(2, 255)).unwrap();
        assert_eq!(p.pending(Side::Front), 0);
        p.push(Side::Front, &rows(3, 255)).unwrap();
        assert_eq!(p.pending(Side::Front), G.row_bytes());
        let [front, _] = p.finish().unwrap();

        // rotated: the missing last source row is bitmap row 0
        assert_eq!(front.bitmap.row(0), &[0, 0, 0, 0]);
        for y in 1..G.height {
            assert_eq!(front.bitmap.row(y), &[0xff; 4]);
        }
        assert_eq!(dimensions(&front.encoded), (4, 5));
        assert!((front.white_ratio - 5.0 / 6.0).abs() < 1e-9);
    }

    struct Recording(Arc<Mutex<Vec<(usize, usize)>>>);

    impl StreamEncoder for Recording {
        fn encode_rows(&mut self, pixels: &[u8], rows: usize) -> Result<()> {
            self.0.lock().unwrap().push((pixels.len(), rows));
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn encoder_sees_padded_blocks_and_true_row_count() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let shared = calls.clone();
        let factory: Box<EncoderFactory> = Box::new(move |side, _| {
            let log = if side == Side::Front {
                shared.clone()
            } else {
                Arc::new(Mutex::new(Vec::new()))
            };
            Ok(Box::new(Recording(log)) as Box<dyn StreamEncoder>)
        });
        let mut p = SheetPipeline::start(&opts(), &*factory).unwrap();
        p.push(Side::Front, &rows(5, 10)).unwrap();
        p.finish().unwrap();

        let block = G.block_bytes();
        assert_eq!(*calls.lock().unwrap(), vec![(2 * block, 4), (block, 1)]);
    }

    struct Failing(Option<mpsc::Sender<()>>);

    impl StreamEncoder for Failing {
        fn encode_rows(&mut self, _: &[u8], _: usize) -> Result<()> {
            if let Some(tx) = self.0.take() {
                let _ = tx.send(());
            }
            Err(Error::Pipeline("encoder broke".into()))
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn failing() -> Box<EncoderFactory> {
        Box::new(|_, _| Ok(Box::new(Failing(None)) as Box<dyn StreamEncoder>))
    }

    #[test]
    fn worker_errors_surface_on_finish() {
        let mut p = SheetPipeline::start(&opts(), &*failing()).unwrap();
        p.push(Side::Back, &rows(2, 0)).unwrap();
        let err = p.finish().unwrap_err();
        assert!(err.to_string().contains("encoder broke"), "{err}");
    }

    #[test]
    fn flush_into_failed_worker_reports_its_error() {
        let (tx, rx) = mpsc::channel();
        let notify = Mutex::new(Some(tx));
        let factory: Box<EncoderFactory> = Box::new(move |side, _| {
            let tx = if side == Side::Front {
                notify.lock().unwrap().take()
            } else {
                None
            };
            Ok(Box::new(Failing(tx)) as Box<dyn StreamEncoder>)
        });
        let mut p = SheetPipeline::start(&opts(), &*factory).unwrap();
        p.push(Side::Front, &rows(3, 0)).unwrap();
        rx.recv().unwrap();
        // give the worker time to hang up after failing
        thread::sleep(Duration::from_millis(20));

        let err = p.finish().unwrap_err();
        assert!(err.to_string().contains("encoder broke"), "{err}");
    }

    #[test]
    fn flush_hands_over_the_remainder() {
        let mut p = SheetPipeline::start(&opts(), &*png()).unwrap();
        p.push(Side::Front, &rows(3, 255)).unwrap();
        assert_eq!(p.pending(Side::Front), G.row_bytes());
        p.flush(Side::Front).unwrap();
        assert_eq!(p.pending(Side::Front), 0);
        p.flush(Side::Back).unwrap();
        p.push(Side::Back, &rows(1, 0)).unwrap();
        let [front, back] = p.finish().unwrap();
        assert_eq!(dimensions(&front.encoded), (4, 3));
        assert_eq!(dimensions(&back.encoded), (4, 1));
    }

    /// Counts calls and, for a gated side, blocks each `encode_rows` until
    /// the gate is released.
    struct Counting {
        gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
        encoded: Arc<AtomicUsize>,
        finished: Arc<AtomicBool>,
    }

    impl StreamEncoder for Counting {
        fn encode_rows(&mut self, _: &[u8], _: usize) -> Result<()> {
            if let Some((entered, gate)) = &self.gate {
                let _ = entered.send(());
                // returns once the release sender is dropped
                let _ = gate.recv();
            }
            self.encoded.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>> {
            self.finished.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    struct Gated {
        release: mpsc::Sender<()>,
        entered: mpsc::Receiver<()>,
        encoded: Arc<AtomicUsize>,
        finished: Arc<AtomicBool>,
        factory: Box<EncoderFactory>,
    }

    /// Front encoder blocks until `release` is dropped; back never blocks.
    fn gated() -> Gated {
        let (release, gate) = mpsc::channel();
        let (notify, entered) = mpsc::channel();
        let gate = Mutex::new(Some((notify, gate)));
        let encoded = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));
        let (e, f) = (encoded.clone(), finished.clone());
        let factory: Box<EncoderFactory> = Box::new(move |side, _| {
            let gate = if side == Side::Front {
                gate.lock().unwrap().take()
            } else {
                None
            };
            Ok(Box::new(Counting {
                gate,
                encoded: e.clone(),
                finished: f.clone(),
            }) as Box<dyn StreamEncoder>)
        });
        Gated {
            release,
            entered,
            encoded,
            finished,
            factory,
        }
    }

    #[test]
    fn full_backlog_is_a_pipeline_error() {
        let g = gated();
        let o = PipelineOptions { backlog: 1, ..opts() };
        let mut p = SheetPipeline::start(&o, &*g.factory).unwrap();

        // one block in the stuck encoder, one queued, the next has no room
        let err = (0..4)
            .map(|_| p.push(Side::Front, &rows(2, 0)))
            .find_map(|r| r.err())
            .expect("backlog never filled");
        assert!(matches!(&err, Error::Pipeline(m) if m.contains("backlog full")), "{err}");

        drop(g.release);
        p.abort();
        assert!(!g.finished.load(Ordering::SeqCst));
    }

    #[test]
    fn abort_discards_work() {
        let g = gated();
        let mut p = SheetPipeline::start(&opts(), &*g.factory).unwrap();
        p.push(Side::Front, &rows(2, 255)).unwrap();
        p.push(Side::Front, &rows(2, 255)).unwrap();
        p.push(Side::Front, &rows(2, 255)).unwrap();
        g.entered.recv().unwrap();

        let release = g.release;
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(release);
        });
        p.abort();
        releaser.join().unwrap();

        // only the block already inside the encoder was encoded
        assert_eq!(g.encoded.load(Ordering::SeqCst), 1);
        assert!(!g.finished.load(Ordering::SeqCst));
    }
}
