//! Multi-sheet acquisition: load a sheet, stream both sides through the
//! page pipeline, repeat until the hopper is empty.

use std::thread;
use std::time::Instant;

use log::{debug, info, trace, warn};

use crate::device::{Chunk, Phase, Session, State};
use crate::encoder::EncoderFactory;
use crate::error::{Error, Result};
use crate::ingest::{sides, Ingester, Job};
use crate::page::Side;
use crate::pipeline::{PipelineOptions, SheetPipeline};
use crate::transport::Transport;

/// Run one complete scan session and hand the job to `ingester`.
/// Initializes the device first unless it is already `Ready`.
pub fn scan<T, I>(
    session: &mut Session<T>,
    ingester: &mut I,
    factory: &EncoderFactory,
    opts: &PipelineOptions,
) -> Result<String>
where
    T: Transport,
    I: Ingester + ?Sized,
{
    let start = Instant::now();
    let mut job = ingester.new_job()?;

    if session.state() != State::Ready {
        session.initialize()?;
    }

    let sheets = acquire_sheets(session, &mut job, factory, opts)?;

    // The feeder scans the last sheet first.
    job.reverse_pages();
    debug!("job order: {:?}", sides(&job));

    let id = ingester.ingest(job)?;
    info!(
        "scan {id}: {sheets} sheets in {:.1}s",
        start.elapsed().as_secs_f64()
    );
    Ok(id)
}

/// Scan sheets until the hopper runs empty, adding two pages per sheet to
/// `job` in acquisition order. Returns the number of sheets scanned.
pub fn acquire_sheets<T: Transport>(
    session: &mut Session<T>,
    job: &mut Job,
    factory: &EncoderFactory,
    opts: &PipelineOptions,
) -> Result<u32> {
    if opts.geometry != *session.geometry() {
        return Err(Error::Pipeline(format!(
            "pipeline geometry {:?} does not match session {:?}",
            opts.geometry,
            session.geometry()
        )));
    }
    let mut sheet = 0;
    loop {
        if !session.load_paper()? {
            if sheet == 0 {
                return Err(Error::NoDocument);
            }
            debug!("hopper empty after {sheet} sheets");
            return Ok(sheet);
        }
        sheet += 1;

        session.start_scan()?;
        let size = session.pixel_size()?;
        debug!("sheet {sheet}: {size:?}");

        let mut pipeline = SheetPipeline::start(opts, factory)?;
        let read = read_sheet(session, &mut pipeline, sheet)
            .and_then(|()| flush_sheet(session, &mut pipeline, sheet));
        if let Err(e) = read {
            pipeline.abort();
            session.set_state(State::Disconnected);
            return Err(e);
        }

        let [front, back] = match pipeline.finish() {
            Ok(pages) => pages,
            Err(e) => {
                session.set_state(State::Disconnected);
                return Err(e);
            }
        };
        for page in [&front, &back] {
            if page.blank {
                info!(
                    "sheet {sheet} {}: looks blank ({:.2}% white)",
                    page.side,
                    page.white_ratio * 100.0
                );
            }
        }
        job.add_page(front);
        job.add_page(back);
        session.set_state(State::Ready);
        info!("sheet {sheet} done");
    }
}

/// Hand each side's buffered remainder to its worker.
fn flush_sheet<T: Transport>(
    session: &mut Session<T>,
    pipeline: &mut SheetPipeline,
    sheet: u32,
) -> Result<()> {
    for side in Side::BOTH {
        session.set_state(State::Scanning {
            sheet,
            side,
            phase: Phase::Flushing,
        });
        pipeline.flush(side)?;
    }
    Ok(())
}

/// Read both channels of the sheet in the feeder, strictly alternating
/// front and back, until the back channel reports end of page.
fn read_sheet<T: Transport>(
    session: &mut Session<T>,
    pipeline: &mut SheetPipeline,
    sheet: u32,
) -> Result<()> {
    let mut front_done = false;
    loop {
        for side in Side::BOTH {
            session.set_state(State::Scanning {
                sheet,
                side,
                phase: Phase::AwaitingChunk,
            });
            let chunk = read_turn(session, side)?;

            session.set_state(State::Scanning {
                sheet,
                side,
                phase: Phase::Buffering,
            });
            pipeline.push(side, &chunk.data)?;
            trace!("{side}: {} bytes pending", pipeline.pending(side));

            if chunk.end_of_page {
                match side {
                    Side::Front => front_done = true,
                    Side::Back => {
                        if !front_done {
                            warn!("sheet {sheet}: back ended before front");
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// One turn for `side`: select the channel, then read until the device
/// has data, waiting out "no data yet" up to the retry limit.
fn read_turn<T: Transport>(session: &mut Session<T>, side: Side) -> Result<Chunk> {
    session.select_channel(side)?;
    let retry = session.retry();
    let mut tries = 0;
    loop {
        tries += 1;
        match session.read_chunk(side) {
            Ok(chunk) if chunk.short_read && chunk.data.is_empty() && !chunk.end_of_page => {
                debug!("{side}: empty short read");
            }
            Ok(chunk) => return Ok(chunk),
            Err(Error::Device(c)) if c.is_transient() => {
                debug!("{side}: {c}");
            }
            Err(e) => return Err(e),
        }
        if tries >= retry.limit {
            session.set_state(State::Disconnected);
            return Err(Error::DataTimeout { side, tries });
        }
        warn!("{side}: no data yet, retrying ({tries} of {})", retry.limit);
        thread::sleep(retry.delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Retry;
    use crate::encoder::{PageEncoder, PageFormat};
    use crate::fake::{FakeScanner, Sheet, TraceEvent};
    use crate::page::{Geometry, Page};
    use crate::pixel::PixelStrategy;
    use crate::encoder::StreamEncoder;
    use crate::sense::Condition;
    use std::sync::{mpsc, Mutex};
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

    fn session(fake: FakeScanner) -> Session<FakeScanner> {
        Session::new(
            fake,
            G,
            Retry {
                limit: 5,
                delay: Duration::ZERO,
            },
        )
    }

    #[derive(Default)]
    struct Collect {
        jobs: Vec<Job>,
    }

    impl Ingester for Collect {
        fn ingest(&mut self, job: Job) -> Result<String> {
            self.jobs.push(job);
            Ok(format!("job-{}", self.jobs.len()))
        }
    }

    fn decode(page: &Page) -> image::RgbImage {
        image::load_from_memory(&page.encoded).unwrap().to_rgb8()
    }

    /// First sample of the page image.
    fn first_sample(page: &Page) -> u8 {
        decode(page).get_pixel(0, 0).0[0]
    }

    fn png() -> Box<EncoderFactory> {
        PageEncoder::factory(PageFormat::Png)
    }

    fn run(fake: FakeScanner) -> (Result<String>, Collect, FakeScanner) {
        let mut s = session(fake);
        let mut ing = Collect::default();
        let res = scan(&mut s, &mut ing, &*png(), &opts());
        (res, ing, s.into_transport())
    }

    #[test]
    fn pages_are_reversed_by_sheet() {
        let sheets = (1..=3).map(|i| Sheet::filled(&G, 10 * i, 10 * i + 5)).collect();
        let (res, ing, _) = run(FakeScanner::new(G, sheets));
        assert_eq!(res.unwrap(), "job-1");

        let pages = ing.jobs[0].pages();
        let got: Vec<(Side, u8)> = pages.iter().map(|p| (p.side, first_sample(p))).collect();
        assert_eq!(
            got,
            vec![
                (Side::Back, 35),
                (Side::Front, 30),
                (Side::Back, 25),
                (Side::Front, 20),
                (Side::Back, 15),
                (Side::Front, 10),
            ]
        );
    }

    #[test]
    fn channel_selects_alternate() {
        let sheets = vec![Sheet::blank(&G), Sheet::blank(&G)];
        let mut fake = FakeScanner::new(G, sheets);
        fake.no_data_reads(2);
        let (res, _, fake) = run(fake);
        res.unwrap();

        let trace = fake.channel_trace();
        let mut last: Option<u8> = None;
        let mut selects = 0;
        for ev in trace {
            match ev {
                TraceEvent::Load => last = None,
                TraceEvent::Select(w) => {
                    selects += 1;
                    assert_ne!(Some(w), last, "channel selected twice in a row");
                    if last.is_none() {
                        assert_eq!(w, Side::Front.window_id());
                    }
                    last = Some(w);
                }
            }
        }
        // two reads per side per sheet
        assert_eq!(selects, 8);
    }

    #[test]
    fn empty_hopper_on_first_load_is_no_document() {
        let (res, ing, _) = run(FakeScanner::new(G, vec![]));
        assert!(matches!(res, Err(Error::NoDocument)));
        assert!(ing.jobs.is_empty());
    }

    #[test]
    fn blank_pages_are_flagged_not_dropped() {
        let (res, ing, _) = run(FakeScanner::new(G, vec![Sheet::blank(&G)]));
        res.unwrap();
        let pages = ing.jobs[0].pages();
        assert_eq!(pages.len(), 2);
        assert!(pages.iter().all(|p| p.blank && p.white_ratio == 1.0));
    }

    #[test]
    fn no_data_retries_are_bounded() {
        let mut fake = FakeScanner::new(G, vec![Sheet::blank(&G)]);
        fake.no_data_reads(100);
        let (res, ing, _) = run(fake);
        match res {
            Err(Error::DataTimeout { side, tries }) => {
                assert_eq!(side, Side::Front);
                assert_eq!(tries, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(ing.jobs.is_empty());
    }

    #[test]
    fn paper_jam_aborts_the_scan() {
        let mut fake = FakeScanner::new(G, vec![Sheet::blank(&G), Sheet::blank(&G)]);
        fake.jam_on_read(3);
        let mut s = session(fake);
        let mut ing = Collect::default();
        let err = scan(&mut s, &mut ing, &*png(), &opts()).unwrap_err();
        assert_eq!(err.condition(), Some(Condition::PaperJam));
        assert_eq!(s.state(), State::Disconnected);
        assert!(ing.jobs.is_empty());
    }

    #[test]
    fn short_page_leaves_unwritten_rows_zero() {
        let short = Sheet {
            front: vec![0xff; G.row_bytes() * (G.height - 1)],
            back: vec![0xff; G.row_bytes() * G.height],
        };
        let (res, ing, _) = run(FakeScanner::new(G, vec![short]));
        res.unwrap();
        // single sheet: reversed order is back, front
        let front = &ing.jobs[0].pages()[1];
        assert_eq!(front.side, Side::Front);
        assert_eq!(front.bitmap.row(0), &[0, 0, 0, 0]);
        for y in 1..G.height {
            assert_eq!(front.bitmap.row(y), &[0xff; 4]);
        }
    }

    #[test]
    fn uneven_device_chunks_are_reassembled() {
        let mut fake = FakeScanner::new(G, vec![Sheet::filled(&G, 200, 50)]);
        fake.rows_per_read(1);
        let (res, ing, _) = run(fake);
        res.unwrap();
        for page in ing.jobs[0].pages() {
            let img = decode(page);
            assert_eq!(img.dimensions(), (G.width as u32, G.height as u32));
            let fill = if page.side == Side::Front { 200 } else { 50 };
            assert!(img.as_raw().iter().all(|&b| b == fill));
        }
    }

    /// Reports each call on the sender, then blocks until the gate's
    /// sender is dropped.
    struct Stuck(Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>);

    impl StreamEncoder for Stuck {
        fn encode_rows(&mut self, _: &[u8], _: usize) -> Result<()> {
            if let Some((entered, gate)) = &self.0 {
                let _ = entered.send(());
                let _ = gate.recv();
            }
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn flushing(sheet: u32, side: Side) -> State {
        State::Scanning {
            sheet,
            side,
            phase: Phase::Flushing,
        }
    }

    #[test]
    fn flush_state_names_each_side() {
        let mut s = session(FakeScanner::new(G, vec![]));
        let mut p = SheetPipeline::start(&opts(), &*png()).unwrap();
        flush_sheet(&mut s, &mut p, 1).unwrap();
        assert_eq!(s.state(), flushing(1, Side::Back));
        p.abort();

        // front worker stuck with a full backlog: the flush fails on the front
        let (release, gate) = mpsc::channel::<()>();
        let (notify, entered) = mpsc::channel();
        let gate = Mutex::new(Some((notify, gate)));
        let factory: Box<EncoderFactory> = Box::new(move |side, _| {
            let rx = match side {
                Side::Front => gate.lock().unwrap().take(),
                Side::Back => None,
            };
            Ok(Box::new(Stuck(rx)) as Box<dyn StreamEncoder>)
        });
        let o = PipelineOptions { backlog: 1, ..opts() };
        let mut p = SheetPipeline::start(&o, &*factory).unwrap();
        let block = vec![0; G.block_bytes()];
        p.push(Side::Front, &block).unwrap();
        entered.recv().unwrap();
        while p.push(Side::Front, &block).is_ok() {}
        p.push(Side::Front, &block[..G.row_bytes()]).unwrap();

        let err = flush_sheet(&mut s, &mut p, 3).unwrap_err();
        assert!(matches!(err, Error::Pipeline(_)));
        assert_eq!(s.state(), flushing(3, Side::Front));

        drop(release);
        p.abort();
    }
}
