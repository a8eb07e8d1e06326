//! ix500d: driverless scan daemon for the Fujitsu ScanSnap iX500.
//!
//! Talks to the scanner directly over USB, watches the scan button, and on
//! a press feeds every sheet in the hopper through a duplex acquisition
//! pipeline. Each scan session becomes one job directory of encoded pages,
//! binarized bitmaps and a manifest.
//!
//! # Protocol
//!
//! The iX500 uses vendor-specific USB with two bulk endpoints. SCSI
//! commands travel in a 31-byte envelope (see [`codec`]); failures are
//! explained by REQUEST SENSE (see [`sense`]). The duplex image data comes
//! from two channels, front and back, that are read strictly alternately.
//!
//! # Usage
//!
//! ```sh
//! # Watch the button, scan on press:
//! ix500d -c /etc/ix500d/config.toml
//!
//! # Scan what is in the hopper now and exit:
//! ix500d --scan
//!
//! # Interactive hardware verification:
//! ix500d --doctor
//! ```

mod acquire;
mod codec;
mod config;
mod device;
mod doctor;
mod encoder;
mod error;
#[cfg(test)]
mod fake;
mod ingest;
mod page;
mod pipeline;
mod pixel;
mod sense;
mod transport;
mod watch;

use std::sync::{Mutex, PoisonError};
use std::thread;

use log::{debug, error, info};

use crate::config::Config;
use crate::device::Session;
use crate::encoder::PageEncoder;
use crate::error::{Error, Result};
use crate::ingest::DirIngester;
use crate::transport::UsbTransport;

fn print_usage() {
    eprintln!(
        "ix500d — scan daemon for the Fujitsu ScanSnap iX500\n\
         \n\
         Usage:\n\
         \x20 ix500d [-c CONFIG.toml]           Watch the scan button, scan on press\n\
         \x20 ix500d [-c CONFIG.toml] --scan    Scan the hopper once and exit\n\
         \x20 ix500d --doctor                   Interactive hardware verification\n\
         \x20 ix500d --help                     Show this message\n\
         \n\
         Scans are written below output_dir (default ./scans), one directory\n\
         per session.\n\
         \n\
         Set RUST_LOG=debug for verbose output."
    );
}

enum Mode {
    Watch,
    Scan,
    Doctor,
}

struct Args {
    mode: Mode,
    config: Option<String>,
}

fn parse_args(args: &[String]) -> std::result::Result<Args, String> {
    let mut mode = Mode::Watch;
    let mut config = None;
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-c" => {
                let path = it.next().ok_or("-c requires a config file path")?;
                config = Some(path.clone());
            }
            "--scan" => mode = Mode::Scan,
            "--doctor" => mode = Mode::Doctor,
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(Args { mode, config })
}

fn open_session(ctx: &rusb::Context, config: &Config) -> Result<Session<UsbTransport>> {
    let dev = UsbTransport::open(ctx)?;
    Ok(Session::new(dev, config.pipeline.geometry, config.retry))
}

fn close_session(session: Session<UsbTransport>) {
    if let Err(e) = session.into_transport().close() {
        debug!("usb: release failed: {e}");
    }
}

/// Scan the hopper once.
fn scan_once(config: &Config) -> Result<String> {
    let ctx = rusb::Context::new()?;
    let mut session = open_session(&ctx, config)?;
    let mut ingester = DirIngester::new(&config.output_dir, config.format);
    let factory = PageEncoder::factory(config.format);
    let res = acquire::scan(&mut session, &mut ingester, &*factory, &config.pipeline);
    close_session(session);
    res
}

/// Wait for the scanner, watch it until it goes away, repeat.
fn run(config: &Config) -> Result<()> {
    let ctx = rusb::Context::new()?;
    let mut ingester = DirIngester::new(&config.output_dir, config.format);
    let factory = PageEncoder::factory(config.format);
    let mut was_present = false;

    loop {
        // ── Phase 1: wait for device ─────────────────────────────
        let mut session = loop {
            match open_session(&ctx, config) {
                Ok(s) => break s,
                Err(e @ Error::UnsupportedPlatform) => return Err(e),
                Err(e) => {
                    if was_present {
                        info!("device-left");
                        was_present = false;
                    }
                    debug!("open: {e}");
                    thread::sleep(config.reconnect);
                }
            }
        };

        match session.inquire() {
            Ok(id) => info!("device-arrived: {id}"),
            Err(e) => {
                debug!("inquiry failed ({e}), retrying");
                close_session(session);
                thread::sleep(config.reconnect);
                continue;
            }
        }
        was_present = true;

        // ── Phase 2: poll status while device is alive ───────────
        let shared = Mutex::new(session);
        let err = watch::watch(&shared, &config.watch, |s| {
            acquire::scan(s, &mut ingester, &*factory, &config.pipeline).map(|_| ())
        });
        debug!("poll failed ({err}), assuming device left");
        close_session(shared.into_inner().unwrap_or_else(PoisonError::into_inner));
    }
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        std::process::exit(0);
    }
    let args = parse_args(&args).unwrap_or_else(|e| {
        eprintln!("ix500d: {e}");
        print_usage();
        std::process::exit(1);
    });

    let config = config::load(args.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("ix500d: {e}");
        std::process::exit(1);
    });

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .format_timestamp_secs()
        .init();

    match args.mode {
        Mode::Doctor => doctor::doctor(),
        Mode::Scan => match scan_once(&config) {
            Ok(id) => info!("scan complete: {id}"),
            Err(e) => {
                error!("scan failed: {e}");
                std::process::exit(1);
            }
        },
        Mode::Watch => {
            info!(
                "ix500d starting — output: {}, config: {}",
                config.output_dir.display(),
                args.config.as_deref().unwrap_or("defaults")
            );
            if let Err(e) = run(&config) {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }
}
