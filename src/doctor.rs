use std::io::{self, BufRead, Write as IoWrite};
use std::time::{Duration, Instant};

use crate::device::{HardwareStatus, Retry, Session};
use crate::page::Geometry;
use crate::transport::{Transport, UsbTransport, PID, VID};

const DOCTOR_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Block until the user presses Enter.
fn wait_enter() {
    let _ = io::stdout().flush();
    let _ = io::stdin().lock().read_line(&mut String::new());
}

/// Poll until `predicate` is satisfied or `timeout` elapses.
/// Prints dots to show progress. Returns the matching status or None.
fn wait_for_status<T: Transport>(
    session: &mut Session<T>,
    predicate: impl Fn(&HardwareStatus) -> bool,
    timeout: Duration,
) -> Option<HardwareStatus> {
    let start = Instant::now();
    let mut dots = 0u32;
    print!("      Polling");
    let _ = io::stdout().flush();
    loop {
        if let Ok(status) = session.hardware_status() {
            if predicate(&status) {
                return Some(status);
            }
        }
        if start.elapsed() >= timeout {
            return None;
        }
        // Print a dot every 500ms
        let expected = (start.elapsed().as_millis() / 500) as u32;
        if dots < expected {
            print!(".");
            let _ = io::stdout().flush();
            dots = expected;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Run one interactive check and report PASS/FAIL.
fn check<T: Transport>(
    session: &mut Session<T>,
    prompt: &str,
    predicate: impl Fn(&HardwareStatus) -> bool,
) -> bool {
    print!("      Press Enter, then {prompt}: ");
    wait_enter();
    match wait_for_status(session, predicate, DOCTOR_TIMEOUT) {
        Some(_) => {
            println!(" detected!       PASS");
            true
        }
        None => {
            println!(" timed out       FAIL");
            false
        }
    }
}

pub fn doctor() {
    println!("ix500d doctor");
    println!("=============\n");
    println!("Verifying USB communication and hardware status reporting");
    println!("for the Fujitsu ScanSnap iX500.\n");

    let ctx = match rusb::Context::new() {
        Ok(c) => c,
        Err(e) => {
            println!("[1/6] USB context ............. FAIL ({e})");
            println!("\n      Cannot initialize libusb. Is it installed?");
            std::process::exit(1);
        }
    };

    // ── 1. USB connection ────────────────────────────────────────
    print!("[1/6] USB connection .......... ");
    let _ = io::stdout().flush();
    let dev = match UsbTransport::open(&ctx) {
        Ok(d) => {
            println!("ok");
            d
        }
        Err(e) => {
            println!("FAIL ({e})");
            println!("\n      Scanner not found ({VID:04x}:{PID:04x}).");
            println!("      Is the lid open and the scanner awake? Check: lsusb | grep 04c5");
            std::process::exit(1);
        }
    };
    let mut session = Session::new(dev, Geometry::default(), Retry::default());

    // ── 2. INQUIRY ───────────────────────────────────────────────
    print!("[2/6] Identify ................ ");
    let _ = io::stdout().flush();
    match session.inquire() {
        Ok(id) => println!("ok  ({id})"),
        Err(e) => {
            println!("FAIL ({e})");
            println!("\n      INQUIRY failed. USB communication error.");
            std::process::exit(1);
        }
    }

    // ── 3. GET_HW_STATUS ─────────────────────────────────────────
    print!("[3/6] Hardware status ......... ");
    let _ = io::stdout().flush();
    let baseline = match session.hardware_status() {
        Ok(s) => {
            println!(
                "ok  (paper={}, button={}, adf_open={}, error={:#04x})",
                s.paper, s.button, s.adf_open, s.error_code
            );
            s
        }
        Err(e) => {
            println!("FAIL ({e})");
            println!("\n      GET_HW_STATUS returned no data. USB communication error.");
            std::process::exit(1);
        }
    };

    let mut passed = 3u32;
    let mut failed = 0u32;
    let mut tally = |ok: bool| {
        if ok {
            passed += 1;
        } else {
            failed += 1;
        }
    };

    // ── 4. Paper detect ──────────────────────────────────────────
    println!("\n[4/6] Paper detect");
    if baseline.paper {
        print!("      Paper already in the hopper, remove it first, then press Enter: ");
        wait_enter();
        if wait_for_status(&mut session, |s| !s.paper, DOCTOR_TIMEOUT).is_none() {
            println!(" timed out, could not establish empty baseline");
        }
        println!();
    }
    tally(check(&mut session, "insert a sheet of paper", |s| s.paper));

    // ── 5. Paper remove ──────────────────────────────────────────
    println!("\n[5/6] Paper remove");
    tally(check(&mut session, "remove the paper", |s| !s.paper));

    // ── 6. Button press ──────────────────────────────────────────
    println!("\n[6/6] Button press");
    tally(check(&mut session, "press the scan button", |s| s.button));

    let _ = session.into_transport().close();

    // ── Summary ──────────────────────────────────────────────────
    let total = passed + failed;
    println!("\n=============");
    if failed == 0 {
        println!("All {total} checks passed. Scanner is working correctly.");
    } else {
        println!("{passed}/{total} passed, {failed} failed.");
        std::process::exit(1);
    }
}
