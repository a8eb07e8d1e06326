//! Hardware-status poller.
//!
//! Watches GET_HW_STATUS for paper and button transitions and starts a scan
//! when the scan button is pressed. Polling and scanning share one lock
//! around the session so their commands never interleave on the bus.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::device::{HardwareStatus, Session};
use crate::error::{Error, Result};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// Minimum time between two scans started from the button.
    pub debounce: Duration,
    /// Poll interval while paper is in the hopper.
    pub fast_poll: Duration,
    pub idle_poll: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(5),
            fast_poll: Duration::from_millis(50),
            idle_poll: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    PaperIn,
    PaperOut,
    ButtonDown,
    ButtonUp,
}

impl Event {
    pub const fn tag(self) -> &'static str {
        match self {
            Self::PaperIn => "paper-in",
            Self::PaperOut => "paper-out",
            Self::ButtonDown => "button-down",
            Self::ButtonUp => "button-up",
        }
    }
}

/// Compare two snapshots and yield the transition events between them.
pub fn transitions(prev: HardwareStatus, curr: HardwareStatus) -> impl Iterator<Item = Event> {
    [
        (!prev.paper && curr.paper).then_some(Event::PaperIn),
        (prev.paper && !curr.paper).then_some(Event::PaperOut),
        (!prev.button && curr.button).then_some(Event::ButtonDown),
        (prev.button && !curr.button).then_some(Event::ButtonUp),
    ]
    .into_iter()
    .flatten()
}

/// Poll fast while a press is likely to follow, slowly otherwise.
pub fn poll_interval(status: &HardwareStatus, opts: &WatchOptions) -> Duration {
    if status.paper {
        opts.fast_poll
    } else {
        opts.idle_poll
    }
}

/// Suppresses repeated triggers within a fixed window.
#[derive(Debug)]
pub struct Debounce {
    window: Duration,
    last: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Returns `true` and restarts the window if the previous trigger is
    /// older than the window.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.last {
            Some(t) if now.saturating_duration_since(t) < self.window => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn lock<T: Transport>(session: &Mutex<Session<T>>) -> MutexGuard<'_, Session<T>> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll the scanner until a status poll fails, calling `on_press` with the
/// session locked whenever the button is pressed outside the debounce
/// window. Returns the error that ended polling.
pub fn watch<T, F>(session: &Mutex<Session<T>>, opts: &WatchOptions, mut on_press: F) -> Error
where
    T: Transport,
    F: FnMut(&mut Session<T>) -> Result<()>,
{
    let mut debounce = Debounce::new(opts.debounce);
    let mut prev: Option<HardwareStatus> = None;

    loop {
        let mut guard = lock(session);
        let status = match guard.hardware_status() {
            Ok(s) => s,
            Err(e) => return e,
        };

        match prev {
            None => info!("initial: paper={} button={}", status.paper, status.button),
            Some(p) => {
                for ev in transitions(p, status) {
                    info!("{}", ev.tag());
                }
                if p != status {
                    debug!("status: {status:?}");
                }
            }
        }
        if status.error_code != 0 && prev.map_or(true, |p| p.error_code != status.error_code) {
            warn!("scanner reports error code {:#04x}", status.error_code);
        }

        if status.button && debounce.fire(Instant::now()) {
            info!("scan requested");
            match on_press(&mut guard) {
                Ok(()) => {}
                Err(Error::NoDocument) => warn!("scan button pressed with an empty hopper"),
                Err(e) if e.condition().is_some() => error!("scan aborted by the scanner: {e}"),
                Err(e) => error!("scan failed: {e}"),
            }
        }
        drop(guard);

        prev = Some(status);
        thread::sleep(poll_interval(&status, opts));
    }
}
