use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;
use log::trace;
use crate::error::lock;
use crate::hid::HidCommand;
use super::Exchange;

/// A deferred action on the exchange.
///
/// The action runs under the exchange lock and only if the task was not cancelled.
/// Cancelling or dropping the task must also happen under the exchange lock, so the
/// two never overlap.
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
    /// Dropped with the task to wake the waiting thread early.
    _wake: mpsc::Sender<()>,
}

impl ScheduledTask {
    /// Runs `wait` on a background thread, then `action` unless `wait` returned `false`
    /// or the task was cancelled in the meantime. `wait` receives a channel that
    /// disconnects when the task is cancelled.
    pub fn spawn<W, F>(exchange: Weak<Mutex<Exchange>>, wait: W, action: F) -> Self
    where
        W: FnOnce(mpsc::Receiver<()>) -> bool + Send + 'static,
        F: FnOnce(&mut Exchange) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        thread::spawn(move || {
            if !wait(rx) {
                return
            }
            let Some(exchange) = exchange.upgrade() else { return };
            let mut exchange = lock(&exchange);
            if flag.load(Ordering::SeqCst) {
                trace!("Scheduled task cancelled before firing");
                return
            }
            action(&mut exchange);
        });
        Self { cancelled, _wake: tx }
    }

    /// Runs `action` after `delay`.
    pub fn after<F>(exchange: Weak<Mutex<Exchange>>, delay: Duration, action: F) -> Self
    where F: FnOnce(&mut Exchange) + Send + 'static {
        Self::spawn(exchange, move |rx| rx.recv_timeout(delay) == Err(RecvTimeoutError::Timeout), action)
    }

    /// Must be called with the exchange locked.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// 2 s on, 4 s off.
pub const LEGACY_RING_ON: Duration = Duration::from_secs(2);
pub const LEGACY_RING_OFF: Duration = Duration::from_secs(4);

/// Software ring cadence for hardware without its own.
/// Dropping it ends the cadence and switches the ringer off.
pub struct RingerCadence {
    _stop: mpsc::Sender<()>,
}

impl RingerCadence {
    pub fn start(commands: mpsc::Sender<HidCommand>, on: Duration, off: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            loop {
                if commands.send(HidCommand::RingerOn).is_err() {
                    return
                }
                let stopped = rx.recv_timeout(on) != Err(RecvTimeoutError::Timeout);
                let _ = commands.send(HidCommand::RingerOff);
                if stopped || rx.recv_timeout(off) != Err(RecvTimeoutError::Timeout) {
                    return
                }
            }
        });
        Self { _stop: tx }
    }
}
