// core/src/scheduler.rs
//
// Interval timer that drives status polls.
// Each start installs one timer thread; stopping or restarting retires it.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{PollOutcome, VpnStatusModel};

/// A live timer. Dropping `cancel` wakes the thread and ends it.
struct Timer {
    cancel: mpsc::Sender<()>,
    interval: Duration,
}

/// Polls a `VpnStatusModel` on a fixed interval
pub struct PollScheduler {
    model: Arc<VpnStatusModel>,
    timer: Mutex<Option<Timer>>,
    generation: Arc<AtomicU64>,
}

impl PollScheduler {
    pub fn new(model: Arc<VpnStatusModel>) -> Self {
        Self {
            model,
            timer: Mutex::new(None),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn model(&self) -> &Arc<VpnStatusModel> {
        &self.model
    }

    /// Start polling every `interval_secs` seconds, replacing any running timer.
    pub fn start(&self, interval_secs: u64) -> Result<()> {
        if interval_secs == 0 {
            return Err(Error::Config(
                "refresh interval must be at least one second".to_string(),
            ));
        }
        self.start_with_interval(Duration::from_secs(interval_secs))
    }

    pub fn start_with_interval(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(Error::Config("refresh interval must be positive".to_string()));
        }

        let mut timer = self.lock_timer();
        if let Some(previous) = timer.take() {
            debug!("Replacing poll timer ({:?})", previous.interval);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (cancel, cancelled) = mpsc::channel::<()>();
        let model = Arc::downgrade(&self.model);
        let current = Arc::clone(&self.generation);

        thread::spawn(move || run_timer(model, interval, cancelled, current, generation));

        *timer = Some(Timer { cancel, interval });
        info!("Status polling started, every {:?}", interval);
        Ok(())
    }

    /// Stop polling. Any poll still running has its result discarded.
    pub fn stop(&self) {
        let mut timer = self.lock_timer();
        if let Some(previous) = timer.take() {
            self.generation.fetch_add(1, Ordering::AcqRel);
            drop(previous.cancel);
            self.model.invalidate();
            info!("Stopping status polling");
        }
    }

    /// Poll right away. The timer keeps its own schedule.
    pub fn trigger_now(&self) -> PollOutcome {
        debug!("Manual status refresh requested");
        self.model.refresh()
    }

    pub fn is_running(&self) -> bool {
        self.lock_timer().is_some()
    }

    /// Interval of the active timer, if any.
    pub fn interval(&self) -> Option<Duration> {
        self.lock_timer().as_ref().map(|timer| timer.interval)
    }

    fn lock_timer(&self) -> std::sync::MutexGuard<'_, Option<Timer>> {
        self.timer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_timer(
    model: Weak<VpnStatusModel>,
    interval: Duration,
    cancelled: mpsc::Receiver<()>,
    current: Arc<AtomicU64>,
    generation: u64,
) {
    debug!("Poll timer {} started", generation);

    loop {
        match cancelled.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        // A restart may race with the timeout firing.
        if current.load(Ordering::Acquire) != generation {
            break;
        }

        let Some(model) = model.upgrade() else {
            warn!("Status model dropped, stopping poll timer");
            break;
        };
        if let PollOutcome::Failed(e) = model.poll() {
            debug!("Scheduled poll failed: {}", e);
        }
    }

    debug!("Poll timer {} stopped", generation);
}
