//! VPN status model.
//! Owns the last known status, runs polls and notifies subscribers when the
//! connection state flips.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::error::PollError;
use crate::parser::{self, DetailEntry, VpnStatus};
use crate::platform::StatusPresenter;
use crate::runner::CommandRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    /// No poll has succeeded yet.
    Starting,
    Connected,
    Disconnected,
}

impl ModelState {
    fn from_connected(connected: bool) -> Self {
        if connected {
            Self::Connected
        } else {
            Self::Disconnected
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "Initializing",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        }
    }
}

/// What a single call to `poll` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// A new status was installed. `changed` is true when subscribers were notified.
    Updated { changed: bool },
    /// The previous status was kept.
    Failed(PollError),
    /// Another poll was already in flight.
    Skipped,
    /// The model was invalidated while the command ran; the result was dropped.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollFailure {
    pub at: DateTime<Local>,
    pub error: PollError,
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&VpnStatusModel) + Send + Sync>;

struct Snapshot {
    state: ModelState,
    status: VpnStatus,
    last_success: Option<DateTime<Local>>,
}

/// Clears the in-flight flag even if the runner panics.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct VpnStatusModel {
    runner: Box<dyn CommandRunner>,
    argv: Vec<String>,
    timeout: Duration,
    snapshot: RwLock<Snapshot>,
    last_failure: Mutex<Option<PollFailure>>,
    in_flight: AtomicBool,
    epoch: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Callback)>>,
    next_subscription: AtomicU64,
}

impl VpnStatusModel {
    pub fn new<R>(runner: R, argv: Vec<String>, timeout: Duration) -> Self
    where
        R: CommandRunner + 'static,
    {
        Self {
            runner: Box::new(runner),
            argv,
            timeout,
            snapshot: RwLock::new(Snapshot {
                state: ModelState::Starting,
                status: VpnStatus::default(),
                last_success: None,
            }),
            last_failure: Mutex::new(None),
            in_flight: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    /// Run the status command once and install its result.
    ///
    /// Only one poll runs at a time; a call made while another is in flight
    /// returns `PollOutcome::Skipped` without spawning anything.
    pub fn poll(&self) -> PollOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Poll already in flight, ignoring request");
            return PollOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);
        let epoch = self.epoch.load(Ordering::Acquire);

        let result = self.query();

        match result {
            Ok(status) => match self.install(status, epoch) {
                Some(changed) => {
                    if changed {
                        self.notify();
                    }
                    PollOutcome::Updated { changed }
                }
                None => {
                    debug!("Discarding poll result after invalidation");
                    PollOutcome::Discarded
                }
            },
            Err(_) if self.epoch.load(Ordering::Acquire) != epoch => {
                debug!("Discarding failed poll after invalidation");
                PollOutcome::Discarded
            }
            Err(error) => {
                warn!("Status poll failed, keeping previous status: {}", error);
                *lock(&self.last_failure) = Some(PollFailure {
                    at: Local::now(),
                    error: error.clone(),
                });
                PollOutcome::Failed(error)
            }
        }
    }

    /// Manual refresh, same as `poll`.
    pub fn refresh(&self) -> PollOutcome {
        self.poll()
    }

    /// Drop the result of any poll currently in flight.
    pub fn invalidate(&self) {
        // Serialized with `install` through the snapshot lock.
        let _snapshot = self.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn query(&self) -> Result<VpnStatus, PollError> {
        let output = self.runner.run(&self.argv, self.timeout)?;
        if output.exit_code != 0 {
            return Err(PollError::ExitStatus {
                command: self.argv.join(" "),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        parser::parse(&output.stdout)
    }

    /// Swap in the new status unless the model was invalidated since `epoch`.
    /// Returns whether subscribers must be told.
    fn install(&self, status: VpnStatus, epoch: u64) -> Option<bool> {
        let mut snapshot = self.write();
        if self.epoch.load(Ordering::Acquire) != epoch {
            return None;
        }

        let previous = snapshot.state;
        let next = ModelState::from_connected(status.connected);
        snapshot.state = next;
        snapshot.status = status;
        snapshot.last_success = Some(Local::now());

        let changed = previous != next;
        if changed {
            info!("VPN status changed: {} -> {}", previous.label(), next.label());
        } else {
            debug!("VPN status unchanged: {}", next.label());
        }
        Some(changed)
    }

    fn notify(&self) {
        // Callbacks run without the subscriber lock so they may (un)subscribe.
        let callbacks: Vec<Callback> = lock(&self.subscribers)
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(self);
        }
    }

    /// Register a callback for `status-changed`.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&VpnStatusModel) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, Arc::new(callback)));
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connected(&self) -> bool {
        self.read().status.connected
    }

    pub fn detailed_status(&self) -> Vec<DetailEntry> {
        self.read().status.detailed_status.clone()
    }

    /// Copy of the full status, read in one go.
    pub fn status(&self) -> VpnStatus {
        self.read().status.clone()
    }

    pub fn state(&self) -> ModelState {
        self.read().state
    }

    pub fn last_success(&self) -> Option<DateTime<Local>> {
        self.read().last_success
    }

    pub fn last_failure(&self) -> Option<PollFailure> {
        lock(&self.last_failure).clone()
    }

    pub fn is_polling(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Push the model's current status to a presenter.
pub fn present(model: &VpnStatusModel, presenter: &dyn StatusPresenter) {
    let (status, state) = {
        let snapshot = model.read();
        (snapshot.status.clone(), snapshot.state)
    };
    presenter.render(&status, state);
}

/// Human-friendly age of the last update, e.g. "5 seconds ago".
pub fn format_last_update(last: Option<DateTime<Local>>) -> String {
    match last {
        Some(dt) => {
            let relative = humantime_fmt::format_relative(dt.into());
            format!("{relative} (at {})", dt.format("%H:%M:%S"))
        }
        None => "Never".to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{OnceLock, Weak, mpsc};
    use std::thread;

    /// Replays scripted results, one per run.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedRunner {
        pub(crate) script: Arc<Mutex<VecDeque<Result<CommandOutput, PollError>>>>,
        pub(crate) calls: Arc<AtomicUsize>,
    }

    impl ScriptedRunner {
        pub(crate) fn push_stdout(&self, stdout: &str) {
            self.script.lock().unwrap().push_back(Ok(CommandOutput {
                exit_code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }));
        }

        pub(crate) fn push(&self, result: Result<CommandOutput, PollError>) {
            self.script.lock().unwrap().push_back(result);
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, _argv: &[String], _timeout: Duration) -> Result<CommandOutput, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }
    }

    /// Blocks each run until the test releases it.
    pub(crate) struct GatedRunner {
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
        calls: Arc<AtomicUsize>,
    }

    impl GatedRunner {
        /// Returns the runner, a receiver signalled when a run starts and a
        /// sender that lets the run finish.
        pub(crate) fn new() -> (Self, mpsc::Receiver<()>, mpsc::Sender<()>) {
            let (started_tx, started_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let runner = Self {
                started: Mutex::new(started_tx),
                release: Mutex::new(release_rx),
                calls: Arc::new(AtomicUsize::new(0)),
            };
            (runner, started_rx, release_tx)
        }
    }

    /// Invalidates its model after the command has produced output, the
    /// way `stop()` can land between the run finishing and the install.
    struct InvalidatingRunner {
        model: Arc<OnceLock<Weak<VpnStatusModel>>>,
    }

    impl CommandRunner for InvalidatingRunner {
        fn run(&self, _argv: &[String], _timeout: Duration) -> Result<CommandOutput, PollError> {
            if let Some(model) = self.model.get().and_then(Weak::upgrade) {
                model.invalidate();
            }
            Ok(CommandOutput {
                exit_code: 0,
                stdout: "Connected".to_string(),
                stderr: String::new(),
            })
        }
    }

    impl CommandRunner for GatedRunner {
        fn run(&self, _argv: &[String], _timeout: Duration) -> Result<CommandOutput, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.lock().unwrap().send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(CommandOutput {
                exit_code: 0,
                stdout: "Connected\nRelay: se1".to_string(),
                stderr: String::new(),
            })
        }
    }

    fn model_with(runner: &ScriptedRunner) -> VpnStatusModel {
        VpnStatusModel::new(
            runner.clone(),
            vec!["mullvad".to_string(), "status".to_string()],
            Duration::from_secs(1),
        )
    }

    fn counting_subscriber(model: &VpnStatusModel) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        model.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn starts_in_initializing_state() {
        let model = model_with(&ScriptedRunner::default());
        assert_eq!(model.state(), ModelState::Starting);
        assert!(!model.connected());
        assert!(model.detailed_status().is_empty());
        assert!(model.last_success().is_none());
    }

    #[test]
    fn first_successful_poll_leaves_starting_and_notifies() {
        let runner = ScriptedRunner::default();
        runner.push_stdout("Disconnected");
        let model = model_with(&runner);
        let count = counting_subscriber(&model);

        assert_eq!(model.poll(), PollOutcome::Updated { changed: true });
        assert_eq!(model.state(), ModelState::Disconnected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn notifies_once_per_transition_only() {
        let runner = ScriptedRunner::default();
        runner.push_stdout("Disconnected");
        runner.push_stdout("Connected\nRelay: se1");
        runner.push_stdout("Connected\nRelay: de2");
        runner.push_stdout("Disconnected");
        runner.push_stdout("Disconnected");
        let model = model_with(&runner);
        model.poll();
        let count = counting_subscriber(&model);

        assert_eq!(model.poll(), PollOutcome::Updated { changed: true });
        assert_eq!(model.poll(), PollOutcome::Updated { changed: false });
        assert_eq!(count.load(Ordering::SeqCst), 1);
        // Detail changes are stored even without an event.
        assert_eq!(
            model.detailed_status(),
            vec![DetailEntry::new("Relay", Some("de2"))]
        );

        model.poll();
        model.poll();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscriber_sees_new_status() {
        let runner = ScriptedRunner::default();
        runner.push_stdout("Connected\nRelay: se1\nIP: 1.2.3.4");
        let model = model_with(&runner);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        model.subscribe(move |model| {
            *sink.lock().unwrap() = Some((model.connected(), model.detailed_status().len()));
        });

        model.poll();
        assert_eq!(*seen.lock().unwrap(), Some((true, 2)));
    }

    #[test]
    fn failed_poll_keeps_previous_status() {
        let runner = ScriptedRunner::default();
        runner.push_stdout("Connected\nRelay: se1");
        runner.push(Err(PollError::Execution {
            command: "mullvad".to_string(),
            reason: "No such file or directory".to_string(),
        }));
        let model = model_with(&runner);
        model.poll();
        let before = model.status();
        let count = counting_subscriber(&model);

        assert!(matches!(model.poll(), PollOutcome::Failed(PollError::Execution { .. })));
        assert_eq!(model.status(), before);
        assert_eq!(model.state(), ModelState::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(model.last_failure().is_some());
    }

    #[test]
    fn non_zero_exit_and_garbage_output_are_failures() {
        let runner = ScriptedRunner::default();
        runner.push(Ok(CommandOutput {
            exit_code: 1,
            stdout: "Connected".to_string(),
            stderr: "daemon not running".to_string(),
        }));
        runner.push_stdout("Segmentation fault");
        let model = model_with(&runner);

        assert!(matches!(
            model.poll(),
            PollOutcome::Failed(PollError::ExitStatus { code: 1, .. })
        ));
        assert!(matches!(model.poll(), PollOutcome::Failed(PollError::Parse(_))));
        assert_eq!(model.state(), ModelState::Starting);
    }

    #[test]
    fn unsubscribed_callbacks_are_not_called() {
        let runner = ScriptedRunner::default();
        runner.push_stdout("Connected");
        let model = model_with(&runner);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let id = model.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(model.unsubscribe(id));
        assert!(!model.unsubscribe(id));
        model.poll();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_poll_is_skipped() {
        let (runner, started, release) = GatedRunner::new();
        let calls = Arc::clone(&runner.calls);
        let model = Arc::new(VpnStatusModel::new(
            runner,
            vec!["mullvad".to_string()],
            Duration::from_secs(1),
        ));

        let background = {
            let model = Arc::clone(&model);
            thread::spawn(move || model.poll())
        };
        started.recv().unwrap();
        assert!(model.is_polling());

        assert_eq!(model.refresh(), PollOutcome::Skipped);

        release.send(()).unwrap();
        assert_eq!(
            background.join().unwrap(),
            PollOutcome::Updated { changed: true }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(model.connected());
        assert!(!model.is_polling());
    }

    #[test]
    fn invalidated_poll_is_discarded() {
        let (runner, started, release) = GatedRunner::new();
        let model = Arc::new(VpnStatusModel::new(
            runner,
            vec!["mullvad".to_string()],
            Duration::from_secs(1),
        ));
        let count = counting_subscriber(&model);

        let background = {
            let model = Arc::clone(&model);
            thread::spawn(move || model.poll())
        };
        started.recv().unwrap();
        model.invalidate();
        release.send(()).unwrap();

        assert_eq!(background.join().unwrap(), PollOutcome::Discarded);
        assert_eq!(model.state(), ModelState::Starting);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalidation_right_before_install_is_discarded() {
        let slot = Arc::new(OnceLock::new());
        let model = Arc::new(VpnStatusModel::new(
            InvalidatingRunner {
                model: Arc::clone(&slot),
            },
            vec!["mullvad".to_string()],
            Duration::from_secs(1),
        ));
        slot.set(Arc::downgrade(&model)).unwrap();
        let count = counting_subscriber(&model);

        assert_eq!(model.poll(), PollOutcome::Discarded);
        assert_eq!(model.state(), ModelState::Starting);
        assert!(!model.connected());
        assert!(model.last_success().is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    struct RecordingPresenter(Mutex<Vec<String>>);

    impl StatusPresenter for RecordingPresenter {
        fn render(&self, status: &VpnStatus, state: ModelState) {
            let mut lines = self.0.lock().unwrap();
            lines.push(state.label().to_string());
            lines.extend(status.visible_details().map(|entry| entry.to_string()));
        }
    }

    #[test]
    fn present_hides_empty_details() {
        let runner = ScriptedRunner::default();
        runner.push_stdout("Connected\nRelay: se1\nIPv6:");
        let model = model_with(&runner);
        model.poll();

        let presenter = RecordingPresenter(Mutex::new(Vec::new()));
        present(&model, &presenter);
        assert_eq!(
            *presenter.0.lock().unwrap(),
            vec!["Connected".to_string(), "Relay: se1".to_string()]
        );
    }

    #[test]
    fn never_updated_formats_as_never() {
        assert_eq!(format_last_update(None), "Never");
    }
}
