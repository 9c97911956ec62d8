/// Single-instance decision: yield to a running copy, or become the copy that listens.
///
/// The check runs once per process. With a match, the running copy gets the wake
/// signal and this process exits with status 0. Without one, a wake listener is
/// installed and the caller continues its normal startup.
use crate::handler_chain::HandlerChain;
use crate::process_scan::{find_running_instance, ProcessTable, ScanFatalError, SysinfoTable};
use crate::signals::{InstallError, OsSignals, SignalBackend, WakeSignal, WAKE_SIGNAL};

/// Where this process stands with respect to other instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No check has run yet.
    Unchecked,
    /// Another instance was found and signalled; this process should exit.
    Deferred { pid: u32 },
    /// No other instance; this process listens for wake signals.
    Active,
}

/// Outcome of the one-time check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deferred { pid: u32 },
    Active,
}

/// Errors that abort startup.
#[derive(Debug)]
pub enum CoordinatorError {
    /// The process table could not be enumerated.
    Scan(ScanFatalError),
    /// The wake listener could not be installed.
    Install(InstallError),
    /// The check already ran for this process.
    AlreadyDecided(CoordinatorState),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Scan(e) => write!(f, "instance scan failed: {}", e),
            CoordinatorError::Install(e) => write!(f, "cannot listen for wake signal: {}", e),
            CoordinatorError::AlreadyDecided(state) => {
                write!(f, "single-instance check already ran ({:?})", state)
            }
        }
    }
}

impl std::error::Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Scan(e) => Some(e),
            CoordinatorError::Install(e) => Some(e),
            CoordinatorError::AlreadyDecided(_) => None,
        }
    }
}

impl From<ScanFatalError> for CoordinatorError {
    fn from(e: ScanFatalError) -> Self {
        CoordinatorError::Scan(e)
    }
}

impl From<InstallError> for CoordinatorError {
    fn from(e: InstallError) -> Self {
        CoordinatorError::Install(e)
    }
}

/// Owns the process-wide wake binding for the life of the process.
pub struct InstanceCoordinator<T: ProcessTable, S: SignalBackend> {
    app_name: String,
    own_pid: u32,
    signal: WakeSignal,
    table: T,
    signals: S,
    state: CoordinatorState,
    listener: Option<S::Listener>,
}

impl InstanceCoordinator<SysinfoTable, OsSignals> {
    /// Coordinator for the current process, using the live process table.
    pub fn new(app_name: impl Into<String>) -> Self {
        Self::with_backends(
            app_name,
            std::process::id(),
            SysinfoTable::new(),
            OsSignals,
        )
    }
}

impl<T: ProcessTable, S: SignalBackend> InstanceCoordinator<T, S> {
    pub fn with_backends(app_name: impl Into<String>, own_pid: u32, table: T, signals: S) -> Self {
        Self {
            app_name: app_name.into(),
            own_pid,
            signal: WAKE_SIGNAL,
            table,
            signals,
            state: CoordinatorState::Unchecked,
            listener: None,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The installed listener, once the process is `Active`.
    pub fn listener(&self) -> Option<&S::Listener> {
        self.listener.as_ref()
    }

    /// Run the check without exiting.
    ///
    /// On a match the wake signal is sent and `Decision::Deferred` returned; `on_wake`
    /// is dropped unused. A failed send is logged and still counts as deferral.
    /// Otherwise `on_wake` is installed at the head of the wake chain and
    /// `Decision::Active` returned.
    pub fn decide<F>(&mut self, on_wake: F) -> Result<Decision, CoordinatorError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.state != CoordinatorState::Unchecked {
            return Err(CoordinatorError::AlreadyDecided(self.state));
        }

        let found = find_running_instance(&mut self.table, &self.app_name, self.own_pid)?;

        if let Some(record) = found {
            let pid = record.pid;
            if let Err(e) = self.signals.deliver(self.signal, pid) {
                tracing::warn!(pid, error = %e, "failed to wake running instance");
            }
            tracing::info!(
                app_name = %self.app_name,
                pid,
                signal = self.signal.name,
                "instance is already running, sent wake signal. Quitting."
            );
            self.state = CoordinatorState::Deferred { pid };
            return Ok(Decision::Deferred { pid });
        }

        let mut chain = HandlerChain::new();
        chain.push(on_wake);
        let listener = self.signals.listen(self.signal, chain)?;
        self.listener = Some(listener);
        self.state = CoordinatorState::Active;
        tracing::debug!(
            app_name = %self.app_name,
            signal = self.signal.name,
            "no other instance running, listening for wake signal"
        );
        Ok(Decision::Active)
    }

    /// Run the check and exit with status 0 if another instance is running.
    ///
    /// Returns only when this process is the active instance.
    pub fn ensure_single_instance<F>(&mut self, on_wake: F) -> Result<(), CoordinatorError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        match self.decide(on_wake)? {
            Decision::Deferred { pid } => {
                tracing::debug!(pid, "exiting in favour of the running instance");
                std::process::exit(0)
            }
            Decision::Active => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_scan::{ProcessRecord, ScanPartialReadError, Snapshot};
    use crate::signals::SignalDeliveryError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct FakeTable {
        entries: Snapshot,
    }

    impl ProcessTable for FakeTable {
        fn snapshot(&mut self) -> Result<Snapshot, ScanFatalError> {
            Ok(self.entries.clone())
        }
    }

    struct BrokenTable;

    impl ProcessTable for BrokenTable {
        fn snapshot(&mut self) -> Result<Snapshot, ScanFatalError> {
            Err(ScanFatalError::EmptyTable)
        }
    }

    /// Records deliveries; `listen` stores the chain after appending a stand-in
    /// for a handler that was registered before ours.
    #[derive(Clone, Default)]
    struct RecordingSignals {
        delivered: Arc<Mutex<Vec<(i32, u32)>>>,
        installed: Arc<Mutex<Option<HandlerChain>>>,
        prior_calls: Arc<Mutex<Vec<&'static str>>>,
        with_prior: bool,
        fail_delivery: bool,
        fail_install: bool,
    }

    impl RecordingSignals {
        /// Simulate one OS delivery of the wake signal.
        fn fire(&self) {
            self.installed
                .lock()
                .unwrap()
                .as_ref()
                .expect("no listener installed")
                .invoke();
        }
    }

    impl SignalBackend for RecordingSignals {
        type Listener = ();

        fn deliver(&self, signal: WakeSignal, pid: u32) -> Result<(), SignalDeliveryError> {
            self.delivered.lock().unwrap().push((signal.number, pid));
            if self.fail_delivery {
                return Err(SignalDeliveryError::Os {
                    pid,
                    source: std::io::Error::from(std::io::ErrorKind::NotFound),
                });
            }
            Ok(())
        }

        fn listen(&self, _signal: WakeSignal, mut chain: HandlerChain) -> Result<(), InstallError> {
            if self.fail_install {
                return Err(InstallError::Unsupported);
            }
            if self.with_prior {
                let calls = Arc::clone(&self.prior_calls);
                chain.push(move || calls.lock().unwrap().push("prior"));
            }
            *self.installed.lock().unwrap() = Some(chain);
            Ok(())
        }
    }

    fn record(pid: u32, name: &str) -> Result<ProcessRecord, ScanPartialReadError> {
        Ok(ProcessRecord {
            pid,
            name: name.to_string(),
            exe: String::new(),
            cmdline: Vec::new(),
        })
    }

    fn coordinator(
        entries: Snapshot,
        signals: RecordingSignals,
    ) -> InstanceCoordinator<FakeTable, RecordingSignals> {
        InstanceCoordinator::with_backends("efck", 500, FakeTable { entries }, signals)
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_starts_unchecked() {
        let c = coordinator(vec![], RecordingSignals::default());
        assert_eq!(c.state(), CoordinatorState::Unchecked);
        assert_eq!(c.app_name(), "efck");
        assert!(c.listener().is_none());
    }

    #[test]
    fn test_defers_to_running_instance() {
        let signals = RecordingSignals::default();
        let mut c = coordinator(
            vec![record(500, "efck"), record(600, "efck-chat")],
            signals.clone(),
        );
        let (wakes, on_wake) = counter();

        let decision = c.decide(on_wake).unwrap();

        assert_eq!(decision, Decision::Deferred { pid: 600 });
        assert_eq!(c.state(), CoordinatorState::Deferred { pid: 600 });
        assert_eq!(
            *signals.delivered.lock().unwrap(),
            vec![(WAKE_SIGNAL.number, 600)]
        );
        assert!(signals.installed.lock().unwrap().is_none());
        assert_eq!(wakes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_defers_even_when_delivery_fails() {
        let signals = RecordingSignals {
            fail_delivery: true,
            ..Default::default()
        };
        let mut c = coordinator(vec![record(600, "efck-chat")], signals.clone());

        let decision = c.decide(|| {}).unwrap();

        assert_eq!(decision, Decision::Deferred { pid: 600 });
        assert_eq!(signals.delivered.lock().unwrap().len(), 1);
        assert!(signals.installed.lock().unwrap().is_none());
    }

    #[test]
    fn test_becomes_active_when_alone() {
        let signals = RecordingSignals::default();
        let mut c = coordinator(vec![record(500, "efck")], signals.clone());
        let (wakes, on_wake) = counter();

        let decision = c.decide(on_wake).unwrap();

        assert_eq!(decision, Decision::Active);
        assert_eq!(c.state(), CoordinatorState::Active);
        assert!(c.listener().is_some());
        assert!(signals.delivered.lock().unwrap().is_empty());
        // Installing does not call the handler; a delivery does.
        assert_eq!(wakes.load(Ordering::SeqCst), 0);
        signals.fire();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_handler_runs_before_prior_once_each() {
        let signals = RecordingSignals {
            with_prior: true,
            ..Default::default()
        };
        let mut c = coordinator(vec![record(500, "efck")], signals.clone());
        let order = Arc::clone(&signals.prior_calls);
        c.decide(move || order.lock().unwrap().push("wake")).unwrap();

        signals.fire();
        assert_eq!(*signals.prior_calls.lock().unwrap(), vec!["wake", "prior"]);

        signals.fire();
        assert_eq!(
            *signals.prior_calls.lock().unwrap(),
            vec!["wake", "prior", "wake", "prior"]
        );
    }

    #[test]
    fn test_second_decision_is_refused() {
        let mut c = coordinator(vec![record(500, "efck")], RecordingSignals::default());
        c.decide(|| {}).unwrap();

        let err = c.decide(|| {}).unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::AlreadyDecided(CoordinatorState::Active)
        ));
        assert_eq!(c.state(), CoordinatorState::Active);
    }

    #[test]
    fn test_no_second_decision_after_deferral() {
        let signals = RecordingSignals::default();
        let mut c = coordinator(vec![record(600, "efck-chat")], signals.clone());
        c.decide(|| {}).unwrap();

        assert!(c.decide(|| {}).is_err());
        assert_eq!(signals.delivered.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_scan_failure_is_fatal() {
        let signals = RecordingSignals::default();
        let mut c = InstanceCoordinator::with_backends("efck", 500, BrokenTable, signals.clone());

        let err = c.decide(|| {}).unwrap_err();

        assert!(matches!(err, CoordinatorError::Scan(ScanFatalError::EmptyTable)));
        assert_eq!(c.state(), CoordinatorState::Unchecked);
        assert!(signals.delivered.lock().unwrap().is_empty());
        assert!(signals.installed.lock().unwrap().is_none());
    }

    #[test]
    fn test_install_failure_is_fatal() {
        let signals = RecordingSignals {
            fail_install: true,
            ..Default::default()
        };
        let mut c = coordinator(vec![record(500, "efck")], signals);

        let err = c.decide(|| {}).unwrap_err();
        assert!(matches!(err, CoordinatorError::Install(InstallError::Unsupported)));
        assert!(err.to_string().contains("cannot listen for wake signal"));
        assert_eq!(c.state(), CoordinatorState::Unchecked);
    }

    #[test]
    fn test_unreadable_records_do_not_block_deferral() {
        let signals = RecordingSignals::default();
        let mut c = coordinator(
            vec![
                Err(ScanPartialReadError {
                    pid: 550,
                    reason: "permission denied".to_string(),
                }),
                record(600, "efck-chat"),
            ],
            signals.clone(),
        );

        assert_eq!(c.decide(|| {}).unwrap(), Decision::Deferred { pid: 600 });
        assert_eq!(
            *signals.delivered.lock().unwrap(),
            vec![(WAKE_SIGNAL.number, 600)]
        );
    }

    const DEFERRAL_CHILD_ENV: &str = "EFCK_DEFERRAL_CHILD";

    // Re-runs this test binary filtered to this one test; the child takes the
    // branch that exits the process.
    #[test]
    fn test_ensure_single_instance_exits_zero_when_deferring() {
        if std::env::var_os(DEFERRAL_CHILD_ENV).is_some() {
            let signals = RecordingSignals::default();
            let mut c = coordinator(
                vec![record(500, "efck"), record(600, "efck-chat")],
                signals,
            );
            println!("efck-marker: before ensure");
            let _ = c.ensure_single_instance(|| println!("efck-marker: woke"));
            println!("efck-marker: after ensure");
            return;
        }

        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "coordinator::tests::test_ensure_single_instance_exits_zero_when_deferring",
                "--exact",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(DEFERRAL_CHILD_ENV, "1")
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);

        assert_eq!(output.status.code(), Some(0), "child stdout: {stdout}");
        assert!(stdout.contains("efck-marker: before ensure"), "child stdout: {stdout}");
        assert!(!stdout.contains("efck-marker: woke"), "child stdout: {stdout}");
        assert!(!stdout.contains("efck-marker: after ensure"), "child stdout: {stdout}");
        // The harness never got to report the test, so the exit came from inside it.
        assert!(!stdout.contains("test result"), "child stdout: {stdout}");
    }

    #[test]
    fn test_ensure_single_instance_returns_when_active() {
        let mut c = coordinator(vec![record(500, "efck")], RecordingSignals::default());
        c.ensure_single_instance(|| {}).unwrap();
        assert_eq!(c.state(), CoordinatorState::Active);
    }
}
