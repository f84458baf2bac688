//! Tunnel Process Supervisor: owns the transport process from spawn to reap.
//!
//! State machine: Starting → Active → (Closing →) Closed(reason).
//!
//! - Starting: the transport is spawned. It becomes Active once it has stayed
//!   alive for the readiness grace period, or earlier if a configured
//!   `ready_pattern` matches a stdout line. Exiting during this window is a
//!   `StartupFailure`, whatever the exit code.
//! - Active: blocks until the cancellation token fires or the process exits.
//!   No timeout.
//! - Closing: graceful termination request, bounded wait, then force kill.
//!   Always ends in `UserCancelled`.
//!
//! The supervisor is the only code that signals or waits on the child. On unix
//! the child runs in its own process group, so a terminal Ctrl-C reaches the
//! supervisor (via the cancellation token) rather than the transport, and
//! signals are delivered to the whole group (the `aws` CLI forks the Session
//! Manager plugin). `kill_on_drop` covers every early-exit path.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::descriptor::ConnectionDescriptor;
use crate::error::TunnelError;
use crate::transport::{LaunchRequest, TransportLauncher};

/// Lines of transport stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 50;

/// How long to wait for output drains after the process is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Why a tunnel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosureReason {
    /// Process could not be launched, or exited before becoming Active
    StartupFailure { code: Option<i32>, detail: String },
    /// Cancellation was requested; never an error
    UserCancelled,
    /// Exit code 0 while Active with no cancellation; unusual, not an error
    RemoteEndedCleanly,
    /// Any other exit while Active. `None` when killed by a signal.
    AbnormalTermination { code: Option<i32> },
}

impl ClosureReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ClosureReason::StartupFailure { .. } | ClosureReason::AbnormalTermination { .. }
        )
    }
}

/// Lifecycle of one tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Starting,
    Active,
    Closing,
    Closed(ClosureReason),
}

/// Final report of a `connect` call.
#[derive(Debug, Clone)]
pub struct TunnelOutcome {
    pub database: String,
    pub local_port: u16,
    pub reason: ClosureReason,
    /// Time spent Active; `None` if the tunnel never got there.
    pub active_for: Option<Duration>,
    /// Last lines the transport wrote to stderr.
    pub stderr_tail: Vec<String>,
}

/// Rolling buffer for transport stderr.
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a line, evicting the oldest at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// A live tunnel. Exclusively owns the child process handle.
struct TunnelSession {
    local_port: u16,
    child: Child,
    state: TunnelState,
    started_at: Instant,
    activated_at: Option<Instant>,
    state_tx: watch::Sender<TunnelState>,
}

impl TunnelSession {
    fn transition(&mut self, next: TunnelState) {
        tracing::debug!(
            local_port = self.local_port,
            from = ?self.state,
            to = ?next,
            since_start_ms = self.started_at.elapsed().as_millis() as u64,
            "tunnel state change"
        );
        if next == TunnelState::Active {
            self.activated_at = Some(Instant::now());
        }
        self.state = next.clone();
        self.state_tx.send_replace(next);
    }
}

enum StartEvent {
    Exited(std::io::Result<ExitStatus>),
    Ready,
    Cancelled,
}

enum ActiveEvent {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
}

/// Launches and supervises transport processes.
///
/// Each `connect` call owns its own process; concurrent calls share nothing
/// but this (immutable) configuration.
#[derive(Debug, Clone)]
pub struct TunnelSupervisor {
    readiness_grace: Duration,
    shutdown_timeout: Duration,
    ready_pattern: Option<Regex>,
}

impl TunnelSupervisor {
    pub fn new(readiness_grace: Duration, shutdown_timeout: Duration) -> Self {
        Self {
            readiness_grace,
            shutdown_timeout,
            ready_pattern: None,
        }
    }

    /// Mark the tunnel Active early when a stdout line matches `pattern`.
    pub fn with_ready_pattern(mut self, pattern: Regex) -> Self {
        self.ready_pattern = Some(pattern);
        self
    }

    pub fn from_config(config: &SupervisorConfig) -> crate::Result<Self> {
        let supervisor = Self::new(config.readiness_grace(), config.shutdown_timeout());
        match &config.ready_pattern {
            None => Ok(supervisor),
            Some(pattern) => {
                let re = Regex::new(pattern).map_err(|e| {
                    TunnelError::InvalidConfig("tunnel".to_string(), e.to_string())
                })?;
                Ok(supervisor.with_ready_pattern(re))
            }
        }
    }

    /// Open a tunnel and block until it is Closed.
    pub async fn connect<T: TransportLauncher>(
        &self,
        launcher: &T,
        descriptor: &ConnectionDescriptor,
        local_port: u16,
        identity: &str,
        cancel: CancellationToken,
    ) -> TunnelOutcome {
        let (state_tx, _state_rx) = watch::channel(TunnelState::Starting);
        self.connect_observed(launcher, descriptor, local_port, identity, cancel, state_tx)
            .await
    }

    /// Like [`connect`](Self::connect), publishing every state change on `state_tx`.
    pub async fn connect_observed<T: TransportLauncher>(
        &self,
        launcher: &T,
        descriptor: &ConnectionDescriptor,
        local_port: u16,
        identity: &str,
        cancel: CancellationToken,
        state_tx: watch::Sender<TunnelState>,
    ) -> TunnelOutcome {
        let database = descriptor.name().to_string();
        let request = LaunchRequest {
            descriptor,
            local_port,
            identity,
        };

        let mut cmd = launcher.command(&request);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        state_tx.send_replace(TunnelState::Starting);
        tracing::info!(
            database = %database,
            local_port,
            program = %launcher.program(),
            "starting transport"
        );
        tracing::debug!(args = ?launcher.args(&request), "transport arguments");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(database = %database, error = %e, "failed to launch transport");
                let reason = ClosureReason::StartupFailure {
                    code: None,
                    detail: format!("failed to launch '{}': {}", launcher.program(), e),
                };
                state_tx.send_replace(TunnelState::Closed(reason.clone()));
                return TunnelOutcome {
                    database,
                    local_port,
                    reason,
                    active_for: None,
                    stderr_tail: Vec::new(),
                };
            }
        };

        let tail = Arc::new(Mutex::new(OutputTail::new(STDERR_TAIL_LINES)));
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut drains = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drains.push(start_stdout_watch(
                stdout,
                database.clone(),
                self.ready_pattern.clone(),
                ready_tx,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drains.push(start_stderr_drain(stderr, database.clone(), tail.clone()));
        }

        let mut session = TunnelSession {
            local_port,
            child,
            state: TunnelState::Starting,
            started_at: Instant::now(),
            activated_at: None,
            state_tx,
        };

        let reason = self.supervise(&mut session, ready_rx, &cancel).await;
        let active_for = session.activated_at.map(|at| at.elapsed());
        session.transition(TunnelState::Closed(reason.clone()));
        drop(session);

        for drain in drains {
            if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
                tracing::debug!(database = %database, "output drain still open after exit");
            }
        }
        let stderr_tail = tail.lock().await.to_vec();

        match &reason {
            ClosureReason::UserCancelled | ClosureReason::RemoteEndedCleanly => {
                tracing::info!(
                    database = %database,
                    local_port,
                    reason = ?reason,
                    active_ms = active_for.map(|d| d.as_millis() as u64),
                    "tunnel closed"
                );
            }
            _ => {
                tracing::warn!(
                    database = %database,
                    local_port,
                    reason = ?reason,
                    active_ms = active_for.map(|d| d.as_millis() as u64),
                    "tunnel failed"
                );
            }
        }

        TunnelOutcome {
            database,
            local_port,
            reason,
            active_for,
            stderr_tail,
        }
    }

    /// Drive Starting → Active → exit or Closing. Returns the classified reason.
    async fn supervise(
        &self,
        session: &mut TunnelSession,
        ready_rx: oneshot::Receiver<()>,
        cancel: &CancellationToken,
    ) -> ClosureReason {
        let ready = async {
            // a dropped sender means "no explicit readiness", not "ready"
            if ready_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        let event = tokio::select! {
            status = session.child.wait() => StartEvent::Exited(status),
            _ = tokio::time::sleep(self.readiness_grace) => StartEvent::Ready,
            _ = ready => StartEvent::Ready,
            _ = cancel.cancelled() => StartEvent::Cancelled,
        };

        match event {
            StartEvent::Cancelled => return self.close(session).await,
            StartEvent::Exited(_) if cancel.is_cancelled() => return ClosureReason::UserCancelled,
            StartEvent::Exited(status) => return classify_startup_exit(status),
            StartEvent::Ready => {}
        }

        session.transition(TunnelState::Active);

        let event = tokio::select! {
            status = session.child.wait() => ActiveEvent::Exited(status),
            _ = cancel.cancelled() => ActiveEvent::Cancelled,
        };

        match event {
            ActiveEvent::Cancelled => self.close(session).await,
            // cancellation outcome wins any race with the process exiting
            ActiveEvent::Exited(_) if cancel.is_cancelled() => ClosureReason::UserCancelled,
            ActiveEvent::Exited(Ok(status)) if status.success() => ClosureReason::RemoteEndedCleanly,
            ActiveEvent::Exited(Ok(status)) => ClosureReason::AbnormalTermination {
                code: status.code(),
            },
            ActiveEvent::Exited(Err(e)) => {
                tracing::error!(error = %e, "lost track of transport process, killing it");
                force_kill(&mut session.child).await;
                ClosureReason::AbnormalTermination { code: None }
            }
        }
    }

    /// Closing: terminate gracefully, force-kill after the shutdown timeout.
    async fn close(&self, session: &mut TunnelSession) -> ClosureReason {
        session.transition(TunnelState::Closing);
        tracing::info!(local_port = session.local_port, "stopping tunnel");

        request_termination(&mut session.child);
        match tokio::time::timeout(self.shutdown_timeout, session.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(exit_code = ?status.code(), "transport exited after termination request");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "wait failed during shutdown, force-killing");
                force_kill(&mut session.child).await;
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.shutdown_timeout.as_secs_f64(),
                    "transport ignored termination request, force-killing"
                );
                force_kill(&mut session.child).await;
            }
        }
        ClosureReason::UserCancelled
    }
}

fn classify_startup_exit(status: std::io::Result<ExitStatus>) -> ClosureReason {
    match status {
        Ok(status) => ClosureReason::StartupFailure {
            code: status.code(),
            detail: match status.code() {
                Some(code) => format!("transport exited with code {} before the tunnel was ready", code),
                None => "transport was killed by a signal before the tunnel was ready".to_string(),
            },
        },
        Err(e) => ClosureReason::StartupFailure {
            code: None,
            detail: format!("failed to wait on transport: {}", e),
        },
    }
}

/// Graceful termination: SIGTERM to the child's process group on unix.
fn request_termination(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall; the group id is the child's pid (process_group(0))
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGTERM) };
        if rc == 0 {
            return;
        }
        tracing::debug!(error = %std::io::Error::last_os_error(), "SIGTERM to process group failed");
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "start_kill failed");
    }
}

/// Forced termination of the whole group, then reap.
async fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: plain syscall on the child's own process group
        unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "kill failed (process already gone?)");
    }
}

/// Drain transport stdout, signalling readiness on the first pattern match.
fn start_stdout_watch(
    stdout: ChildStdout,
    database: String,
    pattern: Option<Regex>,
    ready_tx: oneshot::Sender<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ready_tx = Some(ready_tx);
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(database = %database, line = %line, "transport stdout");
            if let Some(re) = &pattern {
                if re.is_match(&line) {
                    if let Some(tx) = ready_tx.take() {
                        let _ = tx.send(());
                    }
                }
            }
        }
    })
}

/// Drain transport stderr into the rolling tail.
fn start_stderr_drain(
    stderr: ChildStderr,
    database: String,
    tail: Arc<Mutex<OutputTail>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(database = %database, line = %line, "transport stderr");
            tail.lock().await.push(line);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_tail_capacity() {
        let mut tail = OutputTail::new(3);
        for line in ["line1", "line2", "line3", "line4"] {
            tail.push(line.to_string());
        }
        assert_eq!(tail.to_vec(), vec!["line2", "line3", "line4"]);
    }

    #[test]
    fn test_is_error() {
        assert!(!ClosureReason::UserCancelled.is_error());
        assert!(!ClosureReason::RemoteEndedCleanly.is_error());
        assert!(ClosureReason::AbnormalTermination { code: Some(255) }.is_error());
        assert!(ClosureReason::StartupFailure {
            code: None,
            detail: String::new()
        }
        .is_error());
    }

    #[test]
    fn test_from_config_compiles_pattern() {
        let config = SupervisorConfig {
            readiness_grace_ms: 1500,
            shutdown_timeout_secs: 3,
            ready_pattern: Some("Waiting for connections".to_string()),
        };
        let supervisor = TunnelSupervisor::from_config(&config).unwrap();
        assert_eq!(supervisor.readiness_grace, Duration::from_millis(1500));
        assert_eq!(supervisor.shutdown_timeout, Duration::from_secs(3));
        assert!(supervisor.ready_pattern.is_some());
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use crate::descriptor::DatabaseRecord;
        use crate::transport::CommandTransport;
        use std::collections::HashMap;

        fn descriptor(name: &str) -> ConnectionDescriptor {
            let rec: DatabaseRecord = serde_json::from_str(
                r#"{"engine":"postgres","bastionInstanceId":"i-0abc","rdsEndpoint":"db.internal","rdsPort":5432}"#,
            )
            .unwrap();
            rec.into_descriptor(name, "us-east-1").unwrap()
        }

        fn sh(script: &str) -> CommandTransport {
            CommandTransport::new(
                "sh",
                vec!["-c".to_string(), script.to_string()],
                HashMap::new(),
            )
        }

        fn fast() -> TunnelSupervisor {
            TunnelSupervisor::new(Duration::from_millis(150), Duration::from_secs(2))
        }

        async fn run(supervisor: &TunnelSupervisor, script: &str) -> TunnelOutcome {
            supervisor
                .connect(
                    &sh(script),
                    &descriptor("hk-postgres-dev"),
                    54320,
                    "houlak",
                    CancellationToken::new(),
                )
                .await
        }

        #[tokio::test]
        async fn test_exit_255_while_active_is_abnormal() {
            let outcome = run(&fast(), "sleep 0.6; exit 255").await;
            assert_eq!(
                outcome.reason,
                ClosureReason::AbnormalTermination { code: Some(255) }
            );
            assert_eq!(outcome.database, "hk-postgres-dev");
            assert_eq!(outcome.local_port, 54320);
            assert!(outcome.active_for.is_some());
        }

        #[tokio::test]
        async fn test_nonzero_codes_preserved() {
            for code in [1, 2, 130] {
                let outcome = run(&fast(), &format!("sleep 0.5; exit {}", code)).await;
                assert_eq!(
                    outcome.reason,
                    ClosureReason::AbnormalTermination { code: Some(code) }
                );
            }
        }

        #[tokio::test]
        async fn test_exit_zero_while_active_is_clean_end() {
            let outcome = run(&fast(), "sleep 0.5; exit 0").await;
            assert_eq!(outcome.reason, ClosureReason::RemoteEndedCleanly);
        }

        #[tokio::test]
        async fn test_exit_during_grace_is_startup_failure() {
            let supervisor = TunnelSupervisor::new(Duration::from_secs(3), Duration::from_secs(2));
            let outcome = run(&supervisor, "echo 'TargetNotConnected' >&2; exit 255").await;
            assert!(matches!(
                outcome.reason,
                ClosureReason::StartupFailure { code: Some(255), .. }
            ));
            assert!(outcome.active_for.is_none());
            assert!(outcome.stderr_tail.iter().any(|l| l.contains("TargetNotConnected")));

            let outcome = run(&supervisor, "exit 0").await;
            assert!(matches!(
                outcome.reason,
                ClosureReason::StartupFailure { code: Some(0), .. }
            ));
        }

        #[tokio::test]
        async fn test_spawn_failure_is_startup_failure() {
            let transport = CommandTransport::new(
                "/this/command/does/not/exist-dbtunnel",
                vec![],
                HashMap::new(),
            );
            let outcome = fast()
                .connect(
                    &transport,
                    &descriptor("hk-postgres-dev"),
                    54320,
                    "houlak",
                    CancellationToken::new(),
                )
                .await;
            assert!(matches!(
                outcome.reason,
                ClosureReason::StartupFailure { code: None, ref detail } if detail.contains("failed to launch")
            ));
        }

        #[tokio::test]
        async fn test_cancel_while_active_is_user_cancelled() {
            let supervisor = fast();
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                trigger.cancel();
            });
            let start = Instant::now();
            let outcome = supervisor
                .connect(
                    &sh("sleep 30"),
                    &descriptor("hk-postgres-dev"),
                    54320,
                    "houlak",
                    cancel,
                )
                .await;
            assert_eq!(outcome.reason, ClosureReason::UserCancelled);
            assert!(outcome.active_for.is_some());
            assert!(start.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_cancel_wins_over_nonzero_exit_on_terminate() {
            let supervisor = fast();
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                trigger.cancel();
            });
            let outcome = supervisor
                .connect(
                    &sh("trap 'exit 255' TERM; while true; do sleep 0.1; done"),
                    &descriptor("hk-postgres-dev"),
                    54320,
                    "houlak",
                    cancel,
                )
                .await;
            assert_eq!(outcome.reason, ClosureReason::UserCancelled);
        }

        #[tokio::test]
        async fn test_cancel_force_kills_stubborn_process() {
            let supervisor =
                TunnelSupervisor::new(Duration::from_millis(150), Duration::from_millis(300));
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                trigger.cancel();
            });
            let start = Instant::now();
            let outcome = supervisor
                .connect(
                    &sh("trap '' TERM; while true; do sleep 0.1; done"),
                    &descriptor("hk-postgres-dev"),
                    54320,
                    "houlak",
                    cancel,
                )
                .await;
            assert_eq!(outcome.reason, ClosureReason::UserCancelled);
            assert!(start.elapsed() >= Duration::from_millis(800));
            assert!(start.elapsed() < Duration::from_secs(10));
        }

        #[tokio::test]
        async fn test_cancel_during_starting_is_user_cancelled() {
            let supervisor = TunnelSupervisor::new(Duration::from_secs(10), Duration::from_secs(2));
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });
            let outcome = supervisor
                .connect(
                    &sh("sleep 30"),
                    &descriptor("hk-postgres-dev"),
                    54320,
                    "houlak",
                    cancel,
                )
                .await;
            assert_eq!(outcome.reason, ClosureReason::UserCancelled);
            assert!(outcome.active_for.is_none());
        }

        #[tokio::test]
        async fn test_ready_pattern_activates_before_grace() {
            let supervisor = TunnelSupervisor::new(Duration::from_secs(30), Duration::from_secs(2))
                .with_ready_pattern(Regex::new("Waiting for connections").unwrap());
            let (state_tx, mut state_rx) = watch::channel(TunnelState::Starting);
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();

            let watcher = tokio::spawn(async move {
                let became_active = tokio::time::timeout(
                    Duration::from_secs(5),
                    state_rx.wait_for(|s| *s == TunnelState::Active),
                )
                .await
                .is_ok();
                trigger.cancel();
                became_active
            });

            let desc = descriptor("hk-postgres-dev");
            let outcome = supervisor
                .connect_observed(
                    &sh("echo 'Waiting for connections...'; sleep 30"),
                    &desc,
                    54320,
                    "houlak",
                    cancel,
                    state_tx,
                )
                .await;
            assert!(watcher.await.unwrap(), "tunnel never became Active");
            assert_eq!(outcome.reason, ClosureReason::UserCancelled);
        }

        #[tokio::test]
        async fn test_observed_states_end_closed() {
            let (state_tx, state_rx) = watch::channel(TunnelState::Starting);
            let desc = descriptor("hk-postgres-dev");
            let outcome = fast()
                .connect_observed(
                    &sh("sleep 0.4; exit 255"),
                    &desc,
                    54320,
                    "houlak",
                    CancellationToken::new(),
                    state_tx,
                )
                .await;
            assert_eq!(*state_rx.borrow(), TunnelState::Closed(outcome.reason.clone()));
        }

        #[tokio::test]
        async fn test_concurrent_tunnels_are_independent() {
            let supervisor = fast();
            let desc = descriptor("hk-postgres-dev");
            let transport = sh("sleep 30");
            let cancel_a = CancellationToken::new();
            let cancel_b = CancellationToken::new();

            let trigger_a = cancel_a.clone();
            let trigger_b = cancel_b.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(400)).await;
                trigger_a.cancel();
                tokio::time::sleep(Duration::from_millis(600)).await;
                trigger_b.cancel();
            });

            let ended = sh("sleep 0.6; exit 255");
            let (a, b, c) = tokio::join!(
                supervisor.connect(&transport, &desc, 54320, "houlak", cancel_a),
                supervisor.connect(&transport, &desc, 54321, "houlak", cancel_b),
                supervisor.connect(&ended, &desc, 54322, "houlak", CancellationToken::new()),
            );
            assert_eq!(a.reason, ClosureReason::UserCancelled);
            assert_eq!(a.local_port, 54320);
            assert_eq!(b.reason, ClosureReason::UserCancelled);
            assert_eq!(b.local_port, 54321);
            assert!(b.active_for.unwrap() > a.active_for.unwrap());
            assert_eq!(c.reason, ClosureReason::AbnormalTermination { code: Some(255) });
        }
    }
}
