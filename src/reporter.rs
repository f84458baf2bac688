//! Connection Reporter: user-facing text for tunnel events.
//!
//! Pure formatting: every function returns lines and the caller prints them.
//! `remote_host`, `bastion_id` and `region` appear only when the reporter is
//! verbose.

use std::time::Duration;

use crate::descriptor::ConnectionDescriptor;
use crate::error::TunnelError;
use crate::supervisor::{ClosureReason, TunnelOutcome};

/// Host the tunnel listens on, as shown to users.
pub const LOCAL_HOST: &str = "localhost";

/// Process exit code for successful or cancelled runs.
pub const EXIT_OK: u8 = 0;
/// Process exit code for failed setup or failed tunnels.
pub const EXIT_FAILURE: u8 = 1;

/// Rendered message plus the exit code the binary should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub lines: Vec<String>,
    pub exit_code: u8,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.exit_code == EXIT_OK
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionReporter {
    identity: String,
    verbose: bool,
}

impl ConnectionReporter {
    pub fn new(identity: impl Into<String>, verbose: bool) -> Self {
        Self {
            identity: identity.into(),
            verbose,
        }
    }

    /// Banner printed once the tunnel is Active.
    pub fn connected(&self, descriptor: &ConnectionDescriptor, local_port: u16) -> Vec<String> {
        let mut lines = vec![
            format!("Connected to {}", descriptor.name()),
            String::new(),
            format!("  Host:   {}", LOCAL_HOST),
            format!("  Port:   {}", local_port),
            format!("  Engine: {}", descriptor.engine()),
        ];
        if self.verbose {
            lines.extend(self.operator_fields(descriptor));
        }
        lines.push(String::new());
        lines.push("Press Ctrl+C to close the tunnel.".to_string());
        lines
    }

    /// Final report for a tunnel that reached Closed.
    pub fn report(
        &self,
        descriptor: &ConnectionDescriptor,
        local_port: u16,
        outcome: &TunnelOutcome,
    ) -> Report {
        let name = descriptor.name();
        let mut lines = Vec::new();

        match &outcome.reason {
            ClosureReason::UserCancelled => {
                lines.push(format!("Tunnel to {} on port {} closed.", name, local_port));
            }
            ClosureReason::RemoteEndedCleanly => {
                lines.push(format!(
                    "Tunnel to {} on port {} ended by the remote side{}.",
                    name,
                    local_port,
                    active_suffix(outcome.active_for)
                ));
            }
            ClosureReason::StartupFailure { code, detail } => {
                lines.push(format!(
                    "Tunnel to {} on port {} failed to start: {}",
                    name, local_port, detail
                ));
                lines.extend(startup_causes(*code, local_port, &outcome.stderr_tail));
                lines.extend(self.next_steps(name));
            }
            ClosureReason::AbnormalTermination { code } => {
                let code_text = match code {
                    Some(code) => format!("exit code {}", code),
                    None => "termination by signal".to_string(),
                };
                lines.push(format!(
                    "Tunnel to {} on port {} ended unexpectedly with {}{}.",
                    name,
                    local_port,
                    code_text,
                    active_suffix(outcome.active_for)
                ));
                lines.extend(termination_causes(*code, &outcome.stderr_tail));
                lines.extend(self.next_steps(name));
            }
        }

        if self.verbose {
            lines.extend(self.operator_fields(descriptor));
            if !outcome.stderr_tail.is_empty() {
                lines.push(String::new());
                lines.push("Transport output (last lines):".to_string());
                lines.extend(outcome.stderr_tail.iter().map(|l| format!("  {}", l)));
            }
        }

        let exit_code = if outcome.reason.is_error() {
            EXIT_FAILURE
        } else {
            EXIT_OK
        };
        Report { lines, exit_code }
    }

    /// Report for an error raised before any process was launched.
    pub fn setup_error(&self, error: &TunnelError) -> Report {
        let mut lines = vec![format!("error: {}", error)];
        match error {
            TunnelError::Unauthenticated(identity, _) => {
                lines.push(format!("  Log in with: aws sso login --profile {}", identity));
            }
            TunnelError::DatabaseNotFound(_) => {
                lines.push("  Check the project, engine and environment spelling.".to_string());
            }
            TunnelError::PortInUse(_) | TunnelError::InvalidPort(_) => {
                lines.push("  Pick another --port or omit it to search for a free one.".to_string());
            }
            TunnelError::Directory(_, _) => {
                lines.push(format!(
                    "  Verify access with: aws sts get-caller-identity --profile {}",
                    self.identity
                ));
            }
            _ => {}
        }
        Report {
            lines,
            exit_code: EXIT_FAILURE,
        }
    }

    fn next_steps(&self, name: &str) -> Vec<String> {
        vec![
            String::new(),
            "Next steps:".to_string(),
            format!("  1. Refresh credentials: aws sso login --profile {}", self.identity),
            format!(
                "  2. Reconnect with diagnostics: dbtunnel connect {} --profile {} --verbose",
                name, self.identity
            ),
        ]
    }

    fn operator_fields(&self, descriptor: &ConnectionDescriptor) -> Vec<String> {
        vec![
            String::new(),
            "Operator details:".to_string(),
            format!("  Bastion: {}", descriptor.bastion_id()),
            format!(
                "  Remote:  {}:{}",
                descriptor.remote_host(),
                descriptor.remote_port()
            ),
            format!("  Region:  {}", descriptor.region()),
            format!("  Profile: {}", self.identity),
        ]
    }
}

/// Failure signature recognised in transport stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// Bastion not registered with Session Manager, or its agent is down
    TargetNotConnected,
    /// Caller lacks permission to start the session
    AccessDenied,
}

/// Scan stderr lines for a known failure signature. Lines are never echoed.
pub fn classify_stderr(stderr_tail: &[String]) -> Option<TransportFailure> {
    if stderr_tail.iter().any(|l| l.contains("TargetNotConnected")) {
        Some(TransportFailure::TargetNotConnected)
    } else if stderr_tail.iter().any(|l| l.contains("AccessDenied")) {
        Some(TransportFailure::AccessDenied)
    } else {
        None
    }
}

fn signature_causes(failure: TransportFailure) -> Vec<String> {
    let causes: &[&str] = match failure {
        TransportFailure::TargetNotConnected => &[
            "  - Bastion host is not connected to Session Manager",
            "  - SSM Agent may not be running on the bastion host",
            "  - Bastion host is stopped",
        ],
        TransportFailure::AccessDenied => &[
            "  - IAM permissions issue: check your role or user permissions",
            "  - Missing ssm:StartSession permission on the bastion",
        ],
    };
    let mut lines = vec![String::new(), "Likely cause:".to_string()];
    lines.extend(causes.iter().map(|c| c.to_string()));
    lines
}

fn startup_causes(code: Option<i32>, local_port: u16, stderr_tail: &[String]) -> Vec<String> {
    if let Some(failure) = classify_stderr(stderr_tail) {
        return signature_causes(failure);
    }
    let mut lines = vec![String::new()];
    if code == Some(255) || code.is_none() {
        lines.push("Common causes:".to_string());
        lines.push("  - AWS SSO session expired or invalid".to_string());
        lines.push("  - Missing permission to start a session on the bastion".to_string());
        lines.push("  - Bastion host stopped or not registered with Session Manager".to_string());
        lines.push("  - Session Manager plugin missing or outdated".to_string());
    } else {
        lines.push(format!(
            "  - Port {} may have been taken after it was checked; try again",
            local_port
        ));
    }
    lines
}

fn termination_causes(code: Option<i32>, stderr_tail: &[String]) -> Vec<String> {
    if let Some(failure) = classify_stderr(stderr_tail) {
        return signature_causes(failure);
    }
    if code != Some(255) {
        return Vec::new();
    }
    vec![
        String::new(),
        "Exit code 255 usually means:".to_string(),
        "  - The AWS SSO session expired while the tunnel was open".to_string(),
        "  - The connection to the bastion host was lost".to_string(),
        "  - The Session Manager connection timed out".to_string(),
    ]
}

fn active_suffix(active_for: Option<Duration>) -> String {
    match active_for {
        Some(d) => format!(" after {}", format_duration(d)),
        None => String::new(),
    }
}

/// `1h 02m 03s` style, dropping leading zero units.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
