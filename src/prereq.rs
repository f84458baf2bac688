//! Prerequisite check behind `dbtunnel check`.
//!
//! Read-only: never renews a session and never launches a tunnel.

use std::time::Duration;

use tokio::process::Command;

use crate::config::{TransportKind, TunnelConfig};
use crate::process::run_captured;
use crate::session::{AwsSsoCredentialStore, CredentialStatus, CredentialStore};

/// Executable the `aws ssm start-session` command hands the tunnel to.
pub const SESSION_MANAGER_PLUGIN: &str = "session-manager-plugin";

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// One named check and its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            passed: false,
            detail: detail.into(),
        }
    }
}

pub fn all_passed(results: &[CheckResult]) -> bool {
    results.iter().all(|r| r.passed)
}

#[derive(Debug, Clone)]
pub struct PrereqChecker {
    aws_binary: String,
    plugin_binary: Option<String>,
}

impl PrereqChecker {
    /// `plugin_binary = None` skips the Session Manager plugin check.
    pub fn new(aws_binary: impl Into<String>, plugin_binary: Option<String>) -> Self {
        Self {
            aws_binary: aws_binary.into(),
            plugin_binary,
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        let plugin = match config.transport.kind {
            TransportKind::Ssm => Some(SESSION_MANAGER_PLUGIN.to_string()),
            TransportKind::Command => None,
        };
        Self::new(config.transport.aws_binary.clone(), plugin)
    }

    pub async fn run(&self, store: &AwsSsoCredentialStore, identity: &str) -> Vec<CheckResult> {
        let mut results = vec![self.check_aws_cli().await];
        if let Some(plugin) = &self.plugin_binary {
            results.push(check_on_path("session-manager-plugin", plugin));
        }
        results.push(check_profile(store, identity));
        results.push(check_session(store, identity));

        for r in &results {
            tracing::debug!(check = r.name, passed = r.passed, detail = %r.detail, "prerequisite");
        }
        results
    }

    async fn check_aws_cli(&self) -> CheckResult {
        const NAME: &str = "aws-cli";
        let path = match which::which(&self.aws_binary) {
            Ok(path) => path,
            Err(_) => return CheckResult::fail(NAME, format!("'{}' not found on PATH", self.aws_binary)),
        };

        let mut cmd = Command::new(&path);
        cmd.arg("--version");
        match run_captured(cmd, VERSION_TIMEOUT).await {
            Ok(output) if output.status.success() => {
                // aws v1 prints its version on stderr
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let version = if stdout.trim().is_empty() {
                    stderr.trim().to_string()
                } else {
                    stdout.trim().to_string()
                };
                CheckResult::pass(NAME, version)
            }
            Ok(output) => CheckResult::fail(
                NAME,
                format!(
                    "'{} --version' exited with code {}",
                    path.display(),
                    output.status.code().unwrap_or(-1)
                ),
            ),
            Err(e) => CheckResult::fail(NAME, e.to_string()),
        }
    }
}

fn check_on_path(name: &'static str, binary: &str) -> CheckResult {
    match which::which(binary) {
        Ok(path) => CheckResult::pass(name, path.display().to_string()),
        Err(_) => CheckResult::fail(name, format!("'{}' not found on PATH", binary)),
    }
}

fn check_profile(store: &AwsSsoCredentialStore, identity: &str) -> CheckResult {
    if store.has_profile(identity) {
        CheckResult::pass("profile", format!("profile '{}' is configured", identity))
    } else {
        CheckResult::fail(
            "profile",
            format!("profile '{}' not found in the AWS config file", identity),
        )
    }
}

fn check_session(store: &AwsSsoCredentialStore, identity: &str) -> CheckResult {
    match store.status(identity) {
        CredentialStatus::Valid => CheckResult::pass("session", "session is valid"),
        CredentialStatus::Expired => CheckResult::fail(
            "session",
            format!("session expired, run: aws sso login --profile {}", identity),
        ),
        CredentialStatus::Missing => CheckResult::fail(
            "session",
            format!("no session found, run: aws sso login --profile {}", identity),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(config: &str) -> (tempfile::TempDir, AwsSsoCredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let config_file = dir.path().join("config");
        std::fs::write(&config_file, config).unwrap();
        let cache = dir.path().join("cache");
        std::fs::create_dir(&cache).unwrap();
        let store = AwsSsoCredentialStore::new("aws", config_file, cache);
        (dir, store)
    }

    #[test]
    fn test_profile_and_session_checks() {
        let (_dir, store) = store_with("[profile houlak]\nregion = us-east-1\n");
        assert!(check_profile(&store, "houlak").passed);
        assert!(check_session(&store, "houlak").passed);

        let missing = check_profile(&store, "ops");
        assert!(!missing.passed);
        assert!(missing.detail.contains("ops"));
        let session = check_session(&store, "ops");
        assert!(!session.passed);
        assert!(session.detail.contains("aws sso login --profile ops"));
    }

    #[test]
    fn test_missing_binary_fails() {
        let result = check_on_path("session-manager-plugin", "dbtunnel-no-such-plugin-binary");
        assert!(!result.passed);
        assert!(result.detail.contains("not found"));
    }

    #[test]
    fn test_all_passed() {
        assert!(all_passed(&[CheckResult::pass("a", "")]));
        assert!(!all_passed(&[CheckResult::pass("a", ""), CheckResult::fail("b", "")]));
    }

    #[test]
    fn test_plugin_skipped_for_command_transport() {
        let config = TunnelConfig::from_toml(
            r#"
            [transport]
            kind = "command"
            program = "ssh"
            "#,
        )
        .unwrap();
        assert!(PrereqChecker::from_config(&config).plugin_binary.is_none());
        assert_eq!(
            PrereqChecker::from_config(&TunnelConfig::default()).plugin_binary.as_deref(),
            Some(SESSION_MANAGER_PLUGIN)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_version_and_failures() {
        use std::os::unix::fs::PermissionsExt;

        let (dir, store) = store_with("[profile houlak]\nregion = us-east-1\n");
        let fake_aws = dir.path().join("aws");
        std::fs::write(&fake_aws, "#!/bin/sh\necho 'aws-cli/2.15.0 Python/3.11.6'\n").unwrap();
        std::fs::set_permissions(&fake_aws, std::fs::Permissions::from_mode(0o755)).unwrap();

        let checker = PrereqChecker::new(
            fake_aws.to_string_lossy(),
            Some("dbtunnel-no-such-plugin-binary".to_string()),
        );
        let results = checker.run(&store, "houlak").await;
        let names: Vec<_> = results.iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["aws-cli", "session-manager-plugin", "profile", "session"]);
        assert!(results[0].passed);
        assert!(results[0].detail.contains("aws-cli/2.15.0"));
        assert!(!results[1].passed);
        assert!(!all_passed(&results));
    }
}
