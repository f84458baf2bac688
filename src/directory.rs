//! Database Directory: read-only lookup from canonical name to record.
//!
//! Two backends:
//! - [`ParameterStoreDirectory`] reads `{prefix}/{name}` from AWS SSM
//!   Parameter Store through the `aws` CLI.
//! - [`LocalDirectory`] serves entries declared in `dbtunnel.toml`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tokio::process::Command;

use crate::config::{DirectoryKind, TunnelConfig};
use crate::descriptor::DatabaseRecord;
use crate::error::TunnelError;
use crate::process::{run_captured, RunError};

/// Read-only key-value lookup of directory entries.
///
/// `Ok(None)` means the key does not exist; `Err` means the directory could
/// not be read at all.
pub trait DatabaseDirectory {
    fn get(&self, name: &str) -> impl Future<Output = crate::Result<Option<DatabaseRecord>>> + Send;
}

/// Entries declared in configuration.
#[derive(Debug, Clone, Default)]
pub struct LocalDirectory {
    entries: HashMap<String, DatabaseRecord>,
}

impl LocalDirectory {
    pub fn new(entries: HashMap<String, DatabaseRecord>) -> Self {
        Self { entries }
    }
}

impl DatabaseDirectory for LocalDirectory {
    async fn get(&self, name: &str) -> crate::Result<Option<DatabaseRecord>> {
        Ok(self.entries.get(name).cloned())
    }
}

/// Parameter Store backed directory, queried with the caller's identity.
#[derive(Debug, Clone)]
pub struct ParameterStoreDirectory {
    aws_binary: String,
    prefix: String,
    profile: String,
    region: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GetParameterOutput {
    parameter: ParameterValue,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterValue {
    value: String,
}

impl ParameterStoreDirectory {
    pub fn new(
        aws_binary: impl Into<String>,
        prefix: impl Into<String>,
        profile: impl Into<String>,
        region: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            aws_binary: aws_binary.into(),
            prefix: prefix.into(),
            profile: profile.into(),
            region: region.into(),
            timeout,
        }
    }

    /// Full parameter path for a canonical name.
    pub fn parameter_name(&self, name: &str) -> String {
        format!("{}/{}", self.prefix, name)
    }

    /// Arguments for `aws ssm get-parameter`.
    pub fn get_parameter_args(&self, name: &str) -> Vec<String> {
        vec![
            "ssm".to_string(),
            "get-parameter".to_string(),
            "--name".to_string(),
            self.parameter_name(name),
            "--with-decryption".to_string(),
            "--output".to_string(),
            "json".to_string(),
            "--profile".to_string(),
            self.profile.clone(),
            "--region".to_string(),
            self.region.clone(),
        ]
    }
}

/// Decode `aws ssm get-parameter --output json` stdout into a record.
pub fn parse_parameter_output(name: &str, stdout: &str) -> crate::Result<DatabaseRecord> {
    let output: GetParameterOutput = serde_json::from_str(stdout).map_err(|e| {
        TunnelError::Directory(name.to_string(), format!("unexpected aws output: {}", e))
    })?;
    serde_json::from_str(&output.parameter.value).map_err(|e| {
        TunnelError::Directory(name.to_string(), format!("entry is not valid JSON: {}", e))
    })
}

impl DatabaseDirectory for ParameterStoreDirectory {
    async fn get(&self, name: &str) -> crate::Result<Option<DatabaseRecord>> {
        let mut cmd = Command::new(&self.aws_binary);
        cmd.args(self.get_parameter_args(name));

        let output = run_captured(cmd, self.timeout).await.map_err(|e| match e {
            RunError::Io(io) => TunnelError::Directory(
                name.to_string(),
                format!("failed to run '{}': {}", self.aws_binary, io),
            ),
            timed_out @ RunError::TimedOut(_) => {
                TunnelError::Directory(name.to_string(), timed_out.to_string())
            }
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            if stderr.contains("ParameterNotFound") {
                tracing::debug!(database = %name, "parameter not found");
                return Ok(None);
            }
            tracing::debug!(database = %name, stderr = %stderr.trim(), "get-parameter failed");
            let code = output.status.code().unwrap_or(-1);
            let detail = match aws_error_code(&stderr) {
                Some(error_code) => format!("aws exited with code {} ({})", code, error_code),
                None => format!("aws exited with code {}; re-run with --verbose for details", code),
            };
            return Err(TunnelError::Directory(name.to_string(), detail));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_parameter_output(name, &stdout).map(Some)
    }
}

/// Error code from aws CLI stderr, e.g. `AccessDeniedException` out of
/// `An error occurred (AccessDeniedException) when calling ...`.
/// The rest of the message carries ARNs and regions and stays out of errors.
pub fn aws_error_code(stderr: &str) -> Option<&str> {
    static ERROR_CODE: OnceLock<Regex> = OnceLock::new();
    let re = ERROR_CODE.get_or_init(|| {
        Regex::new(r"An error occurred \(([A-Za-z][A-Za-z0-9]*)\)").expect("static regex")
    });
    re.captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Directory backend chosen by `[directory] kind`.
#[derive(Debug, Clone)]
pub enum ConfiguredDirectory {
    Local(LocalDirectory),
    ParameterStore(ParameterStoreDirectory),
}

impl ConfiguredDirectory {
    /// Build the configured backend. Parameter Store reads use `identity`.
    pub fn from_config(config: &TunnelConfig, identity: &str) -> Self {
        match config.directory.kind {
            DirectoryKind::Local => {
                ConfiguredDirectory::Local(LocalDirectory::new(config.directory.databases.clone()))
            }
            DirectoryKind::ParameterStore => {
                ConfiguredDirectory::ParameterStore(ParameterStoreDirectory::new(
                    config.transport.aws_binary.clone(),
                    config.directory.prefix.clone(),
                    identity,
                    config.region.clone(),
                    config.directory.timeout(),
                ))
            }
        }
    }
}

impl DatabaseDirectory for ConfiguredDirectory {
    async fn get(&self, name: &str) -> crate::Result<Option<DatabaseRecord>> {
        match self {
            ConfiguredDirectory::Local(dir) => dir.get(name).await,
            ConfiguredDirectory::ParameterStore(dir) => dir.get(name).await,
        }
    }
}
