//! Session Validator: is the identity authorized right now?
//!
//! Local expiry markers are checked first (no network). Only when they say
//! expired or missing is a single renewal attempted, followed by exactly one
//! re-check. The validator never edits profile configuration.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;

use crate::config::TunnelConfig;

/// Tokens expiring within this window count as already expired.
const EXPIRY_SKEW_SECS: i64 = 60;

/// What the credential store reports about an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    Valid,
    Expired,
    Missing,
}

/// Outcome of [`SessionValidator::ensure_valid`]. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    /// Expired and renewal is disabled
    Expired,
    Unauthenticated,
}

/// Credential/Profile Store collaborator.
pub trait CredentialStore {
    /// Cheap local status check. Must not touch the network.
    fn status(&self, identity: &str) -> CredentialStatus;

    /// Run the (possibly interactive) renewal flow once. `true` on success.
    fn renew(&self, identity: &str) -> impl Future<Output = bool> + Send;
}

/// Confirms the identity has a live session, renewing at most once per call.
pub struct SessionValidator<C> {
    store: C,
    auto_login: bool,
}

impl<C: CredentialStore> SessionValidator<C> {
    pub fn new(store: C, auto_login: bool) -> Self {
        Self { store, auto_login }
    }

    pub async fn ensure_valid(&self, identity: &str) -> SessionStatus {
        let initial = self.store.status(identity);
        tracing::debug!(identity = %identity, status = ?initial, "local session status");
        if initial == CredentialStatus::Valid {
            return SessionStatus::Valid;
        }

        if !self.auto_login {
            return match initial {
                CredentialStatus::Expired => SessionStatus::Expired,
                _ => SessionStatus::Unauthenticated,
            };
        }

        tracing::info!(identity = %identity, "session expired or missing, requesting renewal");
        if !self.store.renew(identity).await {
            tracing::warn!(identity = %identity, "session renewal failed");
            return SessionStatus::Unauthenticated;
        }

        match self.store.status(identity) {
            CredentialStatus::Valid => SessionStatus::Valid,
            after => {
                tracing::warn!(identity = %identity, status = ?after, "session still invalid after renewal");
                SessionStatus::Unauthenticated
            }
        }
    }
}

/// Sections of an AWS shared config file, keyed by header text
/// (`profile dev`, `default`, `sso-session corp`).
pub type IniSections = HashMap<String, HashMap<String, String>>;

/// Minimal INI reader for `~/.aws/config`.
///
/// Handles `[section]` headers, `key = value` pairs and `#`/`;` comments.
/// Indented lines (nested `s3 =` blocks) are skipped.
pub fn parse_aws_config(content: &str) -> IniSections {
    let mut sections: IniSections = HashMap::new();
    let mut current: Option<String> = None;

    for raw in content.lines() {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            continue;
        }
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = header.split_whitespace().collect::<Vec<_>>().join(" ");
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        if let (Some(section), Some((key, value))) = (current.as_ref(), line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    sections
}

/// Look up the section for a profile (`[profile x]`, or `[default]`).
pub fn profile_section<'a>(
    sections: &'a IniSections,
    profile: &str,
) -> Option<&'a HashMap<String, String>> {
    let key = format!("profile {}", profile);
    sections
        .get(&key)
        .or_else(|| (profile == "default").then(|| sections.get("default")).flatten())
}

/// SSO start URL for a profile, either inline or through its `sso_session`.
///
/// `None` when the profile does not use SSO.
pub fn sso_start_url(sections: &IniSections, profile: &str) -> Option<String> {
    let section = profile_section(sections, profile)?;
    if let Some(url) = section.get("sso_start_url") {
        return Some(url.clone());
    }
    let session = section.get("sso_session")?;
    sections
        .get(&format!("sso-session {}", session))
        .and_then(|s| s.get("sso_start_url"))
        .cloned()
}

/// Parse `expiresAt` as written by AWS CLI v2 (`...Z`) or v1 (`...UTC`).
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    let trimmed = value.strip_suffix("UTC")?;
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedToken {
    start_url: Option<String>,
    expires_at: Option<String>,
    access_token: Option<String>,
}

/// Latest expiry among cached SSO tokens issued for `start_url`.
fn latest_token_expiry(cache_dir: &Path, start_url: &str) -> Option<DateTime<Utc>> {
    let entries = std::fs::read_dir(cache_dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .filter_map(|path| std::fs::read_to_string(&path).ok())
        .filter_map(|content| serde_json::from_str::<CachedToken>(&content).ok())
        .filter(|token| token.access_token.is_some())
        .filter(|token| token.start_url.as_deref() == Some(start_url))
        .filter_map(|token| token.expires_at.as_deref().and_then(parse_expiry))
        .max()
}

/// Credential store backed by the AWS CLI's config file and SSO token cache.
#[derive(Debug, Clone)]
pub struct AwsSsoCredentialStore {
    aws_binary: String,
    config_file: PathBuf,
    cache_dir: PathBuf,
}

impl AwsSsoCredentialStore {
    pub fn new(
        aws_binary: impl Into<String>,
        config_file: impl Into<PathBuf>,
        cache_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            aws_binary: aws_binary.into(),
            config_file: config_file.into(),
            cache_dir: cache_dir.into(),
        }
    }

    pub fn from_config(config: &TunnelConfig) -> Self {
        Self::new(
            config.transport.aws_binary.clone(),
            config.session.aws_config_file(),
            config.session.sso_cache_dir(),
        )
    }

    /// Whether the profile is declared in the AWS config file.
    pub fn has_profile(&self, identity: &str) -> bool {
        std::fs::read_to_string(&self.config_file)
            .map(|content| profile_section(&parse_aws_config(&content), identity).is_some())
            .unwrap_or(false)
    }

    /// Status as of `now`.
    pub fn status_at(&self, identity: &str, now: DateTime<Utc>) -> CredentialStatus {
        let Ok(content) = std::fs::read_to_string(&self.config_file) else {
            tracing::debug!(path = %self.config_file.display(), "aws config file not readable");
            return CredentialStatus::Missing;
        };
        let sections = parse_aws_config(&content);
        if profile_section(&sections, identity).is_none() {
            return CredentialStatus::Missing;
        }
        let Some(start_url) = sso_start_url(&sections, identity) else {
            // static credentials carry no local expiry marker
            return CredentialStatus::Valid;
        };
        match latest_token_expiry(&self.cache_dir, &start_url) {
            None => CredentialStatus::Missing,
            Some(expiry) if expiry <= now + ChronoDuration::seconds(EXPIRY_SKEW_SECS) => {
                CredentialStatus::Expired
            }
            Some(_) => CredentialStatus::Valid,
        }
    }
}

impl CredentialStore for AwsSsoCredentialStore {
    fn status(&self, identity: &str) -> CredentialStatus {
        self.status_at(identity, Utc::now())
    }

    async fn renew(&self, identity: &str) -> bool {
        tracing::info!(identity = %identity, "running aws sso login");
        let mut cmd = Command::new(&self.aws_binary);
        cmd.args(["sso", "login", "--profile", identity]);
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        match cmd.status().await {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!(identity = %identity, exit_code = ?status.code(), "sso login exited with failure");
                false
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "failed to run sso login");
                false
            }
        }
    }
}
