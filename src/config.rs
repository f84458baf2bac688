//! dbtunnel configuration: deserialization and validation.
//!
//! Every field has a default, so an empty file (or no file at all) is a valid
//! configuration. The parsed value is passed explicitly to each component;
//! nothing here is process-global.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::descriptor::DatabaseRecord;
use crate::error::TunnelError;
use crate::resolver::validate_name;

/// Placeholders accepted in `[transport] args` for `kind = "command"`.
pub const PLACEHOLDERS: &[&str] = &[
    "local_port",
    "remote_host",
    "remote_port",
    "bastion_id",
    "region",
    "identity",
    "database",
];

/// Strip an env var reference to its variable name.
///
/// Accepts `${VAR_NAME}` syntax only. Returns `None` if the value is not a
/// valid env-var reference.
pub fn parse_env_ref(value: &str) -> Option<&str> {
    value.strip_prefix("${").and_then(|s| s.strip_suffix('}'))
}

/// Resolve a map of `${VAR}` references to their current values.
///
/// Unset variables resolve to the empty string.
pub fn resolve_env_vars(env: &HashMap<String, String>) -> HashMap<String, String> {
    env.iter()
        .map(|(k, v)| {
            let resolved = match parse_env_ref(v) {
                Some(var_name) => std::env::var(var_name).unwrap_or_default(),
                None => v.clone(),
            };
            (k.clone(), resolved)
        })
        .collect()
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_]+)\}").expect("static regex"))
}

/// Replace `{name}` placeholders in `template` using `lookup`.
/// Unknown placeholders are left as-is (rejected earlier by `validate()`).
pub fn fill_placeholders(template: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            lookup(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Top-level configuration, parsed from `dbtunnel.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Identity used when the caller does not name one.
    #[serde(default = "default_profile")]
    pub default_profile: String,
    /// Region used when a directory entry omits one.
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub ports: PortConfig,
    #[serde(default)]
    pub tunnel: SupervisorConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            default_profile: default_profile(),
            region: default_region(),
            directory: DirectoryConfig::default(),
            session: SessionConfig::default(),
            ports: PortConfig::default(),
            tunnel: SupervisorConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Where database entries are read from.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DirectoryKind {
    #[default]
    ParameterStore,
    Local,
}

/// `[directory]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub kind: DirectoryKind,
    /// Parameter Store namespace; entries live at `{prefix}/{name}`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Per-read timeout; the `aws` child is killed when it expires.
    #[serde(default = "default_directory_timeout_secs")]
    pub timeout_secs: u64,
    /// Entries for `kind = "local"`, keyed by canonical name.
    #[serde(default)]
    pub databases: HashMap<String, DatabaseRecord>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            kind: DirectoryKind::default(),
            prefix: default_prefix(),
            timeout_secs: default_directory_timeout_secs(),
            databases: HashMap::new(),
        }
    }
}

impl DirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[session]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Run one interactive login when the session is expired or missing.
    #[serde(default = "default_true")]
    pub auto_login: bool,
    /// Override for `~/.aws/sso/cache`.
    pub sso_cache_dir: Option<PathBuf>,
    /// Override for `~/.aws/config`.
    pub aws_config_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_login: true,
            sso_cache_dir: None,
            aws_config_file: None,
        }
    }
}

impl SessionConfig {
    pub fn sso_cache_dir(&self) -> PathBuf {
        match &self.sso_cache_dir {
            Some(dir) => expand_home(dir),
            None => expand_home(Path::new("~/.aws/sso/cache")),
        }
    }

    pub fn aws_config_file(&self) -> PathBuf {
        match &self.aws_config_file {
            Some(file) => expand_home(file),
            None => match std::env::var_os("AWS_CONFIG_FILE") {
                Some(env_path) => PathBuf::from(env_path),
                None => expand_home(Path::new("~/.aws/config")),
            },
        }
    }
}

/// `[ports]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PortConfig {
    /// How many consecutive ports to try upward from the engine default.
    #[serde(default = "default_search_attempts")]
    pub search_attempts: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            search_attempts: default_search_attempts(),
        }
    }
}

/// `[tunnel]` section: the supervisor's two bounded timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Time the transport must stay alive before the tunnel counts as Active.
    #[serde(default = "default_readiness_grace_ms")]
    pub readiness_grace_ms: u64,
    /// Wait after the graceful termination request before force-killing.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    /// Optional regex on transport output that marks readiness early.
    pub ready_pattern: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            readiness_grace_ms: default_readiness_grace_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            ready_pattern: None,
        }
    }
}

impl SupervisorConfig {
    pub fn readiness_grace(&self) -> Duration {
        Duration::from_millis(self.readiness_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Which launcher builds the transport command.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// `aws ssm start-session` port forwarding to a remote host.
    #[default]
    Ssm,
    /// Arbitrary program with placeholder-substituted args.
    Command,
}

/// `[transport]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub kind: TransportKind,
    /// The `aws` executable (SSM transport, directory reads, login).
    #[serde(default = "default_aws_binary")]
    pub aws_binary: String,
    /// Program for `kind = "command"`.
    pub program: Option<String>,
    /// Args for `kind = "command"`; may contain `{placeholder}`s.
    #[serde(default)]
    pub args: Vec<String>,
    /// Env var references (`${VAR}`), resolved at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            aws_binary: default_aws_binary(),
            program: None,
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

fn default_profile() -> String {
    "houlak".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "/houlak/cli/databases".to_string()
}

fn default_directory_timeout_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

fn default_search_attempts() -> u16 {
    20
}

fn default_readiness_grace_ms() -> u64 {
    2000
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_aws_binary() -> String {
    "aws".to_string()
}

fn invalid(section: &str, reason: impl Into<String>) -> TunnelError {
    TunnelError::InvalidConfig(section.to_string(), reason.into())
}

impl TunnelConfig {
    /// Parse a TOML document. Does not validate.
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| invalid("root", e.to_string()))
    }

    /// Validate the config, failing fast before anything is resolved or spawned.
    pub fn validate(&self) -> crate::Result<()> {
        if self.default_profile.trim().is_empty() {
            return Err(invalid("root", "default_profile must not be empty"));
        }
        if self.region.trim().is_empty() {
            return Err(invalid("root", "region must not be empty"));
        }

        // [directory]
        if self.directory.kind == DirectoryKind::ParameterStore {
            let prefix = &self.directory.prefix;
            if prefix.is_empty() || !prefix.starts_with('/') || prefix.ends_with('/') {
                return Err(invalid(
                    "directory",
                    format!("prefix must start with '/' and not end with '/', got '{}'", prefix),
                ));
            }
            if self.directory.timeout_secs == 0 {
                return Err(invalid("directory", "timeout_secs must be > 0"));
            }
        }
        for key in self.directory.databases.keys() {
            validate_name(key).map_err(|e| invalid("directory", e.to_string()))?;
        }

        // [ports]
        if self.ports.search_attempts == 0 {
            return Err(invalid("ports", "search_attempts must be > 0"));
        }

        // [tunnel]
        if self.tunnel.readiness_grace_ms == 0 {
            return Err(invalid("tunnel", "readiness_grace_ms must be > 0"));
        }
        if self.tunnel.shutdown_timeout_secs == 0 {
            return Err(invalid("tunnel", "shutdown_timeout_secs must be > 0"));
        }
        if let Some(pattern) = &self.tunnel.ready_pattern {
            Regex::new(pattern)
                .map_err(|e| invalid("tunnel", format!("ready_pattern is not a valid regex: {}", e)))?;
        }

        // [transport]
        if self.transport.aws_binary.trim().is_empty() {
            return Err(invalid("transport", "aws_binary must not be empty"));
        }
        match self.transport.kind {
            TransportKind::Ssm => {
                if self.transport.program.is_some() {
                    return Err(invalid(
                        "transport",
                        "kind = \"ssm\" should not have 'program' field",
                    ));
                }
            }
            TransportKind::Command => {
                let program = self.transport.program.as_deref().unwrap_or_default();
                if program.trim().is_empty() {
                    return Err(invalid("transport", "kind = \"command\" requires 'program'"));
                }
            }
        }
        for arg in &self.transport.args {
            for caps in placeholder_regex().captures_iter(arg) {
                let name = &caps[1];
                if !PLACEHOLDERS.contains(&name) {
                    return Err(invalid(
                        "transport",
                        format!(
                            "unknown placeholder '{{{}}}' in args. Available: {}",
                            name,
                            PLACEHOLDERS.join(", ")
                        ),
                    ));
                }
            }
        }
        for (key, value) in &self.transport.env {
            if parse_env_ref(value).is_none() {
                return Err(invalid(
                    "transport",
                    format!(
                        "env value for key '{}' must be a ${{VAR}} reference, got '{}'",
                        key, value
                    ),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> TunnelConfig {
        TunnelConfig::from_toml(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_parse_env_ref() {
        assert_eq!(parse_env_ref("${FOO}"), Some("FOO"));
        assert_eq!(parse_env_ref("$FOO"), None);
        assert_eq!(parse_env_ref("literal"), None);
        assert_eq!(parse_env_ref("${}"), Some(""));
    }

    #[test]
    fn test_resolve_env_vars() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("DBTUNNEL_TEST_VAR", "resolved_value") };
        let mut env = HashMap::new();
        env.insert("KEY".to_string(), "${DBTUNNEL_TEST_VAR}".to_string());
        let resolved = resolve_env_vars(&env);
        assert_eq!(resolved.get("KEY").unwrap(), "resolved_value");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("DBTUNNEL_TEST_VAR") };
    }

    #[test]
    fn test_fill_placeholders() {
        let out = fill_placeholders("--port={local_port} {unknown}", |name| {
            (name == "local_port").then(|| "54320".to_string())
        });
        assert_eq!(out, "--port=54320 {unknown}");
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home(Path::new("/etc/aws")), PathBuf::from("/etc/aws"));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_toml("");
        assert!(config.validate().is_ok());
        assert_eq!(config.default_profile, "houlak");
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.directory.kind, DirectoryKind::ParameterStore);
        assert_eq!(config.directory.prefix, "/houlak/cli/databases");
        assert_eq!(config.ports.search_attempts, 20);
        assert_eq!(config.tunnel.readiness_grace(), Duration::from_secs(2));
        assert_eq!(config.tunnel.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.transport.kind, TransportKind::Ssm);
        assert!(config.session.auto_login);
    }

    #[test]
    fn test_local_directory_entries() {
        let config = parse_toml(
            r#"
            [directory]
            kind = "local"

            [directory.databases.hk-postgres-dev]
            engine = "postgres"
            bastionInstanceId = "i-0abc"
            rdsEndpoint = "db.internal"
            rdsPort = 5432
            defaultLocalPort = 54320
            "#,
        );
        assert!(config.validate().is_ok());
        let rec = config.directory.databases.get("hk-postgres-dev").unwrap();
        assert_eq!(rec.bastion_instance_id.as_deref(), Some("i-0abc"));
    }

    #[test]
    fn test_local_directory_bad_key() {
        let config = parse_toml(
            r#"
            [directory]
            kind = "local"

            [directory.databases."HK_Postgres"]
            rdsPort = 5432
            "#,
        );
        let result = config.validate();
        assert!(matches!(result, Err(TunnelError::InvalidConfig(s, _)) if s == "directory"));
    }

    #[test]
    fn test_prefix_must_be_absolute() {
        let config = parse_toml(
            r#"
            [directory]
            prefix = "houlak/cli"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(TunnelError::InvalidConfig(s, msg)) if s == "directory" && msg.contains("prefix"))
        );
    }

    #[test]
    fn test_zero_search_attempts_rejected() {
        let config = parse_toml(
            r#"
            [ports]
            search_attempts = 0
            "#,
        );
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(s, _)) if s == "ports"));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = parse_toml(
            r#"
            [tunnel]
            shutdown_timeout_secs = 0
            "#,
        );
        assert!(
            matches!(config.validate(), Err(TunnelError::InvalidConfig(s, msg)) if s == "tunnel" && msg.contains("shutdown"))
        );
    }

    #[test]
    fn test_bad_ready_pattern_rejected() {
        let config = parse_toml(
            r#"
            [tunnel]
            ready_pattern = "("
            "#,
        );
        assert!(
            matches!(config.validate(), Err(TunnelError::InvalidConfig(s, msg)) if s == "tunnel" && msg.contains("ready_pattern"))
        );
    }

    #[test]
    fn test_command_transport_requires_program() {
        let config = parse_toml(
            r#"
            [transport]
            kind = "command"
            "#,
        );
        assert!(
            matches!(config.validate(), Err(TunnelError::InvalidConfig(s, msg)) if s == "transport" && msg.contains("program"))
        );
    }

    #[test]
    fn test_command_transport_unknown_placeholder() {
        let config = parse_toml(
            r#"
            [transport]
            kind = "command"
            program = "ssh"
            args = ["-L", "{local_port}:{remote_host}:{remote_port}", "{jump_host}"]
            "#,
        );
        assert!(
            matches!(config.validate(), Err(TunnelError::InvalidConfig(s, msg)) if s == "transport" && msg.contains("jump_host"))
        );
    }

    #[test]
    fn test_transport_env_reference_required() {
        let config = parse_toml(
            r#"
            [transport]
            kind = "command"
            program = "ssh"

            [transport.env]
            SSH_AUTH_SOCK = "/tmp/agent.sock"
            "#,
        );
        assert!(
            matches!(config.validate(), Err(TunnelError::InvalidConfig(s, msg)) if s == "transport" && msg.contains("SSH_AUTH_SOCK"))
        );
    }

    #[test]
    fn test_ssm_transport_rejects_program() {
        let config = parse_toml(
            r#"
            [transport]
            program = "ssh"
            "#,
        );
        assert!(matches!(config.validate(), Err(TunnelError::InvalidConfig(s, _)) if s == "transport"));
    }

    #[test]
    fn test_unknown_transport_kind_fails_parse() {
        let result = TunnelConfig::from_toml(
            r#"
            [transport]
            kind = "telnet"
            "#,
        );
        assert!(matches!(result, Err(TunnelError::InvalidConfig(s, _)) if s == "root"));
    }
}
