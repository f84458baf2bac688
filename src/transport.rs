//! Remote Tunnel Transport: builds the command the supervisor launches.
//!
//! Launchers only describe the process (program, args, env). Spawning,
//! signalling and waiting belong to the supervisor alone.

use std::collections::HashMap;

use tokio::process::Command;

use crate::config::{fill_placeholders, resolve_env_vars, TransportKind, TunnelConfig};
use crate::descriptor::ConnectionDescriptor;

/// SSM document that forwards a local port to a host reachable from the bastion.
pub const SSM_PORT_FORWARD_DOCUMENT: &str = "AWS-StartPortForwardingSessionToRemoteHost";

/// Everything a transport needs to open one tunnel.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub descriptor: &'a ConnectionDescriptor,
    pub local_port: u16,
    pub identity: &'a str,
}

/// Builds the transport command for a launch request.
pub trait TransportLauncher {
    /// Program name, for logs.
    fn program(&self) -> &str;

    /// Arguments for this request.
    fn args(&self, request: &LaunchRequest<'_>) -> Vec<String>;

    /// Extra environment for the child.
    fn env(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Assemble the unspawned command. Stdio is configured by the supervisor.
    fn command(&self, request: &LaunchRequest<'_>) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.args(request));
        let env = self.env();
        if !env.is_empty() {
            cmd.envs(env);
        }
        cmd
    }
}

/// `aws ssm start-session` port forwarding through the bastion.
#[derive(Debug, Clone)]
pub struct SsmTransport {
    aws_binary: String,
}

impl SsmTransport {
    pub fn new(aws_binary: impl Into<String>) -> Self {
        Self {
            aws_binary: aws_binary.into(),
        }
    }
}

impl TransportLauncher for SsmTransport {
    fn program(&self) -> &str {
        &self.aws_binary
    }

    fn args(&self, request: &LaunchRequest<'_>) -> Vec<String> {
        let desc = request.descriptor;
        let parameters = serde_json::json!({
            "host": [desc.remote_host()],
            "portNumber": [desc.remote_port().to_string()],
            "localPortNumber": [request.local_port.to_string()],
        });
        vec![
            "ssm".to_string(),
            "start-session".to_string(),
            "--target".to_string(),
            desc.bastion_id().to_string(),
            "--document-name".to_string(),
            SSM_PORT_FORWARD_DOCUMENT.to_string(),
            "--parameters".to_string(),
            parameters.to_string(),
            "--profile".to_string(),
            request.identity.to_string(),
            "--region".to_string(),
            desc.region().to_string(),
        ]
    }
}

/// Any program, with `{placeholder}`s in its args filled per request.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CommandTransport {
    /// `env` values are `${VAR}` references, resolved at spawn time.
    pub fn new(program: impl Into<String>, args: Vec<String>, env: HashMap<String, String>) -> Self {
        Self {
            program: program.into(),
            args,
            env,
        }
    }
}

impl TransportLauncher for CommandTransport {
    fn program(&self) -> &str {
        &self.program
    }

    fn args(&self, request: &LaunchRequest<'_>) -> Vec<String> {
        let desc = request.descriptor;
        let lookup = |name: &str| -> Option<String> {
            match name {
                "local_port" => Some(request.local_port.to_string()),
                "remote_host" => Some(desc.remote_host().to_string()),
                "remote_port" => Some(desc.remote_port().to_string()),
                "bastion_id" => Some(desc.bastion_id().to_string()),
                "region" => Some(desc.region().to_string()),
                "identity" => Some(request.identity.to_string()),
                "database" => Some(desc.name().to_string()),
                _ => None,
            }
        };
        self.args
            .iter()
            .map(|arg| fill_placeholders(arg, lookup))
            .collect()
    }

    fn env(&self) -> HashMap<String, String> {
        resolve_env_vars(&self.env)
    }
}

/// Launcher chosen by `[transport] kind`.
#[derive(Debug, Clone)]
pub enum ConfiguredTransport {
    Ssm(SsmTransport),
    Command(CommandTransport),
}

impl ConfiguredTransport {
    pub fn from_config(config: &TunnelConfig) -> Self {
        let transport = &config.transport;
        match transport.kind {
            TransportKind::Ssm => ConfiguredTransport::Ssm(SsmTransport::new(&transport.aws_binary)),
            TransportKind::Command => ConfiguredTransport::Command(CommandTransport::new(
                transport.program.clone().unwrap_or_default(),
                transport.args.clone(),
                transport.env.clone(),
            )),
        }
    }
}

impl TransportLauncher for ConfiguredTransport {
    fn program(&self) -> &str {
        match self {
            ConfiguredTransport::Ssm(t) => t.program(),
            ConfiguredTransport::Command(t) => t.program(),
        }
    }

    fn args(&self, request: &LaunchRequest<'_>) -> Vec<String> {
        match self {
            ConfiguredTransport::Ssm(t) => t.args(request),
            ConfiguredTransport::Command(t) => t.args(request),
        }
    }

    fn env(&self) -> HashMap<String, String> {
        match self {
            ConfiguredTransport::Ssm(t) => t.env(),
            ConfiguredTransport::Command(t) => t.env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::DatabaseRecord;

    fn descriptor() -> ConnectionDescriptor {
        let rec: DatabaseRecord = serde_json::from_str(
            r#"{"engine":"postgres","bastionInstanceId":"i-0abc","rdsEndpoint":"db.internal","rdsPort":5432,"region":"us-east-2"}"#,
        )
        .unwrap();
        rec.into_descriptor("hk-postgres-dev", "us-east-1").unwrap()
    }

    #[test]
    fn test_ssm_args() {
        let desc = descriptor();
        let request = LaunchRequest {
            descriptor: &desc,
            local_port: 54320,
            identity: "houlak",
        };
        let args = SsmTransport::new("aws").args(&request);
        assert_eq!(&args[..2], &["ssm", "start-session"]);
        assert!(args.windows(2).any(|w| w == ["--target", "i-0abc"]));
        assert!(args.windows(2).any(|w| w == ["--document-name", SSM_PORT_FORWARD_DOCUMENT]));
        assert!(args.windows(2).any(|w| w == ["--profile", "houlak"]));
        assert!(args.windows(2).any(|w| w == ["--region", "us-east-2"]));

        let params_pos = args.iter().position(|a| a == "--parameters").unwrap();
        let params: serde_json::Value = serde_json::from_str(&args[params_pos + 1]).unwrap();
        assert_eq!(params["host"][0], "db.internal");
        assert_eq!(params["portNumber"][0], "5432");
        assert_eq!(params["localPortNumber"][0], "54320");
    }

    #[test]
    fn test_command_placeholders() {
        let desc = descriptor();
        let request = LaunchRequest {
            descriptor: &desc,
            local_port: 15432,
            identity: "ops",
        };
        let transport = CommandTransport::new(
            "ssh",
            vec![
                "-N".to_string(),
                "-L".to_string(),
                "{local_port}:{remote_host}:{remote_port}".to_string(),
                "{bastion_id}".to_string(),
                "--tag={database}@{region}/{identity}".to_string(),
            ],
            HashMap::new(),
        );
        assert_eq!(
            transport.args(&request),
            vec![
                "-N",
                "-L",
                "15432:db.internal:5432",
                "i-0abc",
                "--tag=hk-postgres-dev@us-east-2/ops",
            ]
        );
    }

    #[test]
    fn test_command_env_resolved() {
        // SAFETY: test-only, no concurrent threads depend on this env var.
        unsafe { std::env::set_var("DBTUNNEL_TRANSPORT_TEST", "agent.sock") };
        let mut env = HashMap::new();
        env.insert("SSH_AUTH_SOCK".to_string(), "${DBTUNNEL_TRANSPORT_TEST}".to_string());
        let transport = CommandTransport::new("ssh", vec![], env);
        assert_eq!(transport.env().get("SSH_AUTH_SOCK").unwrap(), "agent.sock");
        // SAFETY: test-only cleanup.
        unsafe { std::env::remove_var("DBTUNNEL_TRANSPORT_TEST") };
    }

    #[test]
    fn test_configured_transport_from_config() {
        let config = TunnelConfig::default();
        assert!(matches!(
            ConfiguredTransport::from_config(&config),
            ConfiguredTransport::Ssm(_)
        ));

        let config = TunnelConfig::from_toml(
            r#"
            [transport]
            kind = "command"
            program = "ssh"
            args = ["{bastion_id}"]
            "#,
        )
        .unwrap();
        let transport = ConfiguredTransport::from_config(&config);
        assert_eq!(transport.program(), "ssh");
    }
}
