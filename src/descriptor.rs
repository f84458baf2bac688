//! Database engines, directory records, and resolved connection descriptors.
//!
//! A [`DatabaseRecord`] is what the directory stores: loosely typed, every
//! field optional. [`DatabaseRecord::into_descriptor`] is the only way to get
//! a [`ConnectionDescriptor`], so a descriptor is either complete or never
//! exists.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::TunnelError;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Postgres,
    Mariadb,
    Mysql,
}

impl Engine {
    /// Canonical lowercase name, as used in directory keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mariadb => "mariadb",
            Engine::Mysql => "mysql",
        }
    }

    /// Local port tried first when the caller does not pick one.
    pub fn default_local_port(&self) -> u16 {
        match self {
            Engine::Postgres => 54320,
            Engine::Mariadb | Engine::Mysql => 33060,
        }
    }

    /// Port the engine listens on remotely when the record does not say.
    pub fn default_remote_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::Mariadb | Engine::Mysql => 3306,
        }
    }
}

impl FromStr for Engine {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mariadb" => Ok(Engine::Mariadb),
            "mysql" => Ok(Engine::Mysql),
            _ => Err(TunnelError::InvalidIdentifier(
                s.to_string(),
                "unsupported engine (expected postgres, mariadb or mysql)".to_string(),
            )),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Port values arrive as numbers or strings depending on who wrote the entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortField {
    Number(u64),
    Text(String),
}

impl PortField {
    fn to_port(&self) -> Option<u16> {
        let value = match self {
            PortField::Number(n) => *n,
            PortField::Text(s) => s.trim().parse::<u64>().ok()?,
        };
        u16::try_from(value).ok().filter(|p| *p != 0)
    }
}

/// Raw directory entry, deserialized from the stored JSON (or local TOML).
///
/// Keys follow the directory's camelCase convention. Unknown keys such as
/// `project` or `defaultProfile` are accepted and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseRecord {
    pub engine: Option<String>,
    pub bastion_instance_id: Option<String>,
    pub rds_endpoint: Option<String>,
    pub rds_port: Option<PortField>,
    pub region: Option<String>,
    pub default_local_port: Option<PortField>,
}

impl DatabaseRecord {
    /// Turn a raw entry into a complete descriptor or fail with
    /// `IncompleteRecord`. `fallback_region` fills a missing `region`.
    pub fn into_descriptor(
        self,
        name: &str,
        fallback_region: &str,
    ) -> crate::Result<ConnectionDescriptor> {
        let incomplete = |reason: String| TunnelError::IncompleteRecord(name.to_string(), reason);

        let engine = match self.engine.as_deref() {
            None => Engine::Postgres,
            Some(raw) => raw
                .parse::<Engine>()
                .map_err(|_| incomplete(format!("unsupported engine '{}'", raw)))?,
        };

        let bastion_id = non_empty(self.bastion_instance_id)
            .ok_or_else(|| incomplete("missing 'bastionInstanceId'".to_string()))?;
        let remote_host = non_empty(self.rds_endpoint)
            .ok_or_else(|| incomplete("missing 'rdsEndpoint'".to_string()))?;
        let remote_port = match self.rds_port {
            None => return Err(incomplete("missing 'rdsPort'".to_string())),
            Some(field) => field
                .to_port()
                .ok_or_else(|| incomplete(format!("invalid 'rdsPort' {:?}", field)))?,
        };
        let default_local_port = match self.default_local_port {
            None => engine.default_local_port(),
            Some(field) => field
                .to_port()
                .ok_or_else(|| incomplete(format!("invalid 'defaultLocalPort' {:?}", field)))?,
        };
        let region = non_empty(self.region).unwrap_or_else(|| fallback_region.to_string());

        Ok(ConnectionDescriptor {
            name: name.to_string(),
            engine,
            bastion_id,
            remote_host,
            remote_port,
            region,
            default_local_port,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Fully resolved connection metadata for one database. Immutable.
///
/// `bastion_id`, `remote_host` and `region` are operator-facing only and must
/// not appear in default user output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    name: String,
    engine: Engine,
    bastion_id: String,
    remote_host: String,
    remote_port: u16,
    region: String,
    default_local_port: u16,
}

impl ConnectionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> Engine {
        self.engine
    }

    pub fn bastion_id(&self) -> &str {
        &self.bastion_id
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Starting point for the port search when no port was requested.
    pub fn default_local_port(&self) -> u16 {
        self.default_local_port
    }
}
