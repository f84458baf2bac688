//! Database Resolver: canonical naming and directory lookup.
//!
//! Canonical names are `{project}-{engine}-{environment}`: lowercase ASCII
//! letters, digits and single hyphens. Every call performs exactly one
//! directory read; nothing is cached.

use std::sync::OnceLock;

use regex::Regex;

use crate::descriptor::{ConnectionDescriptor, Engine};
use crate::directory::DatabaseDirectory;
use crate::error::TunnelError;

fn segment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("static regex"))
}

/// How the caller names a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseRef {
    /// A pre-built canonical name, e.g. `hk-postgres-dev`.
    Name(String),
    /// Parts joined into `{project}-{engine}-{environment}`.
    Parts {
        project: String,
        engine: String,
        environment: String,
    },
}

impl DatabaseRef {
    /// Build (and validate) the canonical directory key.
    pub fn canonical_name(&self) -> crate::Result<String> {
        match self {
            DatabaseRef::Name(name) => validate_name(name).map(str::to_string),
            DatabaseRef::Parts {
                project,
                engine,
                environment,
            } => canonical_name(project, engine, environment),
        }
    }
}

fn validate_segment(label: &str, segment: &str) -> crate::Result<()> {
    if segment.is_empty() {
        return Err(TunnelError::InvalidIdentifier(
            segment.to_string(),
            format!("{} must not be empty", label),
        ));
    }
    if !segment_regex().is_match(segment) {
        return Err(TunnelError::InvalidIdentifier(
            segment.to_string(),
            format!(
                "{} may only contain [a-z0-9-] and must not start, end or repeat '-'",
                label
            ),
        ));
    }
    Ok(())
}

/// Join `(project, engine, environment)` into the canonical name.
///
/// The engine alias `postgresql` is normalized to `postgres` before joining.
pub fn canonical_name(project: &str, engine: &str, environment: &str) -> crate::Result<String> {
    validate_segment("project", project)?;
    validate_segment("engine", engine)?;
    validate_segment("environment", environment)?;
    let engine: Engine = engine.parse()?;
    Ok(format!("{}-{}-{}", project, engine.as_str(), environment))
}

/// Check that `name` is a well-formed canonical name (at least three
/// non-empty hyphen-separated segments of `[a-z0-9]`).
pub fn validate_name(name: &str) -> crate::Result<&str> {
    validate_segment("database name", name)?;
    if name.split('-').count() < 3 {
        return Err(TunnelError::InvalidIdentifier(
            name.to_string(),
            "expected {project}-{engine}-{environment}".to_string(),
        ));
    }
    Ok(name)
}

/// Maps database references to descriptors through a [`DatabaseDirectory`].
pub struct DatabaseResolver<D> {
    directory: D,
    fallback_region: String,
}

impl<D: DatabaseDirectory> DatabaseResolver<D> {
    pub fn new(directory: D, fallback_region: impl Into<String>) -> Self {
        Self {
            directory,
            fallback_region: fallback_region.into(),
        }
    }

    /// Resolve a reference to a complete descriptor.
    ///
    /// Invalid names fail before the directory is touched. A missing entry
    /// fails with `DatabaseNotFound` carrying the attempted canonical name.
    pub async fn resolve(&self, reference: &DatabaseRef) -> crate::Result<ConnectionDescriptor> {
        let name = reference.canonical_name()?;
        tracing::debug!(database = %name, "resolving database");

        let record = self
            .directory
            .get(&name)
            .await?
            .ok_or_else(|| TunnelError::DatabaseNotFound(name.clone()))?;

        let descriptor = record.into_descriptor(&name, &self.fallback_region)?;
        tracing::debug!(
            database = %name,
            engine = %descriptor.engine(),
            bastion_id = %descriptor.bastion_id(),
            remote_host = %descriptor.remote_host(),
            remote_port = descriptor.remote_port(),
            region = %descriptor.region(),
            "database resolved"
        );
        Ok(descriptor)
    }
}
