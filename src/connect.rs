//! End-to-end `connect`: session, resolve, allocate, supervise.
//!
//! Every step before the supervisor fails with a [`TunnelError`] and leaves
//! nothing to clean up. The name is validated before the session check so a
//! typo never triggers an interactive login.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::TunnelConfig;
use crate::descriptor::ConnectionDescriptor;
use crate::directory::{ConfiguredDirectory, DatabaseDirectory};
use crate::error::TunnelError;
use crate::port::PortAllocator;
use crate::resolver::{DatabaseRef, DatabaseResolver};
use crate::session::{AwsSsoCredentialStore, CredentialStore, SessionStatus, SessionValidator};
use crate::supervisor::{TunnelOutcome, TunnelState, TunnelSupervisor};
use crate::transport::{ConfiguredTransport, TransportLauncher};

/// What the caller wants to connect to.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub database: DatabaseRef,
    /// Explicit local port. Never substituted when busy.
    pub local_port: Option<u16>,
}

/// Everything settled before the transport is launched.
#[derive(Debug, Clone)]
pub struct PreparedTunnel {
    pub descriptor: ConnectionDescriptor,
    pub local_port: u16,
}

/// Identity for this run: the explicit one, else the configured default.
pub fn resolve_identity(explicit: Option<&str>, config: &TunnelConfig) -> String {
    match explicit {
        Some(identity) if !identity.trim().is_empty() => identity.trim().to_string(),
        _ => config.default_profile.clone(),
    }
}

/// Connects databases on behalf of one identity.
pub struct Connector<D, C, T> {
    identity: String,
    resolver: DatabaseResolver<D>,
    validator: SessionValidator<C>,
    allocator: PortAllocator,
    supervisor: TunnelSupervisor,
    transport: T,
}

/// Connector wired from `dbtunnel.toml`.
pub type ConfiguredConnector =
    Connector<ConfiguredDirectory, AwsSsoCredentialStore, ConfiguredTransport>;

impl ConfiguredConnector {
    pub fn from_config(config: &TunnelConfig, identity: &str) -> crate::Result<Self> {
        config.validate()?;
        Ok(Connector::new(
            identity,
            DatabaseResolver::new(
                ConfiguredDirectory::from_config(config, identity),
                config.region.clone(),
            ),
            SessionValidator::new(
                AwsSsoCredentialStore::from_config(config),
                config.session.auto_login,
            ),
            PortAllocator::new(config.ports.search_attempts),
            TunnelSupervisor::from_config(&config.tunnel)?,
            ConfiguredTransport::from_config(config),
        ))
    }
}

impl<D, C, T> Connector<D, C, T>
where
    D: DatabaseDirectory,
    C: CredentialStore,
    T: TransportLauncher,
{
    pub fn new(
        identity: impl Into<String>,
        resolver: DatabaseResolver<D>,
        validator: SessionValidator<C>,
        allocator: PortAllocator,
        supervisor: TunnelSupervisor,
        transport: T,
    ) -> Self {
        Self {
            identity: identity.into(),
            resolver,
            validator,
            allocator,
            supervisor,
            transport,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Validate, resolve and allocate. No process is launched.
    pub async fn prepare(&self, request: &ConnectRequest) -> crate::Result<PreparedTunnel> {
        let name = request.database.canonical_name()?;

        match self.validator.ensure_valid(&self.identity).await {
            SessionStatus::Valid => {}
            SessionStatus::Expired => {
                return Err(TunnelError::Unauthenticated(
                    self.identity.clone(),
                    "session expired and automatic login is disabled".to_string(),
                ));
            }
            SessionStatus::Unauthenticated => {
                return Err(TunnelError::Unauthenticated(
                    self.identity.clone(),
                    "no valid session".to_string(),
                ));
            }
        }

        let descriptor = self.resolver.resolve(&request.database).await?;
        let local_port = self
            .allocator
            .allocate(request.local_port, descriptor.default_local_port())?;

        tracing::info!(database = %name, local_port, identity = %self.identity, "tunnel prepared");
        Ok(PreparedTunnel {
            descriptor,
            local_port,
        })
    }

    /// Launch and supervise until Closed.
    pub async fn open(
        &self,
        prepared: &PreparedTunnel,
        cancel: CancellationToken,
        state_tx: watch::Sender<TunnelState>,
    ) -> TunnelOutcome {
        self.supervisor
            .connect_observed(
                &self.transport,
                &prepared.descriptor,
                prepared.local_port,
                &self.identity,
                cancel,
                state_tx,
            )
            .await
    }

    /// [`prepare`](Self::prepare) then [`open`](Self::open).
    pub async fn connect(
        &self,
        request: &ConnectRequest,
        cancel: CancellationToken,
    ) -> crate::Result<(PreparedTunnel, TunnelOutcome)> {
        let prepared = self.prepare(request).await?;
        let (state_tx, _state_rx) = watch::channel(TunnelState::Starting);
        let outcome = self.open(&prepared, cancel, state_tx).await;
        Ok((prepared, outcome))
    }
}
