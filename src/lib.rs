//! dbtunnel: supervised port-forwarding tunnels to private databases
//! Resolves a database name through a directory, validates the caller's session,
//! picks a local port, then owns the transport process until the tunnel closes
//! and classifies why it ended.

pub mod config;
pub mod connect;
pub mod descriptor;
pub mod directory;
pub mod error;
pub mod port;
pub mod prereq;
pub mod process;
pub mod reporter;
pub mod resolver;
pub mod session;
pub mod supervisor;
pub mod transport;

pub use config::{parse_env_ref, resolve_env_vars, DirectoryKind, TransportKind, TunnelConfig};
pub use connect::{resolve_identity, ConfiguredConnector, ConnectRequest, Connector, PreparedTunnel};
pub use descriptor::{ConnectionDescriptor, DatabaseRecord, Engine};
pub use directory::{ConfiguredDirectory, DatabaseDirectory, LocalDirectory, ParameterStoreDirectory};
pub use error::{Result, TunnelError};
pub use port::PortAllocator;
pub use prereq::{CheckResult, PrereqChecker};
pub use reporter::{ConnectionReporter, Report};
pub use resolver::{canonical_name, DatabaseRef, DatabaseResolver};
pub use session::{AwsSsoCredentialStore, CredentialStatus, CredentialStore, SessionStatus, SessionValidator};
pub use supervisor::{ClosureReason, TunnelOutcome, TunnelState, TunnelSupervisor};
pub use transport::{CommandTransport, ConfiguredTransport, SsmTransport, TransportLauncher};
