//! Port Allocator: pick the local port the tunnel will listen on.
//!
//! A port is "free" when a listen attempt on `127.0.0.1` succeeds; the check
//! socket is closed immediately. Another process can still grab the port
//! before the transport binds it; the supervisor reports that as a startup
//! failure.

use std::net::{Ipv4Addr, TcpListener};

use crate::error::TunnelError;

/// Whether `port` can currently be bound on the loopback interface.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Chooses a local port, searching upward only when the caller did not pick one.
#[derive(Debug, Clone, Copy)]
pub struct PortAllocator {
    search_attempts: u16,
}

impl PortAllocator {
    pub fn new(search_attempts: u16) -> Self {
        Self { search_attempts }
    }

    /// Allocate a port.
    ///
    /// - `requested = Some(0)` or a zero `engine_default`: `InvalidPort(0)`, before any bind attempt.
    /// - `requested = Some(p)`: `p` if free, else `PortInUse(p)`. Never substitutes.
    /// - `requested = None`: first free port in `engine_default, engine_default + 1, ...`
    ///   within `search_attempts` attempts, else `PortExhausted`.
    pub fn allocate(&self, requested: Option<u16>, engine_default: u16) -> crate::Result<u16> {
        // binding port 0 always succeeds with an ephemeral port we would never learn
        if requested == Some(0) || (requested.is_none() && engine_default == 0) {
            return Err(TunnelError::InvalidPort(0));
        }

        if let Some(port) = requested {
            if is_port_free(port) {
                return Ok(port);
            }
            tracing::debug!(port, "requested port is busy");
            return Err(TunnelError::PortInUse(port));
        }

        let mut port = engine_default;
        for attempt in 0..self.search_attempts {
            if is_port_free(port) {
                if attempt > 0 {
                    tracing::info!(
                        default_port = engine_default,
                        port,
                        "default port busy, using next free port"
                    );
                }
                return Ok(port);
            }
            port = match port.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        Err(TunnelError::PortExhausted {
            start: engine_default,
            attempts: self.search_attempts,
        })
    }
}
