//! Port availability probe.

use std::net::{Ipv4Addr, SocketAddr, TcpListener};

use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Default HTTP port of the host.
pub const DEFAULT_PORT: u16 = 7071;

/// Bind-and-release check. The listener is dropped before returning, so the
/// port is never held.
pub struct PortChecker;

impl PortChecker {
    pub fn check_available(port: u16) -> CoreResult<()> {
        for ip in [Ipv4Addr::LOCALHOST, Ipv4Addr::UNSPECIFIED] {
            let addr = SocketAddr::from((ip, port));
            if let Err(e) = TcpListener::bind(addr) {
                debug!("Port check on {} failed: {}", addr, e);
                return Err(CoreError::PortInUse { port });
            }
        }
        Ok(())
    }

    pub fn is_available(port: u16) -> bool {
        Self::check_available(port).is_ok()
    }
}
