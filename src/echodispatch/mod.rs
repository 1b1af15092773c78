//! The kernel-level echo-dispatch accelerator: an optional capability that,
//! when available, takes over redirecting traffic for a set of ports
//! through a single shared socket instead of a dedicated listener per port
//! (spec §4.F). Out of scope per spec §1 beyond this 5-method contract; the
//! controller only ever talks to it through [`EchoDispatch`] and degrades
//! to per-port listeners transparently when it isn't supported.

use std::os::unix::io::RawFd;

use async_trait::async_trait;

use crate::error::ProxyError;

/// Capability interface for the kernel-level echo-dispatch accelerator.
#[async_trait]
pub trait EchoDispatch: Send + Sync {
    /// Loads the accelerator (e.g. an eBPF program). Called once up front.
    async fn load(&self) -> Result<(), ProxyError>;

    /// Registers the shared socket the accelerator redirects traffic into.
    async fn set_socket_fd(&self, fd: RawFd) -> Result<(), ProxyError>;

    /// Registers `port` for accelerated dispatch.
    async fn add_port(&self, port: u16) -> Result<(), ProxyError>;

    /// Unregisters `port`.
    async fn remove_port(&self, port: u16) -> Result<(), ProxyError>;

    /// Tears the accelerator down.
    async fn close(&self) -> Result<(), ProxyError>;

    /// Whether this platform/build actually supports the accelerator.
    fn supported(&self) -> bool;
}

/// The always-absent accelerator: every method but `supported` (which
/// returns `false`) returns `ProxyError::NotSupported`, matching spec
/// §4.F / §7 kind 6. The controller treats this capability as optional and
/// falls back to per-port listeners.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unsupported;

#[async_trait]
impl EchoDispatch for Unsupported {
    async fn load(&self) -> Result<(), ProxyError> {
        Err(not_supported())
    }

    async fn set_socket_fd(&self, _fd: RawFd) -> Result<(), ProxyError> {
        Err(not_supported())
    }

    async fn add_port(&self, _port: u16) -> Result<(), ProxyError> {
        Err(not_supported())
    }

    async fn remove_port(&self, _port: u16) -> Result<(), ProxyError> {
        Err(not_supported())
    }

    async fn close(&self) -> Result<(), ProxyError> {
        Err(not_supported())
    }

    fn supported(&self) -> bool {
        false
    }
}

fn not_supported() -> ProxyError {
    ProxyError::NotSupported
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unsupported_reports_false_and_errors() {
        let shim = Unsupported;
        assert!(!shim.supported());
        assert!(shim.load().await.is_err());
        assert!(shim.add_port(80).await.is_err());
        assert!(shim.remove_port(80).await.is_err());
        assert!(shim.close().await.is_err());
    }
}
