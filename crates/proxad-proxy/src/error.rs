use std::net::SocketAddr;

use thiserror::Error;

/// Failures surfaced by the listener and the per-flow engines. Only
/// `Bind` and `TlsSetup` can abort startup; everything that happens once
/// a flow exists is logged and scoped to that flow.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("tls configuration: {0}")]
    TlsSetup(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Errors caused by operator-supplied configuration, as opposed to
    /// runtime failures. Decides the process exit code.
    pub fn is_config(&self) -> bool {
        matches!(self, ProxyError::TlsSetup(_))
    }
}
