use thiserror::Error;

/// Error kinds surfaced by the tunneler core (spec §7).
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Missing required overlay callback or malformed address at init. Fatal.
    #[error("configuration error: {0}")]
    Config(String),

    /// PCB allocation, raw socket creation, or other resource exhaustion.
    /// Scoped to the flow/forwarder that triggered it; not fatal to the core.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Address/CIDR/hostname parse failure.
    #[error("failed to parse '{0}' as an address or CIDR")]
    Parse(String),

    /// Send buffer full; caller should retry on a later tick.
    #[error("transient: {0}")]
    Transient(String),

    /// Peer sent RST, or the overlay closed abruptly.
    #[error("peer reset")]
    PeerReset,

    /// Flow exceeded its configured inactivity interval.
    #[error("idle timeout")]
    IdleTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
