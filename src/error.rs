use std::net::AddrParseError;

use thiserror::Error;

/// Fatal or caller-facing failures. Everything else (a dropped datagram, a
/// failed send to one peer) is logged in place and never reaches this type.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("invalid local address or mask: {0}")]
    InvalidAddress(#[from] AddrParseError),

    #[error("failed to bind UDP discovery socket on port {port}: {source}")]
    DiscoveryBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind TCP transport listener on {addr}:{port}: {source}")]
    TransportBind {
        addr: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("well-formed message envelope carried an unrecognized type: {0:?}")]
    UnknownMessageType(String),

    #[error("node is not in the expected lifecycle state for this operation")]
    InvalidState,
}

pub type Result<T> = std::result::Result<T, NetError>;
