//! Error types shared by the mesh layers.

use thiserror::Error;

/// Errors raised while encoding or decoding mesh envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Errors raised by peer channels and the bootstrap relay.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no channel to peer {0}")]
    NotConnected(String),

    #[error("channel to peer {0} is closed")]
    Closed(String),

    #[error("peer {0} is unknown to the relay")]
    UnknownPeer(String),

    #[error("bootstrap transport is not connected")]
    BootstrapOffline,

    #[error("negotiation with {peer} failed: {reason}")]
    Negotiation { peer: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors raised while loading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
