//! gpumesh-core: types shared by every gpumesh crate.
//!
//! Holds the worker/record model, the closed set of mesh envelopes with
//! their JSON codec, the `MessageSink` send capability, and the
//! `meshd.toml` configuration.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;

pub use config::MeshConfig;
pub use error::{ConfigError, ProtocolError, TransportError};
pub use protocol::{Envelope, MeshMessage, MessageSink};
pub use types::*;
