//! gpumesh-registry: replicated room membership for gpumesh.
//!
//! Backed by [yrs](https://docs.rs/yrs), provides one CRDT replica of a
//! room's worker records and admin pointer per node.
//!
//! # Architecture
//!
//! Every worker keeps its own `RoomRegistry`. Local mutations are applied
//! immediately; replicas converge by exchanging v1-encoded updates
//! (`serialize` / `apply_update`) carried inside `state_broadcast`
//! envelopes. Merging is left entirely to yrs, so delivery order and
//! duplicates never change the converged state.
//!
//! The `RoomRegistry` is `Send` + `Sync` (state behind a
//! `parking_lot::Mutex`) and is shared across tasks through an `Arc`.

pub mod error;
pub mod registry;
pub mod types;

pub use error::{RegistryError, RegistryResult};
pub use registry::RoomRegistry;
pub use types::RoomSnapshot;
