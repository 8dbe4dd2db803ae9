//! gpumesh-cluster: admin election and mesh formation for gpumesh.
//!
//! Provides the per-node coordinator that joins a room through the
//! bootstrap relay, elects and verifies the admin, forms direct links to
//! every other member, and relays frames for peers without a direct link.
//!
//! # Architecture
//!
//! ```text
//! Worker node
//!   ├── MeshContext (Arc, shared by every component)
//!   │   ├── RoomRegistry        replicated membership
//!   │   └── ConnectionRegistry  open channels by peer class
//!   ├── AdminController
//!   │   ├── elect_admin()       (−gpu_memory, peer_id) ordering
//!   │   ├── run_election()      verify → commit, serialized
//!   │   └── broadcast / query   admin-only duties
//!   └── MeshCoordinator (event loop)
//!       ├── BootstrapTransport  relay: first contact, admin slot
//!       ├── LinkFactory         offer / answer / candidates
//!       └── MessageHandler*     heartbeats, jobs, worker lists
//! ```
//!
//! Transports are traits; [`memory::MemoryNetwork`] implements both for
//! tests and local simulation.

pub mod admin;
pub mod connections;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod transport;

pub use admin::{AdminController, AdminPhase, elect_admin};
pub use connections::ConnectionRegistry;
pub use context::MeshContext;
pub use coordinator::{MeshCoordinator, MessageHandler};
pub use error::{ClusterError, ClusterResult};
pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use transport::{
    BootstrapEvent, BootstrapTransport, ChannelHandle, LinkEvent, LinkFactory, LinkState,
    MeshEvent, PeerChannel,
};
