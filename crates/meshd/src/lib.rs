//! meshd: gpumesh worker node assembly.
//!
//! [`WorkerNode`] builds one node from a [`gpumesh_core::MeshConfig`] and
//! a pair of transports; [`simulate`] runs whole rooms in-process.
//!
//! ```text
//! WorkerNode
//!   ├── MeshCoordinator     event loop (links, relay, dispatch)
//!   ├── HeartbeatMonitor    send + check loops
//!   ├── PartitionMonitor    check loop, status queue
//!   ├── JobCoordinator      answers job_request / assignment / cancel
//!   └── JobNegotiator       places jobs submitted by this node
//! ```

pub mod node;
pub mod simulate;

pub use node::WorkerNode;
pub use simulate::{SimulationOptions, SimulationReport, run_simulation};
