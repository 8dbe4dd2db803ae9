//! gpumesh-health: failure detection and partition recovery.
//!
//! Watches the node's direct links and decides when a peer is gone or
//! when the node itself has been cut off from the room.
//!
//! # Architecture
//!
//! ```text
//! HeartbeatMonitor
//!   ├── send loop     Heartbeat{seq} to every open channel each interval
//!   ├── check loop    silent > interval × multiplier → handle_peer_lost
//!   └── handler       answers Heartbeat, records HeartbeatResponse
//!
//! PartitionMonitor
//!   ├── check loop    live / known < threshold and no admin link
//!   ├── read-only     status updates queued in order
//!   ├── reconnect     one backoff task per missing peer (1s … cap)
//!   └── heal          cancel tasks → StateRequest → flush queue
//! ```

pub mod backoff;
pub mod heartbeat;
pub mod partition;

pub use backoff::{Backoff, backoff_delay};
pub use heartbeat::HeartbeatMonitor;
pub use partition::{
    Connectivity, PartitionMonitor, PublishOutcome, StatusReport, is_partitioned,
};
