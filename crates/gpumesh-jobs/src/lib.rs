//! gpumesh-jobs: placing jobs on workers in a room.
//!
//! Two halves of one handshake. [`JobCoordinator`] runs on every worker
//! and answers requests against its own status and capabilities;
//! [`JobNegotiator`] runs on whichever node wants work done.
//!
//! ```text
//! requester                      worker
//!   │ job_request ─────────────────> │ available + capable? → reserved
//!   │ <──────────────── job_response │ accepted + estimate | busy | incompatible
//!   │ job_assignment ──────────────> │ busy
//!   │ job_cancel (surplus) ────────> │ available
//!   │ <─────────────── job_cancelled │
//! ```

pub mod coordinator;
pub mod error;
pub mod negotiator;

pub use coordinator::{
    JobCoordinator, JobRecord, JobState, LocalWorker, estimate_duration, meets_requirements,
};
pub use error::{JobError, JobResult};
pub use negotiator::{Assignment, JobNegotiator, JobSpec};
