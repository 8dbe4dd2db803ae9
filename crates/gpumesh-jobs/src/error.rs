//! Job negotiation error types.

use thiserror::Error;

use gpumesh_core::{PeerId, RejectReason, TransportError};

/// Errors that can occur while placing a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Every candidate declined or stayed silent within the response window.
    #[error("no worker accepted job {job_id} ({} rejected)", rejections.len())]
    NoWorkerAccepted {
        job_id: String,
        rejections: Vec<(PeerId, RejectReason)>,
    },
}

pub type JobResult<T> = Result<T, JobError>;
