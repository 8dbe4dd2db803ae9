//! Worker side of job negotiation.
//!
//! ```text
//! requested ─┬─> accepted (status reserved) ──> assigned (busy) ─┬─> completed
//!            └─> rejected (busy | incompatible)                  ├─> failed
//!                                                                └─> cancelled
//! ```
//!
//! A rejected request leaves no record. An accepted request supersedes any
//! earlier reservation that was never assigned.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gpumesh_cluster::MessageHandler;
use gpumesh_core::config::JobsConfig;
use gpumesh_core::{
    JobRequirements, JobType, MeshMessage, MessageSink, PeerId, RejectReason, WorkerMetadata,
    WorkerStatus,
};

/// The worker this node runs: where job admission reads and writes status.
pub trait LocalWorker: Send + Sync {
    fn status(&self) -> WorkerStatus;

    /// Publish a new status. Implementations route this through the
    /// registry and on to the admin.
    fn set_status(&self, status: WorkerStatus, current_job_id: Option<&str>);

    fn metadata(&self) -> WorkerMetadata;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Accepted,
    Assigned,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Accepted => "accepted",
            JobState::Assigned => "assigned",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A job this worker has accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub requester: PeerId,
    pub job_type: JobType,
    pub config: serde_json::Value,
    pub state: JobState,
    pub estimated_duration_secs: u64,
}

/// Whether `metadata` satisfies a request for `job_type` under `requirements`.
pub fn meets_requirements(
    metadata: &WorkerMetadata,
    job_type: JobType,
    requirements: &JobRequirements,
) -> bool {
    if !metadata.supports_job_type(job_type) {
        return false;
    }
    if let Some(min) = requirements.min_gpu_memory_mb {
        if metadata.gpu_memory_mb < min {
            return false;
        }
    }
    match requirements.model {
        Some(ref model) => metadata.supports_model(model),
        None => true,
    }
}

/// Rough duration: `epochs × training_secs_per_epoch` for training (one
/// epoch when unspecified), a flat figure for inference.
pub fn estimate_duration(job_type: JobType, config: &serde_json::Value, jobs: &JobsConfig) -> u64 {
    match job_type {
        JobType::Training => {
            let epochs = config
                .get("epochs")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(1)
                .max(1);
            epochs.saturating_mul(jobs.training_secs_per_epoch)
        }
        JobType::Inference => jobs.inference_estimate_secs,
    }
}

pub struct JobCoordinator {
    sink: Arc<dyn MessageSink>,
    worker: Arc<dyn LocalWorker>,
    config: JobsConfig,
    /// Live (non-terminal) jobs by id.
    jobs: Mutex<HashMap<String, JobRecord>>,
}

impl JobCoordinator {
    pub fn new(sink: Arc<dyn MessageSink>, worker: Arc<dyn LocalWorker>, config: JobsConfig) -> Self {
        Self {
            sink,
            worker,
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn job(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.lock().get(job_id).cloned()
    }

    /// The job holding this worker, if any.
    pub fn current_job(&self) -> Option<JobRecord> {
        self.jobs.lock().values().next().cloned()
    }

    // ── Inbound ───────────────────────────────────────────────────

    /// Admit or decline a request. Returns the response that was sent.
    pub fn handle_request(
        &self,
        from: &str,
        job_id: &str,
        job_type: JobType,
        config: &serde_json::Value,
        requirements: &JobRequirements,
    ) -> MeshMessage {
        let status = self.worker.status();
        let reject = if status != WorkerStatus::Available {
            Some(RejectReason::Busy)
        } else if !meets_requirements(&self.worker.metadata(), job_type, requirements) {
            Some(RejectReason::Incompatible)
        } else {
            None
        };

        let response = match reject {
            Some(reason) => {
                info!(%from, %job_id, %status, %reason, "job rejected");
                MeshMessage::JobResponse {
                    job_id: job_id.to_string(),
                    accepted: false,
                    reason: Some(reason),
                    estimated_duration_secs: None,
                }
            }
            None => {
                let estimate = estimate_duration(job_type, config, &self.config);
                {
                    let mut jobs = self.jobs.lock();
                    jobs.retain(|id, job| {
                        let stale = job.state == JobState::Accepted;
                        if stale {
                            debug!(job_id = %id, "reservation superseded");
                        }
                        !stale
                    });
                    jobs.insert(
                        job_id.to_string(),
                        JobRecord {
                            job_id: job_id.to_string(),
                            requester: from.to_string(),
                            job_type,
                            config: config.clone(),
                            state: JobState::Accepted,
                            estimated_duration_secs: estimate,
                        },
                    );
                }
                self.worker.set_status(WorkerStatus::Reserved, Some(job_id));
                info!(%from, %job_id, %job_type, estimate_secs = estimate, "job accepted, worker reserved");
                MeshMessage::JobResponse {
                    job_id: job_id.to_string(),
                    accepted: true,
                    reason: None,
                    estimated_duration_secs: Some(estimate),
                }
            }
        };

        if let Err(e) = self.sink.send_to(from, response.clone()) {
            warn!(%from, %job_id, error = %e, "job response not delivered");
        }
        response
    }

    /// Start a reserved job. Unknown jobs and foreign assigners are ignored.
    pub fn handle_assignment(&self, from: &str, job_id: &str) -> bool {
        {
            let mut jobs = self.jobs.lock();
            let Some(job) = jobs.get_mut(job_id) else {
                warn!(%from, %job_id, "assignment for unknown job ignored");
                return false;
            };
            if job.requester != from {
                warn!(%from, %job_id, requester = %job.requester, "assignment from non-requester ignored");
                return false;
            }
            if job.state != JobState::Accepted {
                debug!(%job_id, state = %job.state, "duplicate assignment ignored");
                return false;
            }
            job.state = JobState::Assigned;
        }
        self.worker.set_status(WorkerStatus::Busy, Some(job_id));
        info!(%from, %job_id, "job assigned, worker busy");
        true
    }

    /// Drop a reserved or running job at the requester's request.
    pub fn handle_cancel(&self, from: &str, job_id: &str, reason: Option<&str>) -> bool {
        let removed = {
            let mut jobs = self.jobs.lock();
            match jobs.get(job_id) {
                Some(job) if job.requester == from => jobs.remove(job_id),
                _ => None,
            }
        };
        let Some(mut job) = removed else {
            debug!(%from, %job_id, "cancel for job not held here ignored");
            return false;
        };
        job.state = JobState::Cancelled;

        let ack = MeshMessage::JobCancelled {
            job_id: job_id.to_string(),
        };
        if let Err(e) = self.sink.send_to(from, ack) {
            warn!(%from, %job_id, error = %e, "cancel ack not delivered");
        }
        self.worker.set_status(WorkerStatus::Available, None);
        info!(%from, %job_id, reason = reason.unwrap_or("-"), "job cancelled");
        true
    }

    /// Record the execution outcome of an assigned job and free the worker.
    pub fn finish_job(&self, job_id: &str, success: bool) -> Option<JobState> {
        let mut job = self.jobs.lock().remove(job_id)?;
        job.state = if success {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.worker.set_status(WorkerStatus::Available, None);
        info!(%job_id, state = %job.state, "job finished");
        Some(job.state)
    }
}

impl MessageHandler for JobCoordinator {
    fn handle(&self, from: &str, message: &MeshMessage) -> bool {
        match message {
            MeshMessage::JobRequest {
                job_id,
                job_type,
                config,
                requirements,
            } => {
                self.handle_request(from, job_id, *job_type, config, requirements);
                true
            }
            MeshMessage::JobAssignment { job_id } => {
                self.handle_assignment(from, job_id);
                true
            }
            MeshMessage::JobCancel { job_id, reason } => {
                self.handle_cancel(from, job_id, reason.as_deref());
                true
            }
            _ => false,
        }
    }

    /// A requester that vanished before assigning leaves a dead reservation.
    fn on_peer_departed(&self, peer_id: &str) {
        let released = {
            let mut jobs = self.jobs.lock();
            let before = jobs.len();
            jobs.retain(|_, job| !(job.requester == peer_id && job.state == JobState::Accepted));
            before != jobs.len()
        };
        if released {
            info!(%peer_id, "requester gone, reservation released");
            self.worker.set_status(WorkerStatus::Available, None);
        }
    }
}
