//! Requester side of job negotiation.
//!
//! `negotiate` fans a request out to the candidates, collects answers for
//! the response window (or until everyone answered), assigns the job to
//! the first acceptor in candidate order, and cancels every other
//! reservation it caused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gpumesh_cluster::MessageHandler;
use gpumesh_core::{JobRequirements, JobType, MeshMessage, MessageSink, PeerId, RejectReason};

use crate::error::{JobError, JobResult};

/// A job to be placed.
#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_id: String,
    pub job_type: JobType,
    pub config: serde_json::Value,
    pub requirements: JobRequirements,
}

impl JobSpec {
    /// A job with a fresh random id.
    pub fn new(job_type: JobType, config: serde_json::Value) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_type,
            config,
            requirements: JobRequirements::default(),
        }
    }

    pub fn with_requirements(mut self, requirements: JobRequirements) -> Self {
        self.requirements = requirements;
        self
    }
}

/// Where a job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job_id: String,
    pub worker: PeerId,
    pub estimated_duration_secs: Option<u64>,
    /// Surplus acceptors whose reservation was cancelled.
    pub released: Vec<PeerId>,
}

#[derive(Debug, Clone)]
struct Answer {
    accepted: bool,
    reason: Option<RejectReason>,
    estimated_duration_secs: Option<u64>,
}

pub struct JobNegotiator {
    sink: Arc<dyn MessageSink>,
    response_timeout: Duration,
    /// job id → feed for the negotiation collecting its responses.
    pending: Mutex<HashMap<String, mpsc::UnboundedSender<(PeerId, Answer)>>>,
}

impl JobNegotiator {
    pub fn new(sink: Arc<dyn MessageSink>, response_timeout: Duration) -> Self {
        Self {
            sink,
            response_timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Place `job` on one of `candidates`.
    pub async fn negotiate(&self, candidates: &[PeerId], job: JobSpec) -> JobResult<Assignment> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(job.job_id.clone(), tx);

        let mut asked: Vec<&PeerId> = Vec::with_capacity(candidates.len());
        for peer in candidates {
            if asked.contains(&peer) {
                continue;
            }
            let request = MeshMessage::JobRequest {
                job_id: job.job_id.clone(),
                job_type: job.job_type,
                config: job.config.clone(),
                requirements: job.requirements.clone(),
            };
            match self.sink.send_to(peer, request) {
                Ok(()) => asked.push(peer),
                Err(e) => warn!(%peer, job_id = %job.job_id, error = %e, "job request not delivered"),
            }
        }
        info!(job_id = %job.job_id, job_type = %job.job_type, asked = asked.len(), "job request sent");

        let mut answers: HashMap<PeerId, Answer> = HashMap::new();
        let deadline = Instant::now() + self.response_timeout;
        while answers.len() < asked.len() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some((peer, answer))) => {
                    if asked.contains(&&peer) {
                        answers.entry(peer).or_insert(answer);
                    } else {
                        debug!(%peer, job_id = %job.job_id, "response from peer not asked");
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        job_id = %job.job_id,
                        answered = answers.len(),
                        asked = asked.len(),
                        "response window closed"
                    );
                    break;
                }
            }
        }
        self.pending.lock().remove(&job.job_id);

        let acceptors: Vec<&PeerId> = asked
            .iter()
            .copied()
            .filter(|p| answers.get(*p).is_some_and(|a| a.accepted))
            .collect();

        let Some((&winner, surplus)) = acceptors.split_first() else {
            let rejections: Vec<(PeerId, RejectReason)> = asked
                .iter()
                .filter_map(|p| {
                    let reason = answers.get(*p)?.reason?;
                    Some(((*p).clone(), reason))
                })
                .collect();
            warn!(job_id = %job.job_id, rejected = rejections.len(), "no worker accepted job");
            return Err(JobError::NoWorkerAccepted {
                job_id: job.job_id,
                rejections,
            });
        };

        for peer in surplus {
            self.cancel(peer, &job.job_id, "assigned to another worker");
        }
        self.sink.send_to(
            winner,
            MeshMessage::JobAssignment {
                job_id: job.job_id.clone(),
            },
        )?;

        let estimate = answers.get(winner).and_then(|a| a.estimated_duration_secs);
        info!(job_id = %job.job_id, worker = %winner, estimate_secs = ?estimate, released = surplus.len(), "job assigned");
        Ok(Assignment {
            job_id: job.job_id,
            worker: winner.clone(),
            estimated_duration_secs: estimate,
            released: surplus.iter().map(|p| (*p).clone()).collect(),
        })
    }

    /// Cancel a job held by `peer`.
    pub fn cancel(&self, peer: &str, job_id: &str, reason: &str) {
        let message = MeshMessage::JobCancel {
            job_id: job_id.to_string(),
            reason: Some(reason.to_string()),
        };
        if let Err(e) = self.sink.send_to(peer, message) {
            warn!(%peer, %job_id, error = %e, "job cancel not delivered");
        }
    }
}

impl MessageHandler for JobNegotiator {
    fn handle(&self, from: &str, message: &MeshMessage) -> bool {
        match message {
            MeshMessage::JobResponse {
                job_id,
                accepted,
                reason,
                estimated_duration_secs,
            } => {
                let answer = Answer {
                    accepted: *accepted,
                    reason: *reason,
                    estimated_duration_secs: *estimated_duration_secs,
                };
                let delivered = match self.pending.lock().get(job_id) {
                    Some(tx) => tx.send((from.to_string(), answer)).is_ok(),
                    None => false,
                };
                if !delivered && *accepted {
                    // Accepted after the window closed: release the reservation.
                    debug!(%from, %job_id, "late acceptance, cancelling");
                    self.cancel(from, job_id, "response window closed");
                }
                true
            }
            MeshMessage::JobCancelled { job_id } => {
                debug!(%from, %job_id, "job cancellation acknowledged");
                true
            }
            _ => false,
        }
    }
}
