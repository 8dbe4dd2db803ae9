//! Shared types used across gpumesh crates.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identifier of a peer (worker, admin, or client) within a room.
pub type PeerId = String;

// ── Worker status ─────────────────────────────────────────────────

/// Scheduling status advertised by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Available,
    Busy,
    /// Accepted a job request and waits for the assignment.
    Reserved,
    Maintenance,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Available => "available",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Reserved => "reserved",
            WorkerStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(WorkerStatus::Available),
            "busy" => Ok(WorkerStatus::Busy),
            "reserved" => Ok(WorkerStatus::Reserved),
            "maintenance" => Ok(WorkerStatus::Maintenance),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

// ── Peer class ────────────────────────────────────────────────────

/// Which sub-registry a connected peer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerClass {
    #[default]
    Worker,
    Admin,
    Client,
}

impl fmt::Display for PeerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerClass::Worker => "worker",
            PeerClass::Admin => "admin",
            PeerClass::Client => "client",
        };
        f.write_str(s)
    }
}

// ── Jobs ──────────────────────────────────────────────────────────

/// Kind of work a client can request from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Training,
    Inference,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Training => "training",
            JobType::Inference => "inference",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "training" => Ok(JobType::Training),
            "inference" => Ok(JobType::Inference),
            other => Err(format!("unknown job type: {other}")),
        }
    }
}

/// Capability constraints attached to a job request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirements {
    #[serde(default)]
    pub min_gpu_memory_mb: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Why a worker declined a job request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Busy,
    Incompatible,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Busy => f.write_str("busy"),
            RejectReason::Incompatible => f.write_str("incompatible"),
        }
    }
}

// ── Worker records ────────────────────────────────────────────────

/// Static description a worker advertises when it joins a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    #[serde(default = "default_role")]
    pub role: String,
    pub gpu_memory_mb: u64,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub supported_job_types: Vec<JobType>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

fn default_role() -> String {
    "worker".to_string()
}

impl WorkerMetadata {
    /// Metadata with only a GPU memory figure; every job type is supported.
    pub fn with_gpu_memory(gpu_memory_mb: u64) -> Self {
        Self {
            role: default_role(),
            gpu_memory_mb,
            gpu_name: None,
            supported_models: Vec::new(),
            supported_job_types: vec![JobType::Training, JobType::Inference],
            tags: BTreeSet::new(),
        }
    }

    /// Whether the worker can run `model`. An empty model list means "any".
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty() || self.supported_models.iter().any(|m| m == model)
    }

    pub fn supports_job_type(&self, job_type: JobType) -> bool {
        self.supported_job_types.contains(&job_type)
    }
}

/// A member of the room as seen through the replicated registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub peer_id: PeerId,
    pub role: String,
    pub tags: BTreeSet<String>,
    pub gpu_memory_mb: u64,
    pub gpu_name: Option<String>,
    pub supported_models: Vec<String>,
    pub supported_job_types: Vec<JobType>,
    pub status: WorkerStatus,
    pub current_job_id: Option<String>,
    /// Unix timestamp (milliseconds) of the last heartbeat stamp.
    pub last_heartbeat_ms: u64,
    pub is_admin: bool,
}

impl WorkerRecord {
    /// Build a fresh `available` record from joining metadata.
    pub fn from_metadata(peer_id: &str, metadata: &WorkerMetadata, is_admin: bool) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            role: metadata.role.clone(),
            tags: metadata.tags.clone(),
            gpu_memory_mb: metadata.gpu_memory_mb,
            gpu_name: metadata.gpu_name.clone(),
            supported_models: metadata.supported_models.clone(),
            supported_job_types: metadata.supported_job_types.clone(),
            status: WorkerStatus::Available,
            current_job_id: None,
            last_heartbeat_ms: epoch_millis(),
            is_admin,
        }
    }

    /// The static part of the record, as it was advertised on join.
    pub fn metadata(&self) -> WorkerMetadata {
        WorkerMetadata {
            role: self.role.clone(),
            gpu_memory_mb: self.gpu_memory_mb,
            gpu_name: self.gpu_name.clone(),
            supported_models: self.supported_models.clone(),
            supported_job_types: self.supported_job_types.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Predicates a client can apply when querying the admin for workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerFilters {
    #[serde(default)]
    pub status: Option<WorkerStatus>,
    /// Every listed tag must be present on the worker.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub min_gpu_memory_mb: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub job_type: Option<JobType>,
    #[serde(default)]
    pub max_results: Option<usize>,
}

impl WorkerFilters {
    /// Whether `record` passes every predicate (`max_results` is not a predicate).
    pub fn matches(&self, record: &WorkerRecord) -> bool {
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if !self.tags.iter().all(|t| record.tags.contains(t)) {
            return false;
        }
        if let Some(min) = self.min_gpu_memory_mb {
            if record.gpu_memory_mb < min {
                return false;
            }
        }
        if let Some(ref model) = self.model {
            if !record.metadata().supports_model(model) {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if !record.supported_job_types.contains(&job_type) {
                return false;
            }
        }
        true
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(peer: &str, gpu: u64) -> WorkerRecord {
        WorkerRecord::from_metadata(peer, &WorkerMetadata::with_gpu_memory(gpu), false)
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            WorkerStatus::Available,
            WorkerStatus::Busy,
            WorkerStatus::Reserved,
            WorkerStatus::Maintenance,
        ] {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
        assert!("sleeping".parse::<WorkerStatus>().is_err());
    }

    #[test]
    fn empty_model_list_supports_anything() {
        let meta = WorkerMetadata::with_gpu_memory(8000);
        assert!(meta.supports_model("llama-7b"));

        let mut meta = meta;
        meta.supported_models = vec!["resnet50".to_string()];
        assert!(meta.supports_model("resnet50"));
        assert!(!meta.supports_model("llama-7b"));
    }

    #[test]
    fn filters_require_all_tags() {
        let mut rec = record("w1", 8000);
        rec.tags.insert("a100".to_string());

        let filters = WorkerFilters {
            tags: vec!["a100".to_string(), "eu".to_string()],
            ..Default::default()
        };
        assert!(!filters.matches(&rec));

        rec.tags.insert("eu".to_string());
        assert!(filters.matches(&rec));
    }

    #[test]
    fn filters_on_status_and_memory() {
        let mut rec = record("w1", 8000);
        let filters = WorkerFilters {
            status: Some(WorkerStatus::Available),
            min_gpu_memory_mb: Some(10_000),
            ..Default::default()
        };
        assert!(!filters.matches(&rec));

        rec.gpu_memory_mb = 16_000;
        assert!(filters.matches(&rec));

        rec.status = WorkerStatus::Busy;
        assert!(!filters.matches(&rec));
    }

    #[test]
    fn metadata_round_trip_through_record() {
        let mut meta = WorkerMetadata::with_gpu_memory(24_000);
        meta.gpu_name = Some("RTX 4090".to_string());
        meta.tags.insert("lab".to_string());
        let rec = WorkerRecord::from_metadata("w9", &meta, true);
        assert_eq!(rec.metadata(), meta);
        assert!(rec.is_admin);
        assert_eq!(rec.status, WorkerStatus::Available);
    }
}
