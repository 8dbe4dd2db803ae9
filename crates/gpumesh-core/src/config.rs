//! meshd.toml configuration parser.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{JobType, WorkerMetadata};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    pub worker: WorkerConfig,
    #[serde(default)]
    pub mesh: MeshTuning,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub partition: PartitionConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub peer_id: String,
    pub room_id: String,
    #[serde(default = "default_role")]
    pub role: String,
    pub gpu_memory_mb: u64,
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default = "default_job_types")]
    pub supported_job_types: Vec<JobType>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshTuning {
    /// Peers negotiated concurrently during mesh formation.
    pub batch_size: usize,
    pub batch_pause_ms: u64,
    pub admin_verify_timeout_ms: u64,
    pub peer_discovery_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for MeshTuning {
    fn default() -> Self {
        Self {
            batch_size: 3,
            batch_pause_ms: 500,
            admin_verify_timeout_ms: 2_000,
            peer_discovery_timeout_ms: 5_000,
            shutdown_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    /// A peer silent for `interval * timeout_multiplier` is declared dead.
    pub timeout_multiplier: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            timeout_multiplier: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    pub check_interval_ms: u64,
    pub live_ratio_threshold: f64,
    pub backoff_cap_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            live_ratio_threshold: 0.5,
            backoff_cap_secs: 32,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub response_timeout_ms: u64,
    pub training_secs_per_epoch: u64,
    pub inference_estimate_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5_000,
            training_secs_per_epoch: 600,
            inference_estimate_secs: 60,
        }
    }
}

fn default_role() -> String {
    "worker".to_string()
}

fn default_job_types() -> Vec<JobType> {
    vec![JobType::Training, JobType::Inference]
}

impl MeshTuning {
    pub fn batch_pause(&self) -> Duration {
        Duration::from_millis(self.batch_pause_ms)
    }

    pub fn admin_verify_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_verify_timeout_ms)
    }

    pub fn peer_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_discovery_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        self.interval() * self.timeout_multiplier
    }
}

impl PartitionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl JobsConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

impl MeshConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: MeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the coordination loops cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.peer_id.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.peer_id is empty".into()));
        }
        if self.worker.room_id.trim().is_empty() {
            return Err(ConfigError::Invalid("worker.room_id is empty".into()));
        }
        if self.mesh.batch_size == 0 {
            return Err(ConfigError::Invalid("mesh.batch_size must be > 0".into()));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.interval_ms and heartbeat.timeout_multiplier must be > 0".into(),
            ));
        }
        if self.partition.check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "partition.check_interval_ms must be > 0".into(),
            ));
        }
        let ratio = self.partition.live_ratio_threshold;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "partition.live_ratio_threshold must be in (0, 1], got {ratio}"
            )));
        }
        Ok(())
    }

    /// Metadata this worker advertises to the room.
    pub fn metadata(&self) -> WorkerMetadata {
        WorkerMetadata {
            role: self.worker.role.clone(),
            gpu_memory_mb: self.worker.gpu_memory_mb,
            gpu_name: self.worker.gpu_name.clone(),
            supported_models: self.worker.supported_models.clone(),
            supported_job_types: self.worker.supported_job_types.clone(),
            tags: self.worker.tags.clone(),
        }
    }

    /// Scaffold a config with default tuning for one worker.
    pub fn scaffold(peer_id: &str, room_id: &str, gpu_memory_mb: u64) -> Self {
        MeshConfig {
            worker: WorkerConfig {
                peer_id: peer_id.to_string(),
                room_id: room_id.to_string(),
                role: default_role(),
                gpu_memory_mb,
                gpu_name: None,
                supported_models: Vec::new(),
                supported_job_types: default_job_types(),
                tags: BTreeSet::new(),
            },
            mesh: MeshTuning::default(),
            heartbeat: HeartbeatConfig::default(),
            partition: PartitionConfig::default(),
            jobs: JobsConfig::default(),
        }
    }
}
