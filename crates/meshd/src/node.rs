//! A complete worker node: context, coordinator, monitors, and jobs,
//! wired over one pair of transports.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use gpumesh_cluster::{
    AdminController, BootstrapTransport, ClusterResult, LinkFactory, MemoryNetwork, MeshContext,
    MeshCoordinator, MeshEvent,
};
use gpumesh_core::{MeshConfig, PeerId, WorkerMetadata, WorkerStatus};
use gpumesh_health::{HeartbeatMonitor, PartitionMonitor, StatusReport};
use gpumesh_jobs::{
    Assignment, JobCoordinator, JobNegotiator, JobResult, JobSpec, LocalWorker, meets_requirements,
};
use gpumesh_registry::RoomSnapshot;

/// Routes this worker's own status through the partition monitor, so a
/// partitioned node queues its updates instead of losing them.
struct NodeWorker {
    ctx: Arc<MeshContext>,
    partition: Arc<PartitionMonitor>,
}

impl LocalWorker for NodeWorker {
    fn status(&self) -> WorkerStatus {
        self.ctx
            .registry()
            .worker(self.ctx.peer_id())
            .map(|w| w.status)
            .unwrap_or(WorkerStatus::Available)
    }

    fn set_status(&self, status: WorkerStatus, current_job_id: Option<&str>) {
        let outcome = self
            .partition
            .publish_status(StatusReport::new(status, current_job_id));
        info!(%status, ?outcome, "local status published");
    }

    fn metadata(&self) -> WorkerMetadata {
        self.ctx.metadata().clone()
    }
}

pub struct WorkerNode {
    ctx: Arc<MeshContext>,
    coordinator: Arc<MeshCoordinator>,
    heartbeat: Arc<HeartbeatMonitor>,
    partition: Arc<PartitionMonitor>,
    jobs: Arc<JobCoordinator>,
    negotiator: Arc<JobNegotiator>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerNode {
    /// Assemble a node over the given transports. Nothing runs until
    /// [`WorkerNode::start`].
    pub fn new(
        config: MeshConfig,
        links: Arc<dyn LinkFactory>,
        bootstrap: Arc<dyn BootstrapTransport>,
    ) -> Self {
        let response_timeout = config.jobs.response_timeout();
        let jobs_config = config.jobs.clone();

        let ctx = MeshContext::new(config);
        let admin = Arc::new(AdminController::new(ctx.clone()));
        let coordinator = MeshCoordinator::new(ctx.clone(), admin, links, bootstrap);

        let heartbeat = HeartbeatMonitor::new(coordinator.clone());
        let partition = PartitionMonitor::new(coordinator.clone());
        let worker = Arc::new(NodeWorker {
            ctx: ctx.clone(),
            partition: partition.clone(),
        });
        let jobs = Arc::new(JobCoordinator::new(coordinator.clone(), worker, jobs_config));
        let negotiator = Arc::new(JobNegotiator::new(coordinator.clone(), response_timeout));

        coordinator.register_handler(heartbeat.clone());
        coordinator.register_handler(jobs.clone());
        coordinator.register_handler(negotiator.clone());

        Self {
            ctx,
            coordinator,
            heartbeat,
            partition,
            jobs,
            negotiator,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach a node to an in-process network and start it.
    pub fn on_memory(net: &MemoryNetwork, config: MeshConfig) -> Self {
        let endpoint = net.endpoint(&config.worker.peer_id);
        let node = Self::new(config, endpoint.links, endpoint.bootstrap);
        node.start(endpoint.events);
        node
    }

    /// Spawn the event loop and the background monitors.
    pub fn start(&self, events: mpsc::UnboundedReceiver<MeshEvent>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.coordinator
                .clone()
                .run(events, self.ctx.shutdown_signal()),
        ));
        tasks.extend(self.heartbeat.start(self.ctx.shutdown_signal()));
        tasks.push(self.partition.start(self.ctx.shutdown_signal()));
        info!(peer_id = %self.ctx.peer_id(), tasks = tasks.len(), "worker node started");
    }

    pub async fn join(&self) -> ClusterResult<()> {
        self.coordinator.join().await
    }

    /// Leave the room and stop every background task.
    pub async fn shutdown(&self) {
        self.coordinator.leave().await;
        self.ctx.shutdown();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!(peer_id = %self.ctx.peer_id(), "worker node stopped");
    }

    // ── Jobs ──────────────────────────────────────────────────────

    /// Workers in the local view that could take `job` right now, largest
    /// GPU first.
    pub fn candidates_for(&self, job: &JobSpec) -> Vec<PeerId> {
        let mut fit: Vec<_> = self
            .snapshot()
            .workers
            .into_values()
            .filter(|w| w.peer_id != self.ctx.peer_id())
            .filter(|w| w.status == WorkerStatus::Available)
            .filter(|w| meets_requirements(&w.metadata(), job.job_type, &job.requirements))
            .collect();
        fit.sort_by(|a, b| {
            b.gpu_memory_mb
                .cmp(&a.gpu_memory_mb)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        fit.into_iter().map(|w| w.peer_id).collect()
    }

    /// Place `job` on another worker in the room.
    pub async fn submit_job(&self, job: JobSpec) -> JobResult<Assignment> {
        let candidates = self.candidates_for(&job);
        self.negotiator.negotiate(&candidates, job).await
    }

    // ── Views ─────────────────────────────────────────────────────

    pub fn peer_id(&self) -> &str {
        self.ctx.peer_id()
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.ctx
    }

    pub fn coordinator(&self) -> &Arc<MeshCoordinator> {
        &self.coordinator
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn partition(&self) -> &Arc<PartitionMonitor> {
        &self.partition
    }

    pub fn jobs(&self) -> &Arc<JobCoordinator> {
        &self.jobs
    }

    pub fn is_admin(&self) -> bool {
        self.ctx.is_admin()
    }

    pub fn admin_peer_id(&self) -> Option<PeerId> {
        self.ctx.admin_peer_id()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        self.ctx.registry().get_state()
    }
}
