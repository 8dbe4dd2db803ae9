//! Partition monitor: detects when this node has lost most of the room
//! and keeps its outgoing status updates until it is back.
//!
//! While partitioned the node is read-only: status updates are queued in
//! order instead of sent, and one reconnection task per missing peer
//! retries with exponential backoff. Leaving the partition cancels the
//! reconnection tasks, asks the admin for a fresh snapshot, and flushes
//! the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gpumesh_cluster::MeshCoordinator;
use gpumesh_core::{MeshMessage, MessageSink, PeerId, WorkerStatus};

use crate::backoff::Backoff;

/// Partitioned ⇔ no live link to the admin AND fewer than `threshold` of
/// the known peers are live. Knowing no peers is never a partition.
pub fn is_partitioned(connected_to_admin: bool, live: usize, known: usize, threshold: f64) -> bool {
    if connected_to_admin || known == 0 {
        return false;
    }
    (live as f64) / (known as f64) < threshold
}

/// One outgoing change to this worker's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: WorkerStatus,
    pub current_job_id: Option<String>,
}

impl StatusReport {
    pub fn new(status: WorkerStatus, current_job_id: Option<&str>) -> Self {
        Self {
            status,
            current_job_id: current_job_id.map(str::to_string),
        }
    }
}

/// What [`PartitionMonitor::publish_status`] did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// This node is admin: applied to the registry and broadcast.
    Applied,
    /// Sent to the admin.
    Sent,
    /// Held until the admin is reachable again.
    Queued,
}

/// Connectivity summary used for the partition decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connectivity {
    pub connected_to_admin: bool,
    pub live: usize,
    pub known: usize,
    pub missing: Vec<PeerId>,
}

pub struct PartitionMonitor {
    coordinator: Arc<MeshCoordinator>,
    read_only: AtomicBool,
    queue: Mutex<VecDeque<StatusReport>>,
    reconnects: Mutex<HashMap<PeerId, JoinHandle<()>>>,
}

impl PartitionMonitor {
    pub fn new(coordinator: Arc<MeshCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            read_only: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
            reconnects: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> Vec<StatusReport> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn reconnecting(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.reconnects.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Live/known counts over the registry's other members.
    pub fn connectivity(&self) -> Connectivity {
        let ctx = self.coordinator.context();
        let connections = ctx.connections();
        let known: Vec<PeerId> = ctx
            .registry()
            .member_ids()
            .into_iter()
            .filter(|p| p != ctx.peer_id())
            .collect();
        let missing: Vec<PeerId> = known
            .iter()
            .filter(|p| !connections.contains(p))
            .cloned()
            .collect();
        let connected_to_admin = ctx
            .registry()
            .admin_pointer()
            .is_some_and(|admin| admin != ctx.peer_id() && connections.contains(&admin));

        Connectivity {
            connected_to_admin,
            live: known.len() - missing.len(),
            known: known.len(),
            missing,
        }
    }

    /// Whether this node is partitioned right now. An admin never is.
    pub fn evaluate(&self) -> bool {
        let ctx = self.coordinator.context();
        if ctx.is_admin() {
            return false;
        }
        let c = self.connectivity();
        is_partitioned(
            c.connected_to_admin,
            c.live,
            c.known,
            ctx.config().partition.live_ratio_threshold,
        )
    }

    /// Run one partition check and move in or out of read-only mode.
    /// Returns whether the node is partitioned after the check.
    pub fn check(self: &Arc<Self>) -> bool {
        let partitioned = self.evaluate();
        match (self.is_read_only(), partitioned) {
            (false, true) => self.enter_partition(),
            (true, false) => self.exit_partition(),
            (true, true) => self.spawn_reconnects(),
            (false, false) => {
                if !self.queue.lock().is_empty() {
                    self.flush();
                }
            }
        }
        partitioned
    }

    fn enter_partition(self: &Arc<Self>) {
        self.read_only.store(true, Ordering::SeqCst);
        let c = self.connectivity();
        warn!(live = c.live, known = c.known, "partition detected, entering read-only mode");
        self.spawn_reconnects();
    }

    fn exit_partition(&self) {
        self.read_only.store(false, Ordering::SeqCst);
        for (peer_id, handle) in self.reconnects.lock().drain() {
            handle.abort();
            debug!(%peer_id, "reconnection cancelled");
        }

        let ctx = self.coordinator.context();
        if let Some(admin) = ctx.registry().admin_pointer() {
            if let Err(e) = self.coordinator.send_to(&admin, MeshMessage::StateRequest) {
                debug!(%admin, error = %e, "state request not delivered");
            }
        }
        let flushed = self.flush();
        info!(flushed, "partition healed, resuming");
    }

    /// One backoff task per missing peer that has none running yet.
    fn spawn_reconnects(self: &Arc<Self>) {
        let missing = self.connectivity().missing;
        let config = self.coordinator.context().config().partition.clone();
        let mut reconnects = self.reconnects.lock();
        reconnects.retain(|_, handle| !handle.is_finished());

        for peer_id in missing {
            if reconnects.contains_key(&peer_id) {
                continue;
            }
            let coordinator = self.coordinator.clone();
            let shutdown = coordinator.context().shutdown_signal();
            let backoff = Backoff::new(config.max_reconnect_attempts, config.backoff_cap_secs);
            let target = peer_id.clone();
            let handle = tokio::spawn(async move {
                reconnect_loop(coordinator, target, backoff, shutdown).await;
            });
            reconnects.insert(peer_id, handle);
        }
    }

    /// Record a change to this worker's status and push it toward the
    /// admin. The local registry always takes the change at once; only the
    /// outbound update is held while the node is read-only.
    pub fn publish_status(&self, report: StatusReport) -> PublishOutcome {
        let ctx = self.coordinator.context();
        ctx.registry()
            .update_status(ctx.peer_id(), report.status, report.current_job_id.as_deref());

        if self.is_read_only() {
            debug!(status = %report.status, "read-only, status update queued");
            self.queue.lock().push_back(report);
            return PublishOutcome::Queued;
        }
        match self.deliver(&report) {
            Some(outcome) => outcome,
            None => {
                self.queue.lock().push_back(report);
                PublishOutcome::Queued
            }
        }
    }

    /// Push one report toward the admin. `None` if it could not leave.
    fn deliver(&self, report: &StatusReport) -> Option<PublishOutcome> {
        let ctx = self.coordinator.context();
        if ctx.is_admin() {
            self.coordinator.admin().broadcast_state_update();
            return Some(PublishOutcome::Applied);
        }

        let admin = ctx.registry().admin_pointer()?;
        let message = MeshMessage::StatusUpdate {
            status: report.status,
            current_job_id: report.current_job_id.clone(),
        };
        match self.coordinator.send_to(&admin, message) {
            Ok(()) => Some(PublishOutcome::Sent),
            Err(e) => {
                debug!(%admin, error = %e, "status update not delivered");
                None
            }
        }
    }

    /// Deliver queued reports in order, stopping at the first failure.
    /// Returns how many left the queue.
    pub fn flush(&self) -> usize {
        let mut flushed = 0;
        loop {
            let Some(report) = self.queue.lock().pop_front() else {
                break;
            };
            if self.deliver(&report).is_none() {
                self.queue.lock().push_front(report);
                break;
            }
            flushed += 1;
        }
        flushed
    }

    /// Spawn the periodic partition check.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.coordinator.context().config().partition.check_interval();
        info!(interval = ?period, "partition monitor started");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.check();
                    }
                    _ = shutdown.changed() => {
                        debug!("partition loop shutting down");
                        break;
                    }
                }
            }
            for (_, handle) in this.reconnects.lock().drain() {
                handle.abort();
            }
        })
    }
}

async fn reconnect_loop(
    coordinator: Arc<MeshCoordinator>,
    peer_id: PeerId,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let connections = coordinator.context().connections().clone();
    while let Some(delay) = backoff.next_delay() {
        if connections.contains(&peer_id) {
            debug!(%peer_id, attempts = backoff.attempts(), "peer reachable again");
            return;
        }
        if let Err(e) = coordinator.reconnect(&peer_id).await {
            debug!(%peer_id, error = %e, "reconnection attempt failed");
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => return,
        }
    }
    if backoff.exhausted() && !connections.contains(&peer_id) {
        warn!(%peer_id, attempts = backoff.attempts(), "giving up on reconnection");
    }
}

#[cfg(test)]
mod tests {
    use gpumesh_cluster::{
        AdminController, MemoryNetwork, MeshContext, PeerChannel,
    };
    use gpumesh_core::{Envelope, MeshConfig, PeerClass, TransportError, WorkerMetadata};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn messages(&self) -> Vec<MeshMessage> {
            self.frames
                .lock()
                .iter()
                .map(|f| Envelope::decode(f).unwrap().message)
                .collect()
        }
    }

    impl PeerChannel for Recorder {
        fn send(&self, frame: &str) -> Result<(), TransportError> {
            self.frames.lock().push(frame.to_string());
            Ok(())
        }

        fn close(&self) {}
    }

    /// w1 in a five-member room administered by w2.
    fn worker_in_room(net: &MemoryNetwork) -> Arc<MeshCoordinator> {
        let ctx = MeshContext::new(MeshConfig::scaffold("w1", "room-a", 4000));
        let registry = ctx.registry();
        for (peer, gpu) in [("w2", 16000), ("w3", 8000), ("w4", 8000), ("w5", 8000)] {
            registry.add_worker(peer, &WorkerMetadata::with_gpu_memory(gpu), false);
        }
        registry.set_admin("w2");
        ctx.set_admin_flag(false);

        let endpoint = net.endpoint("w1");
        let admin = Arc::new(AdminController::new(ctx.clone()));
        MeshCoordinator::new(ctx, admin, endpoint.links, endpoint.bootstrap)
    }

    #[test]
    fn partition_rule() {
        // 1 of 4 live, no admin link.
        assert!(is_partitioned(false, 1, 4, 0.5));
        // 3 of 4 live including the admin.
        assert!(!is_partitioned(true, 3, 4, 0.5));
        // Half live is not below half.
        assert!(!is_partitioned(false, 2, 4, 0.5));
        // An admin link alone is enough.
        assert!(!is_partitioned(true, 1, 4, 0.5));
        assert!(!is_partitioned(false, 0, 0, 0.5));
    }

    #[tokio::test]
    async fn evaluates_five_member_room() {
        let net = MemoryNetwork::new();
        let coord = worker_in_room(&net);
        let monitor = PartitionMonitor::new(coord.clone());
        let conns = coord.context().connections().clone();

        conns.insert("w3", PeerClass::Worker, Arc::new(Recorder::default()));
        let c = monitor.connectivity();
        assert_eq!((c.live, c.known, c.connected_to_admin), (1, 4, false));
        assert!(monitor.evaluate());

        conns.insert("w2", PeerClass::Admin, Arc::new(Recorder::default()));
        conns.insert("w4", PeerClass::Worker, Arc::new(Recorder::default()));
        assert!(!monitor.evaluate());
    }

    #[tokio::test]
    async fn admin_is_never_partitioned() {
        let net = MemoryNetwork::new();
        let coord = worker_in_room(&net);
        coord.context().set_admin_flag(true);
        let monitor = PartitionMonitor::new(coord);
        assert!(!monitor.evaluate());
    }

    #[tokio::test]
    async fn partition_queues_then_flushes_in_order() {
        let net = MemoryNetwork::new();
        let coord = worker_in_room(&net);
        let monitor = PartitionMonitor::new(coord.clone());

        assert!(monitor.check());
        assert!(monitor.is_read_only());
        assert_eq!(monitor.reconnecting(), vec!["w2", "w3", "w4", "w5"]);

        let first = StatusReport::new(WorkerStatus::Busy, Some("job-1"));
        let second = StatusReport::new(WorkerStatus::Available, None);
        assert_eq!(monitor.publish_status(first.clone()), PublishOutcome::Queued);
        assert_eq!(monitor.publish_status(second.clone()), PublishOutcome::Queued);
        assert_eq!(monitor.queued(), vec![first, second]);

        let admin_link = Arc::new(Recorder::default());
        let conns = coord.context().connections();
        conns.insert("w2", PeerClass::Admin, admin_link.clone());
        conns.insert("w3", PeerClass::Worker, Arc::new(Recorder::default()));

        assert!(!monitor.check());
        assert!(!monitor.is_read_only());
        assert!(monitor.queued().is_empty());
        assert!(monitor.reconnecting().is_empty());

        let sent = admin_link.messages();
        assert_eq!(sent[0], MeshMessage::StateRequest);
        assert_eq!(
            sent[1],
            MeshMessage::StatusUpdate {
                status: WorkerStatus::Busy,
                current_job_id: Some("job-1".to_string()),
            }
        );
        assert_eq!(
            sent[2],
            MeshMessage::StatusUpdate {
                status: WorkerStatus::Available,
                current_job_id: None,
            }
        );
        let own = coord.context().registry().worker("w1").unwrap();
        assert_eq!(own.status, WorkerStatus::Available);
    }

    #[tokio::test]
    async fn read_only_node_still_sees_its_own_status() {
        let net = MemoryNetwork::new();
        let coord = worker_in_room(&net);
        let monitor = PartitionMonitor::new(coord.clone());
        assert!(monitor.check());

        let report = StatusReport::new(WorkerStatus::Reserved, Some("job-1"));
        assert_eq!(monitor.publish_status(report), PublishOutcome::Queued);

        let own = coord.context().registry().worker("w1").unwrap();
        assert_eq!(own.status, WorkerStatus::Reserved);
        assert_eq!(own.current_job_id.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn unreachable_admin_queues_instead_of_dropping() {
        let net = MemoryNetwork::new();
        let coord = worker_in_room(&net);
        let monitor = PartitionMonitor::new(coord.clone());

        let report = StatusReport::new(WorkerStatus::Maintenance, None);
        assert_eq!(monitor.publish_status(report.clone()), PublishOutcome::Queued);
        assert!(!monitor.is_read_only());
        assert_eq!(monitor.queued(), vec![report]);
    }

    #[tokio::test]
    async fn admin_applies_locally() {
        let net = MemoryNetwork::new();
        let coord = worker_in_room(&net);
        let ctx = coord.context().clone();
        ctx.registry().set_admin("w1");
        ctx.set_admin_flag(true);
        let monitor = PartitionMonitor::new(coord);

        let outcome = monitor.publish_status(StatusReport::new(WorkerStatus::Busy, Some("j")));
        assert_eq!(outcome, PublishOutcome::Applied);
        assert_eq!(ctx.registry().worker("w1").unwrap().status, WorkerStatus::Busy);
    }
}
