//! Admin controller: deterministic election, liveness verification, and
//! the admin-only duties (state broadcast, worker queries).
//!
//! # Election
//!
//! Candidates are ordered by GPU memory descending, then peer id
//! ascending. Every replica with the same membership computes the same
//! winner, so no voting round is needed. Before committing a winner other
//! than itself a node asks it to confirm it is alive (`admin_verify`); a
//! candidate that stays silent past the verify timeout is dropped from the
//! registry and the election runs again.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use gpumesh_core::{MeshMessage, MessageSink, PeerClass, PeerId, WorkerFilters, WorkerRecord};

use crate::context::MeshContext;
use crate::error::{ClusterError, ClusterResult};

/// Where the controller is in its election cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminPhase {
    NoAdmin,
    Electing,
    Verifying,
    Stable,
}

impl fmt::Display for AdminPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdminPhase::NoAdmin => "no_admin",
            AdminPhase::Electing => "electing",
            AdminPhase::Verifying => "verifying",
            AdminPhase::Stable => "stable",
        };
        f.write_str(s)
    }
}

/// Pick the admin among `members`: most GPU memory, ties broken by the
/// lexicographically smallest peer id.
pub fn elect_admin<'a, I>(members: I) -> Option<PeerId>
where
    I: IntoIterator<Item = &'a WorkerRecord>,
{
    members
        .into_iter()
        .min_by(|a, b| {
            (Reverse(a.gpu_memory_mb), &a.peer_id).cmp(&(Reverse(b.gpu_memory_mb), &b.peer_id))
        })
        .map(|w| w.peer_id.clone())
}

/// Runs elections and the admin-side protocol for one node.
pub struct AdminController {
    ctx: Arc<MeshContext>,
    sink: Arc<dyn MessageSink>,
    election_lock: tokio::sync::Mutex<()>,
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
    phase: Mutex<AdminPhase>,
}

impl AdminController {
    /// Controller sending through the context's connection registry.
    pub fn new(ctx: Arc<MeshContext>) -> Self {
        let sink: Arc<dyn MessageSink> = ctx.connections().clone();
        Self::with_sink(ctx, sink)
    }

    pub fn with_sink(ctx: Arc<MeshContext>, sink: Arc<dyn MessageSink>) -> Self {
        let phase = if ctx.admin_peer_id().is_some() {
            AdminPhase::Stable
        } else {
            AdminPhase::NoAdmin
        };
        Self {
            ctx,
            sink,
            election_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(HashMap::new()),
            phase: Mutex::new(phase),
        }
    }

    pub fn phase(&self) -> AdminPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: AdminPhase) {
        *self.phase.lock() = phase;
    }

    // ── Election ──────────────────────────────────────────────────

    /// Elect (or keep) the room admin and commit it locally.
    ///
    /// A present admin is kept as is. Otherwise the deterministic winner
    /// is verified (when `verify` is set and the winner is another node)
    /// and committed. Only an empty registry makes this fail.
    pub async fn run_election(&self, verify: bool) -> ClusterResult<PeerId> {
        let _guard = self.election_lock.lock().await;
        let registry = self.ctx.registry();
        self.set_phase(AdminPhase::Electing);

        loop {
            let state = registry.get_state();
            if state.is_empty() {
                self.set_phase(AdminPhase::NoAdmin);
                return Err(ClusterError::NoMembers);
            }

            if let Some(admin) = state.admin_peer_id.clone() {
                debug!(%admin, "keeping present admin");
                self.commit(&admin);
                return Ok(admin);
            }

            let candidate = elect_admin(state.workers.values()).ok_or(ClusterError::NoMembers)?;

            if verify && candidate != self.ctx.peer_id() {
                self.set_phase(AdminPhase::Verifying);
                if !self.verify_candidate(&candidate).await {
                    warn!(%candidate, "admin candidate failed verification, dropping it");
                    registry.remove_worker(&candidate);
                    self.set_phase(AdminPhase::Electing);
                    continue;
                }
            }

            self.commit(&candidate);
            return Ok(candidate);
        }
    }

    /// Point the registry and the local flag at `admin`.
    fn commit(&self, admin: &str) {
        let registry = self.ctx.registry();
        let changed = registry.admin_pointer().as_deref() != Some(admin);
        if changed {
            registry.set_admin(admin);
        }
        let is_self = admin == self.ctx.peer_id();
        self.ctx.set_admin_flag(is_self);
        self.ctx.connections().retag_admin(Some(admin));
        self.set_phase(AdminPhase::Stable);

        if changed {
            info!(%admin, is_self, version = registry.version(), "admin elected");
        }
    }

    /// Ask `candidate` to prove it is alive within the verify timeout.
    async fn verify_candidate(&self, candidate: &str) -> bool {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        let sent = self.sink.send_to(
            candidate,
            MeshMessage::AdminVerify {
                request_id: request_id.clone(),
            },
        );
        if let Err(e) = sent {
            debug!(%candidate, error = %e, "admin verify could not be sent");
            self.pending.lock().remove(&request_id);
            return false;
        }

        let timeout = self.ctx.config().mesh.admin_verify_timeout();
        let confirmed = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        self.pending.lock().remove(&request_id);
        debug!(%candidate, %request_id, confirmed, "admin verification finished");
        confirmed
    }

    /// Answer another node's verification request.
    pub fn handle_verify_request(&self, from: &str, request_id: &str) {
        let ack = MeshMessage::AdminVerifyAck {
            request_id: request_id.to_string(),
        };
        if let Err(e) = self.sink.send_to(from, ack) {
            debug!(%from, error = %e, "admin verify ack not delivered");
        }
    }

    /// Resolve a pending verification. Returns false for unknown ids.
    pub fn complete_verification(&self, request_id: &str) -> bool {
        match self.pending.lock().remove(request_id) {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                debug!(%request_id, "ack for unknown verification");
                false
            }
        }
    }

    // ── Departures ────────────────────────────────────────────────

    /// The admin went away: drop it, elect a successor, and if that is
    /// this node, announce the new state.
    pub async fn handle_admin_departure(&self, peer_id: &str) -> ClusterResult<PeerId> {
        self.ctx.registry().remove_worker(peer_id);
        info!(%peer_id, "admin departed, re-electing");

        let admin = self.run_election(true).await?;
        if self.ctx.is_admin() {
            self.broadcast_state_update();
            self.announce_departure(peer_id);
        }
        Ok(admin)
    }

    /// A worker went away. The admin propagates the removal.
    pub fn handle_worker_departure(&self, peer_id: &str) -> bool {
        let removed = self.ctx.registry().remove_worker(peer_id);
        debug!(%peer_id, removed, "worker departed");
        if self.ctx.is_admin() {
            self.broadcast_state_update();
            self.announce_departure(peer_id);
        }
        removed
    }

    /// Class of a departed peer, keyed on the connection it held. A peer
    /// with no connection is the admin only if the pointer names it.
    pub fn departed_class(&self, peer_id: &str, connection: Option<PeerClass>) -> PeerClass {
        match connection {
            Some(class) => class,
            None if self.ctx.registry().admin_pointer().as_deref() == Some(peer_id) => {
                PeerClass::Admin
            }
            None => PeerClass::Worker,
        }
    }

    /// Route a departure to the admin or worker path.
    pub async fn handle_departure(&self, peer_id: &str, class: PeerClass) -> ClusterResult<()> {
        match class {
            PeerClass::Admin => {
                self.handle_admin_departure(peer_id).await?;
            }
            PeerClass::Worker | PeerClass::Client => {
                self.handle_worker_departure(peer_id);
            }
        }
        Ok(())
    }

    fn announce_departure(&self, peer_id: &str) {
        let message = MeshMessage::PeerLeft {
            peer_id: peer_id.to_string(),
        };
        for member in self.ctx.registry().member_ids() {
            if member == self.ctx.peer_id() || member == peer_id {
                continue;
            }
            if let Err(e) = self.sink.send_to(&member, message.clone()) {
                debug!(%member, error = %e, "peer_left not delivered");
            }
        }
    }

    // ── Admin duties ──────────────────────────────────────────────

    /// Send the full registry to every other member. Admin only.
    /// Returns how many members it reached.
    pub fn broadcast_state_update(&self) -> usize {
        if !self.ctx.is_admin() {
            debug!("not admin, skipping state broadcast");
            return 0;
        }
        let registry = self.ctx.registry();
        let message = MeshMessage::StateBroadcast {
            version: registry.version(),
            snapshot: registry.serialize(),
        };

        let mut reached = 0;
        for member in registry.member_ids() {
            if member == self.ctx.peer_id() {
                continue;
            }
            match self.sink.send_to(&member, message.clone()) {
                Ok(()) => reached += 1,
                Err(e) => debug!(%member, error = %e, "member unreachable for state broadcast"),
            }
        }
        debug!(version = registry.version(), reached, "state broadcast");
        reached
    }

    /// Send the full registry to one peer (answer to `state_request`).
    pub fn send_state_to(&self, peer_id: &str) -> ClusterResult<()> {
        if !self.ctx.is_admin() {
            return Err(ClusterError::NotAdmin);
        }
        let registry = self.ctx.registry();
        self.sink.send_to(
            peer_id,
            MeshMessage::StateBroadcast {
                version: registry.version(),
                snapshot: registry.serialize(),
            },
        )?;
        Ok(())
    }

    /// Merge a snapshot received from the admin and re-derive our flag.
    pub fn apply_state_broadcast(&self, from: &str, snapshot: &[u8]) -> ClusterResult<()> {
        let registry = self.ctx.registry();
        let before = registry.version();
        registry.apply_update(snapshot)?;

        if let Some(admin) = registry.admin_peer_id() {
            self.ctx.set_admin_flag(admin == self.ctx.peer_id());
            self.ctx.connections().retag_admin(Some(&admin));
            self.set_phase(AdminPhase::Stable);
        }
        debug!(%from, before, after = registry.version(), "state broadcast merged");
        Ok(())
    }

    /// Answer a worker query. Admin only.
    ///
    /// Returns the matching records (most GPU memory first, truncated to
    /// `max_results`) and the number of members before filtering.
    pub fn handle_client_query(
        &self,
        filters: &WorkerFilters,
    ) -> ClusterResult<(Vec<WorkerRecord>, usize)> {
        if !self.ctx.is_admin() {
            return Err(ClusterError::NotAdmin);
        }
        let state = self.ctx.registry().get_state();
        let total = state.len();

        let mut workers: Vec<WorkerRecord> = state
            .workers
            .into_values()
            .filter(|w| filters.matches(w))
            .collect();
        workers.sort_by(|a, b| {
            (Reverse(a.gpu_memory_mb), &a.peer_id).cmp(&(Reverse(b.gpu_memory_mb), &b.peer_id))
        });
        if let Some(max) = filters.max_results {
            workers.truncate(max);
        }
        Ok((workers, total))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gpumesh_core::{MeshConfig, TransportError, WorkerMetadata, WorkerStatus};

    use super::*;

    /// Records every send; optionally fails sends to listed peers.
    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(String, MeshMessage)>>,
        unreachable: Vec<String>,
    }

    impl MessageSink for RecordingSink {
        fn local_peer_id(&self) -> &str {
            "w1"
        }

        fn send_to(&self, peer_id: &str, message: MeshMessage) -> Result<(), TransportError> {
            if self.unreachable.iter().any(|p| p == peer_id) {
                return Err(TransportError::NotConnected(peer_id.to_string()));
            }
            self.sent.lock().push((peer_id.to_string(), message));
            Ok(())
        }
    }

    fn record(peer: &str, gpu: u64) -> WorkerRecord {
        WorkerRecord::from_metadata(peer, &WorkerMetadata::with_gpu_memory(gpu), false)
    }

    fn context(peer: &str, gpu: u64) -> Arc<MeshContext> {
        let mut config = MeshConfig::scaffold(peer, "room-a", gpu);
        config.mesh.admin_verify_timeout_ms = 50;
        MeshContext::new(config)
    }

    fn controller(ctx: &Arc<MeshContext>, sink: Arc<RecordingSink>) -> AdminController {
        AdminController::with_sink(ctx.clone(), sink)
    }

    #[test]
    fn elect_prefers_memory_then_smallest_id() {
        let members = vec![record("A", 8000), record("C", 16000), record("B", 16000)];
        assert_eq!(elect_admin(&members).as_deref(), Some("B"));
        assert_eq!(elect_admin(&members), elect_admin(members.iter().rev()));
        assert!(elect_admin(&Vec::new()).is_none());
    }

    #[tokio::test]
    async fn keeps_present_admin() {
        let ctx = context("w1", 4000);
        ctx.registry().add_worker("w2", &WorkerMetadata::with_gpu_memory(16000), false);
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));

        assert_eq!(admin.run_election(true).await.unwrap(), "w1");
        assert!(ctx.is_admin());
        assert_eq!(admin.phase(), AdminPhase::Stable);
    }

    #[tokio::test]
    async fn elects_and_reelects_in_registry_order() {
        let ctx = context("w1", 4000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(8000), false);
        reg.add_worker("w3", &WorkerMetadata::with_gpu_memory(8000), false);
        reg.clear_admin();
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));

        assert_eq!(admin.run_election(false).await.unwrap(), "w2");
        assert!(!ctx.is_admin());

        reg.remove_worker("w2");
        assert_eq!(admin.run_election(false).await.unwrap(), "w3");
        assert_eq!(reg.admin_peer_id().as_deref(), Some("w3"));
        assert!(reg.worker("w3").unwrap().is_admin);
    }

    #[tokio::test]
    async fn silent_candidate_is_dropped() {
        let ctx = context("w1", 4000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(16000), false);
        reg.clear_admin();
        let sink = Arc::new(RecordingSink::default());
        let admin = controller(&ctx, sink.clone());

        assert_eq!(admin.run_election(true).await.unwrap(), "w1");
        assert!(!reg.contains("w2"));
        assert!(ctx.is_admin());
        assert!(matches!(
            sink.sent.lock()[0],
            (ref to, MeshMessage::AdminVerify { .. }) if to == "w2"
        ));
    }

    #[tokio::test]
    async fn unreachable_candidate_is_dropped_without_waiting() {
        let ctx = context("w1", 4000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(16000), false);
        reg.clear_admin();
        let sink = Arc::new(RecordingSink {
            unreachable: vec!["w2".to_string()],
            ..Default::default()
        });
        let admin = controller(&ctx, sink);

        assert_eq!(admin.run_election(true).await.unwrap(), "w1");
        assert!(!reg.contains("w2"));
    }

    #[tokio::test]
    async fn acked_candidate_is_committed() {
        let ctx = MeshContext::new(MeshConfig::scaffold("w1", "room-a", 4000));
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(16000), false);
        reg.clear_admin();
        let sink = Arc::new(RecordingSink::default());
        let admin = Arc::new(controller(&ctx, sink.clone()));

        let election = {
            let admin = admin.clone();
            tokio::spawn(async move { admin.run_election(true).await })
        };

        let request_id = loop {
            if let Some((_, MeshMessage::AdminVerify { request_id })) = sink.sent.lock().first() {
                break request_id.clone();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        };
        assert_eq!(admin.phase(), AdminPhase::Verifying);
        assert!(admin.complete_verification(&request_id));

        assert_eq!(election.await.unwrap().unwrap(), "w2");
        assert!(reg.contains("w2"));
        assert!(!ctx.is_admin());
    }

    #[tokio::test]
    async fn empty_registry_has_no_members() {
        let ctx = context("w1", 4000);
        ctx.registry().remove_worker("w1");
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));
        assert!(matches!(
            admin.run_election(false).await,
            Err(ClusterError::NoMembers)
        ));
        assert_eq!(admin.phase(), AdminPhase::NoAdmin);
    }

    #[tokio::test]
    async fn admin_departure_promotes_self_and_announces() {
        let ctx = context("w3", 8000);
        let reg = ctx.registry();
        reg.add_worker("w1", &WorkerMetadata::with_gpu_memory(4000), false);
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(8000), false);
        reg.set_admin("w2");
        ctx.set_admin_flag(false);
        let sink = Arc::new(RecordingSink::default());
        let admin = controller(&ctx, sink.clone());

        assert_eq!(admin.handle_admin_departure("w2").await.unwrap(), "w3");
        assert!(ctx.is_admin());

        let sent = sink.sent.lock();
        assert!(sent.iter().any(|(to, m)| to == "w1"
            && matches!(m, MeshMessage::StateBroadcast { .. })));
        assert!(sent.iter().any(|(to, m)| to == "w1"
            && matches!(m, MeshMessage::PeerLeft { peer_id } if peer_id == "w2")));
    }

    #[test]
    fn departures_are_classed_by_connection() {
        let ctx = context("w1", 4000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(8000), false);
        reg.set_admin("w2");
        ctx.set_admin_flag(false);
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));

        assert_eq!(admin.departed_class("w3", Some(PeerClass::Admin)), PeerClass::Admin);
        assert_eq!(admin.departed_class("w3", Some(PeerClass::Client)), PeerClass::Client);
        // No connection: fall back to the admin pointer.
        assert_eq!(admin.departed_class("w2", None), PeerClass::Admin);
        assert_eq!(admin.departed_class("w3", None), PeerClass::Worker);
    }

    #[tokio::test]
    async fn worker_departure_on_non_admin_stays_quiet() {
        let ctx = context("w1", 4000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(8000), false);
        reg.add_worker("w3", &WorkerMetadata::with_gpu_memory(2000), false);
        reg.set_admin("w2");
        ctx.set_admin_flag(false);
        let sink = Arc::new(RecordingSink::default());
        let admin = controller(&ctx, sink.clone());

        let class = admin.departed_class("w3", None);
        assert_eq!(class, PeerClass::Worker);
        admin.handle_departure("w3", class).await.unwrap();
        assert!(!reg.contains("w3"));
        assert!(sink.sent.lock().is_empty());
    }

    #[test]
    fn broadcast_skips_unreachable_members() {
        let ctx = context("w1", 16000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(8000), false);
        reg.add_worker("w3", &WorkerMetadata::with_gpu_memory(8000), false);
        let sink = Arc::new(RecordingSink {
            unreachable: vec!["w3".to_string()],
            ..Default::default()
        });
        let admin = controller(&ctx, sink.clone());

        assert_eq!(admin.broadcast_state_update(), 1);
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "w2");
    }

    #[test]
    fn state_broadcast_rederives_admin_flag() {
        let admin_ctx = context("w2", 16000);
        admin_ctx
            .registry()
            .add_worker("w1", &WorkerMetadata::with_gpu_memory(4000), false);

        let ctx = context("w1", 4000);
        ctx.registry().set_admin("w2");
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));

        admin
            .apply_state_broadcast("w2", &admin_ctx.registry().serialize())
            .unwrap();
        assert!(!ctx.is_admin());
        assert_eq!(ctx.admin_peer_id().as_deref(), Some("w2"));
        assert!(admin.apply_state_broadcast("w2", &[0xff, 0x01]).is_err());
    }

    #[test]
    fn client_query_filters_sorts_and_counts() {
        let ctx = context("w1", 8000);
        let reg = ctx.registry();
        reg.add_worker("w2", &WorkerMetadata::with_gpu_memory(24000), false);
        reg.add_worker("w3", &WorkerMetadata::with_gpu_memory(16000), false);
        reg.add_worker("w4", &WorkerMetadata::with_gpu_memory(24000), false);
        reg.update_status("w4", WorkerStatus::Busy, Some("job-1"));
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));

        let filters = WorkerFilters {
            status: Some(WorkerStatus::Available),
            min_gpu_memory_mb: Some(10000),
            max_results: Some(5),
            ..Default::default()
        };
        let (workers, total) = admin.handle_client_query(&filters).unwrap();
        let ids: Vec<&str> = workers.iter().map(|w| w.peer_id.as_str()).collect();
        assert_eq!(ids, vec!["w2", "w3"]);
        assert_eq!(total, 4);

        let top = WorkerFilters {
            max_results: Some(1),
            ..Default::default()
        };
        let (workers, _) = admin.handle_client_query(&top).unwrap();
        assert_eq!(workers[0].peer_id, "w2");
    }

    #[test]
    fn client_query_requires_admin() {
        let ctx = context("w1", 8000);
        ctx.set_admin_flag(false);
        let admin = controller(&ctx, Arc::new(RecordingSink::default()));
        assert!(matches!(
            admin.handle_client_query(&WorkerFilters::default()),
            Err(ClusterError::NotAdmin)
        ));
    }
}
