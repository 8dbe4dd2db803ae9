//! Mesh coordinator: the per-node event loop.
//!
//! Owns link negotiation, frame relay, envelope dispatch, and the
//! admin promotion/demotion handshake with the bootstrap relay.
//!
//! # Event flow
//!
//! ```text
//! MeshEvent ──► run()
//!   ├── Link(Open)            → register channel, announce to admin
//!   ├── Link(StateChanged)    → validate transition, departure on terminal
//!   ├── Link(LocalCandidate)  → trickle to remote
//!   ├── Bootstrap(Signal)     → dispatch()
//!   ├── Bootstrap(Admin*)     → confirm, or demote on conflict
//!   └── Frame                 → relay if addressed elsewhere, else dispatch()
//! ```
//!
//! Anything that may wait on a network reply (departures lead to
//! elections, elections wait for verify acks) runs on its own task so the
//! loop keeps delivering the acks it is waiting for.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use gpumesh_core::{Envelope, MeshMessage, MessageSink, PeerClass, PeerId, TransportError};

use crate::admin::AdminController;
use crate::context::MeshContext;
use crate::error::ClusterResult;
use crate::transport::{
    BootstrapEvent, BootstrapTransport, LinkEvent, LinkFactory, LinkState, MeshEvent,
};

/// Receives application-level messages (heartbeats, jobs, worker lists).
pub trait MessageHandler: Send + Sync {
    /// Handle `message` from `from`. Return true if it was consumed.
    fn handle(&self, from: &str, message: &MeshMessage) -> bool;

    /// A peer's connection went away.
    fn on_peer_departed(&self, _peer_id: &str) {}
}

/// Drives one node's membership in the mesh.
pub struct MeshCoordinator {
    ctx: Arc<MeshContext>,
    admin: Arc<AdminController>,
    links: Arc<dyn LinkFactory>,
    bootstrap: Arc<dyn BootstrapTransport>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    link_states: Mutex<HashMap<PeerId, LinkState>>,
    /// Peers we sent an offer to and have not heard back from.
    pending_offers: Mutex<HashSet<PeerId>>,
    /// Class a remote asked to be registered under in its offer.
    offered_classes: Mutex<HashMap<PeerId, PeerClass>>,
}

impl MeshCoordinator {
    pub fn new(
        ctx: Arc<MeshContext>,
        admin: Arc<AdminController>,
        links: Arc<dyn LinkFactory>,
        bootstrap: Arc<dyn BootstrapTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            admin,
            links,
            bootstrap,
            handlers: RwLock::new(Vec::new()),
            link_states: Mutex::new(HashMap::new()),
            pending_offers: Mutex::new(HashSet::new()),
            offered_classes: Mutex::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &Arc<MeshContext> {
        &self.ctx
    }

    pub fn admin(&self) -> &Arc<AdminController> {
        &self.admin
    }

    pub fn register_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.handlers.write().push(handler);
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Enter the room: settle on an admin locally, then open the relay
    /// connection, claiming the admin slot if we believe we hold it.
    ///
    /// The event loop must already be running: the relay answers a claim
    /// with `AdminConfirmed` or `AdminConflict`.
    pub async fn join(&self) -> ClusterResult<()> {
        let admin = self.admin.run_election(false).await?;
        let claim = self.ctx.is_admin();
        self.bootstrap.connect(self.ctx.room_id(), claim).await?;
        info!(
            peer_id = %self.ctx.peer_id(),
            room_id = %self.ctx.room_id(),
            %admin,
            claim,
            "joined room relay"
        );
        if !claim {
            self.connect_to(&admin).await;
        }
        Ok(())
    }

    /// Leave the room gracefully.
    pub async fn leave(&self) {
        let local = self.ctx.peer_id().to_string();
        let connections = self.ctx.connections();

        let departure = MeshMessage::PeerLeft {
            peer_id: local.clone(),
        };
        let notified = connections.broadcast(&departure);

        if self.ctx.is_admin() {
            self.ctx.registry().remove_worker(&local);
            self.admin.broadcast_state_update();
        }
        info!(peer_id = %local, notified, "leaving room");

        tokio::time::sleep(self.ctx.config().mesh.shutdown_grace()).await;
        connections.close_all();
        self.bootstrap.close();
        self.link_states.lock().clear();
        self.pending_offers.lock().clear();
    }

    /// Consume events until the queue closes or shutdown is signalled.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MeshEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let peer_id = self.ctx.peer_id().to_string();
        info!(%peer_id, "mesh event loop started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        debug!(%peer_id, "event queue closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!(%peer_id, "mesh event loop shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: MeshEvent) {
        trace!(?event, "mesh event");
        match event {
            MeshEvent::Link(LinkEvent::Open { peer_id, channel }) => {
                self.on_link_open(&peer_id, channel);
            }
            MeshEvent::Link(LinkEvent::StateChanged { peer_id, state }) => {
                self.on_link_state(&peer_id, state);
            }
            MeshEvent::Link(LinkEvent::LocalCandidate { peer_id, candidate }) => {
                self.signal(&peer_id, MeshMessage::MeshIceCandidate { candidate });
            }
            MeshEvent::Bootstrap(BootstrapEvent::Signal(envelope)) => {
                self.dispatch(envelope).await;
            }
            MeshEvent::Bootstrap(BootstrapEvent::AdminConfirmed { admin }) => {
                self.on_admin_confirmed(&admin).await;
            }
            MeshEvent::Bootstrap(BootstrapEvent::AdminConflict { confirmed_admin }) => {
                self.demote(&confirmed_admin).await;
            }
            MeshEvent::Frame { from_link, payload } => {
                self.on_frame(&from_link, &payload).await;
            }
        }
    }

    // ── Links ─────────────────────────────────────────────────────

    fn class_for(&self, peer_id: &str) -> PeerClass {
        if self.ctx.registry().admin_pointer().as_deref() == Some(peer_id) {
            return PeerClass::Admin;
        }
        self.offered_classes
            .lock()
            .remove(peer_id)
            .unwrap_or(PeerClass::Worker)
    }

    fn on_link_open(&self, peer_id: &str, channel: crate::transport::ChannelHandle) {
        let class = self.class_for(peer_id);
        self.pending_offers.lock().remove(peer_id);
        self.link_states
            .lock()
            .insert(peer_id.to_string(), LinkState::Connected);
        if self.ctx.connections().insert(peer_id, class, channel).is_some() {
            debug!(%peer_id, "replaced existing channel");
        }
        info!(local = %self.ctx.peer_id(), %peer_id, %class, "link open");

        if class == PeerClass::Admin && !self.ctx.is_admin() {
            let joined = MeshMessage::PeerJoined {
                peer_id: self.ctx.peer_id().to_string(),
                metadata: self.ctx.metadata().clone(),
            };
            if let Err(e) = self.ctx.connections().send_to(peer_id, joined) {
                warn!(%peer_id, error = %e, "could not announce to admin");
            }
            // Non-admins reach everyone through the mesh from here on.
            self.bootstrap.close();
        }
    }

    fn on_link_state(self: &Arc<Self>, peer_id: &str, next: LinkState) {
        {
            let mut states = self.link_states.lock();
            let current = states.get(peer_id).copied().unwrap_or(LinkState::New);
            if !current.can_transition_to(next) {
                debug!(%peer_id, %current, %next, "ignoring invalid link transition");
                return;
            }
            if next.is_terminal() {
                states.remove(peer_id);
            } else {
                states.insert(peer_id.to_string(), next);
            }
        }
        debug!(%peer_id, state = %next, "link state changed");

        if next.is_terminal() {
            self.pending_offers.lock().remove(peer_id);
            if self.ctx.connections().contains(peer_id) {
                self.handle_peer_lost(peer_id);
            }
        }
    }

    /// Treat `peer_id` as gone: drop its channel, tell the handlers, and
    /// run departure handling off the event loop.
    pub fn handle_peer_lost(self: &Arc<Self>, peer_id: &str) {
        let class = self.ctx.connections().remove(peer_id).map(|(class, channel)| {
            channel.close();
            class
        });
        self.link_states.lock().remove(peer_id);
        // Decided now: a state broadcast processed before the spawned task
        // runs may already have cleared the pointer.
        let class = self.admin.departed_class(peer_id, class);
        info!(local = %self.ctx.peer_id(), %peer_id, %class, "peer lost");

        for handler in self.handlers.read().iter() {
            handler.on_peer_departed(peer_id);
        }

        let this = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.admin.handle_departure(&peer_id, class).await {
                warn!(%peer_id, error = %e, "re-election failed");
            }
            this.ensure_admin_relay().await;
        });
    }

    /// Offer a link to `peer_id` unless one is open or being negotiated.
    pub async fn connect_to(&self, peer_id: &str) {
        if peer_id == self.ctx.peer_id() || self.ctx.connections().contains(peer_id) {
            return;
        }
        if !self.pending_offers.lock().insert(peer_id.to_string()) {
            trace!(%peer_id, "offer already outstanding");
            return;
        }

        match self.links.create_offer(peer_id).await {
            Ok(sdp) => {
                let peer_class = if self.ctx.is_admin() {
                    PeerClass::Admin
                } else {
                    PeerClass::Worker
                };
                debug!(%peer_id, "sending offer");
                if !self.signal(peer_id, MeshMessage::MeshOffer { sdp, peer_class }) {
                    self.pending_offers.lock().remove(peer_id);
                }
            }
            Err(e) => {
                warn!(%peer_id, error = %e, "could not create offer");
                self.pending_offers.lock().remove(peer_id);
            }
        }
    }

    /// Drop any stale offer and try `peer_id` again, reopening the relay
    /// first when the target is the admin and we have no route to it.
    pub async fn reconnect(&self, peer_id: &str) -> ClusterResult<()> {
        self.pending_offers.lock().remove(peer_id);
        let targets_admin = self.ctx.registry().admin_pointer().as_deref() == Some(peer_id);
        if targets_admin && !self.bootstrap.is_connected() {
            self.bootstrap.connect(self.ctx.room_id(), false).await?;
        }
        self.connect_to(peer_id).await;
        Ok(())
    }

    /// Connect to `peers` in batches, pausing between batches, then give
    /// stragglers up to the discovery timeout before clearing their offers.
    pub async fn connect_batched(self: Arc<Self>, peers: Vec<PeerId>) {
        let targets: Vec<PeerId> = peers
            .into_iter()
            .filter(|p| p != self.ctx.peer_id() && !self.ctx.connections().contains(p))
            .collect();
        if targets.is_empty() {
            return;
        }
        let tuning = &self.ctx.config().mesh;
        let mut shutdown = self.ctx.shutdown_signal();
        info!(count = targets.len(), batch_size = tuning.batch_size, "forming mesh");

        for (i, batch) in targets.chunks(tuning.batch_size).enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(tuning.batch_pause()) => {}
                    _ = shutdown.changed() => return,
                }
            }
            for peer_id in batch {
                self.connect_to(peer_id).await;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(tuning.peer_discovery_timeout()) => {}
            _ = shutdown.changed() => return,
        }
        for peer_id in &targets {
            if !self.ctx.connections().contains(peer_id)
                && self.pending_offers.lock().remove(peer_id)
            {
                warn!(%peer_id, "peer did not connect within discovery timeout");
            }
        }
    }

    /// Send a negotiation message: over the mesh when a route exists,
    /// otherwise through the bootstrap relay. Returns whether it left.
    fn signal(&self, to: &str, message: MeshMessage) -> bool {
        let kind = message.kind();
        let via_mesh = match self.ctx.connections().send_to(to, message.clone()) {
            Ok(()) => return true,
            Err(e) => e,
        };
        if !self.bootstrap.is_connected() {
            debug!(%to, kind, error = %via_mesh, "no route for signal");
            return false;
        }
        let envelope = Envelope::new(self.ctx.peer_id(), Some(to), message);
        match self.bootstrap.send(&envelope) {
            Ok(()) => true,
            Err(e) => {
                debug!(%to, kind, error = %e, "relay could not deliver signal");
                false
            }
        }
    }

    // ── Admin handshake with the relay ────────────────────────────

    async fn on_admin_confirmed(&self, admin: &str) {
        if admin == self.ctx.peer_id() {
            self.ctx.set_admin_flag(true);
            info!(%admin, "relay confirmed this node as admin");
            return;
        }
        if self.ctx.is_admin() {
            self.demote(admin).await;
            return;
        }
        if self.ctx.registry().admin_pointer().as_deref() != Some(admin) {
            self.ctx.registry().set_admin(admin);
            self.ctx.connections().retag_admin(Some(admin));
        }
        self.connect_to(admin).await;
    }

    /// The relay holds another admin: step down and join it instead.
    async fn demote(&self, confirmed_admin: &str) {
        warn!(
            peer_id = %self.ctx.peer_id(),
            %confirmed_admin,
            "relay confirmed another admin, demoting"
        );
        self.bootstrap.close();
        self.ctx.set_admin_flag(false);
        self.ctx.registry().set_admin(confirmed_admin);
        self.ctx.connections().retag_admin(Some(confirmed_admin));

        if let Err(e) = self.bootstrap.connect(self.ctx.room_id(), false).await {
            warn!(error = %e, "could not rejoin relay after demotion");
            return;
        }
        self.connect_to(confirmed_admin).await;
    }

    /// After an election made us admin, hold the relay's admin slot.
    async fn ensure_admin_relay(&self) {
        if !self.ctx.is_admin() || self.ctx.is_shutting_down() {
            return;
        }
        let result = if self.bootstrap.is_connected() {
            self.bootstrap.declare_admin().await
        } else {
            self.bootstrap.connect(self.ctx.room_id(), true).await
        };
        match result {
            Ok(()) => info!(peer_id = %self.ctx.peer_id(), "promoted, claimed relay admin slot"),
            Err(e) => warn!(error = %e, "could not claim relay admin slot"),
        }
    }

    // ── Frames and dispatch ───────────────────────────────────────

    async fn on_frame(self: &Arc<Self>, from_link: &str, payload: &str) {
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%from_link, error = %e, "dropping malformed frame");
                return;
            }
        };

        if envelope.is_for_other(self.ctx.peer_id()) {
            let to = envelope.to_peer_id.as_deref().unwrap_or_default();
            match self.ctx.connections().channel(to) {
                Some(channel) => {
                    trace!(from = %envelope.from_peer_id, %to, kind = envelope.message.kind(), "relaying frame");
                    if let Err(e) = channel.send(payload) {
                        debug!(%to, error = %e, "relay send failed");
                    }
                }
                None => debug!(from = %envelope.from_peer_id, %to, "no channel for relay, dropping"),
            }
            return;
        }

        self.dispatch(envelope).await;
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let from = envelope.from_peer_id;
        let message = envelope.message;
        trace!(%from, kind = message.kind(), "dispatch");

        match message {
            MeshMessage::MeshOffer { sdp, peer_class } => {
                self.on_offer(&from, &sdp, peer_class).await;
            }
            MeshMessage::MeshAnswer { sdp } => {
                if !self.pending_offers.lock().contains(&from) {
                    debug!(%from, "answer without outstanding offer");
                    return;
                }
                if let Err(e) = self.links.accept_answer(&from, &sdp).await {
                    warn!(%from, error = %e, "answer rejected");
                    self.pending_offers.lock().remove(&from);
                }
            }
            MeshMessage::MeshIceCandidate { candidate } => {
                if let Err(e) = self.links.add_remote_candidate(&from, &candidate).await {
                    debug!(%from, error = %e, "candidate rejected");
                }
            }
            MeshMessage::AdminVerify { request_id } => {
                self.admin.handle_verify_request(&from, &request_id);
            }
            MeshMessage::AdminVerifyAck { request_id } => {
                self.admin.complete_verification(&request_id);
            }
            MeshMessage::StateBroadcast { version, snapshot } => {
                debug!(%from, version, bytes = snapshot.len(), "state broadcast received");
                if let Err(e) = self.admin.apply_state_broadcast(&from, &snapshot) {
                    warn!(%from, error = %e, "discarding state broadcast");
                }
            }
            MeshMessage::StateRequest => {
                if let Err(e) = self.admin.send_state_to(&from) {
                    debug!(%from, error = %e, "state request not served");
                }
            }
            MeshMessage::PeerJoined { peer_id, metadata } => {
                self.on_peer_joined(&peer_id, &metadata);
            }
            MeshMessage::PeerLeft { peer_id } => {
                if peer_id == self.ctx.peer_id() {
                    return;
                }
                info!(%from, %peer_id, "peer left");
                self.handle_peer_lost(&peer_id);
            }
            MeshMessage::QueryWorkers { filters } => {
                match self.admin.handle_client_query(&filters) {
                    Ok((workers, total_count)) => {
                        let reply = MeshMessage::WorkerList {
                            workers,
                            total_count,
                        };
                        if let Err(e) = self.ctx.connections().send_to(&from, reply) {
                            debug!(%from, error = %e, "worker list not delivered");
                        }
                    }
                    Err(e) => debug!(%from, error = %e, "query not served"),
                }
            }
            MeshMessage::StatusUpdate {
                status,
                current_job_id,
            } => {
                if !self.ctx.is_admin() {
                    debug!(%from, "status update sent to non-admin, ignoring");
                    return;
                }
                if self
                    .ctx
                    .registry()
                    .update_status(&from, status, current_job_id.as_deref())
                {
                    self.admin.broadcast_state_update();
                }
            }
            MeshMessage::MeshPeerList { peers } => {
                debug!(%from, count = peers.len(), "peer list received");
                let this = self.clone();
                tokio::spawn(this.connect_batched(peers));
            }
            message @ (MeshMessage::Heartbeat { .. }
            | MeshMessage::HeartbeatResponse { .. }
            | MeshMessage::WorkerList { .. }
            | MeshMessage::JobRequest { .. }
            | MeshMessage::JobResponse { .. }
            | MeshMessage::JobAssignment { .. }
            | MeshMessage::JobCancel { .. }
            | MeshMessage::JobCancelled { .. }) => {
                let handled = self
                    .handlers
                    .read()
                    .iter()
                    .any(|h| h.handle(&from, &message));
                if !handled {
                    debug!(%from, kind = message.kind(), "no handler for message");
                }
            }
        }
    }

    async fn on_offer(&self, from: &str, sdp: &str, peer_class: PeerClass) {
        let glare = self.pending_offers.lock().contains(from);
        if glare {
            if self.ctx.peer_id() < from {
                debug!(%from, "offer glare, keeping ours");
                return;
            }
            debug!(%from, "offer glare, yielding to remote");
            self.pending_offers.lock().remove(from);
        }

        self.offered_classes
            .lock()
            .insert(from.to_string(), peer_class);
        match self.links.accept_offer(from, sdp).await {
            Ok(answer) => {
                self.signal(from, MeshMessage::MeshAnswer { sdp: answer });
            }
            Err(e) => {
                self.offered_classes.lock().remove(from);
                warn!(%from, error = %e, "offer rejected");
            }
        }
    }

    /// Admin side of a join: register, hand out the peer list, broadcast.
    fn on_peer_joined(&self, peer_id: &str, metadata: &gpumesh_core::WorkerMetadata) {
        if !self.ctx.is_admin() {
            debug!(%peer_id, "peer_joined sent to non-admin, ignoring");
            return;
        }
        let registry = self.ctx.registry();
        registry.add_worker(peer_id, metadata, false);
        info!(%peer_id, gpu_memory_mb = metadata.gpu_memory_mb, members = registry.len(), "worker joined");

        let peers: Vec<PeerId> = registry
            .member_ids()
            .into_iter()
            .filter(|p| p != peer_id && p != self.ctx.peer_id())
            .collect();
        if let Err(e) = self
            .ctx
            .connections()
            .send_to(peer_id, MeshMessage::MeshPeerList { peers })
        {
            warn!(%peer_id, error = %e, "peer list not delivered");
        }
        self.admin.broadcast_state_update();
    }
}

/// Convenience for components that only need to send.
impl MessageSink for MeshCoordinator {
    fn local_peer_id(&self) -> &str {
        self.ctx.peer_id()
    }

    fn send_to(&self, peer_id: &str, message: MeshMessage) -> Result<(), TransportError> {
        self.ctx.connections().send_to(peer_id, message)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gpumesh_core::MeshConfig;

    use super::*;
    use crate::memory::MemoryNetwork;

    struct Node {
        ctx: Arc<MeshContext>,
        coordinator: Arc<MeshCoordinator>,
    }

    fn spawn_node(net: &MemoryNetwork, peer: &str, gpu: u64) -> Node {
        let mut config = MeshConfig::scaffold(peer, "room-a", gpu);
        config.mesh.batch_pause_ms = 10;
        config.mesh.shutdown_grace_ms = 10;
        let ctx = MeshContext::new(config);
        let endpoint = net.endpoint(peer);
        let admin = Arc::new(AdminController::new(ctx.clone()));
        let coordinator =
            MeshCoordinator::new(ctx.clone(), admin, endpoint.links, endpoint.bootstrap);
        tokio::spawn(coordinator.clone().run(endpoint.events, ctx.shutdown_signal()));
        Node { ctx, coordinator }
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Link stack that only records when offers were created.
    #[derive(Default)]
    struct OfferClock {
        offers: Mutex<Vec<(PeerId, tokio::time::Instant)>>,
    }

    #[async_trait::async_trait]
    impl LinkFactory for OfferClock {
        async fn create_offer(&self, remote: &str) -> Result<String, TransportError> {
            self.offers
                .lock()
                .push((remote.to_string(), tokio::time::Instant::now()));
            Ok(format!("offer-{remote}"))
        }

        async fn accept_offer(&self, remote: &str, _sdp: &str) -> Result<String, TransportError> {
            Ok(format!("answer-{remote}"))
        }

        async fn accept_answer(&self, _remote: &str, _sdp: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn add_remote_candidate(
            &self,
            _remote: &str,
            _candidate: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Relay that is always up and keeps what it was asked to deliver.
    #[derive(Default)]
    struct RecordingRelay {
        sent: Mutex<Vec<Envelope>>,
    }

    #[async_trait::async_trait]
    impl BootstrapTransport for RecordingRelay {
        async fn connect(&self, _room_id: &str, _claim_admin: bool) -> Result<(), TransportError> {
            Ok(())
        }

        async fn declare_admin(&self) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
            self.sent.lock().push(envelope.clone());
            Ok(())
        }

        fn close(&self) {}

        fn is_connected(&self) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn mesh_forms_in_paced_batches() {
        let mut config = MeshConfig::scaffold("w1", "room-a", 8000);
        config.mesh.batch_size = 2;
        config.mesh.batch_pause_ms = 100;
        config.mesh.peer_discovery_timeout_ms = 1_000;
        let ctx = MeshContext::new(config);
        let links = Arc::new(OfferClock::default());
        let relay = Arc::new(RecordingRelay::default());
        let admin = Arc::new(AdminController::new(ctx.clone()));
        let coordinator = MeshCoordinator::new(ctx, admin, links.clone(), relay.clone());

        let peers: Vec<PeerId> = ["w2", "w3", "w1", "w4", "w5", "w6"]
            .iter()
            .map(|p| p.to_string())
            .collect();
        let start = tokio::time::Instant::now();
        coordinator.clone().connect_batched(peers).await;

        let offers: Vec<(String, u128)> = links
            .offers
            .lock()
            .iter()
            .map(|(peer, at)| (peer.clone(), (*at - start).as_millis()))
            .collect();
        let expected: Vec<(String, u128)> = [
            ("w2", 0),
            ("w3", 0),
            ("w4", 100),
            ("w5", 100),
            ("w6", 200),
        ]
        .iter()
        .map(|(p, ms)| (p.to_string(), *ms))
        .collect();
        assert_eq!(offers, expected);

        let relayed: Vec<String> = relay
            .sent
            .lock()
            .iter()
            .filter(|e| matches!(e.message, MeshMessage::MeshOffer { .. }))
            .filter_map(|e| e.to_peer_id.clone())
            .collect();
        assert_eq!(relayed, vec!["w2", "w3", "w4", "w5", "w6"]);

        // Nobody answered: the discovery timeout clears every offer.
        assert!(start.elapsed() >= Duration::from_millis(1_200));
        assert!(coordinator.pending_offers.lock().is_empty());
    }

    #[tokio::test]
    async fn second_worker_demotes_and_joins_admin() {
        let net = MemoryNetwork::new();
        let w1 = spawn_node(&net, "w1", 8000);
        w1.coordinator.join().await.unwrap();
        eventually("w1 confirmed", || net.relay_admin("room-a").as_deref() == Some("w1")).await;

        let w2 = spawn_node(&net, "w2", 16000);
        w2.coordinator.join().await.unwrap();

        eventually("w2 registered at admin", || w1.ctx.registry().contains("w2")).await;
        eventually("w2 sees admin", || w2.ctx.admin_peer_id().as_deref() == Some("w1")).await;
        assert!(w1.ctx.is_admin());
        assert!(!w2.ctx.is_admin());
        assert_eq!(w2.ctx.connections().class_of("w1"), Some(PeerClass::Admin));
        assert_eq!(net.relay_admin("room-a").as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn joiners_mesh_through_admin_relay() {
        let net = MemoryNetwork::new();
        let nodes: Vec<Node> = ["w1", "w2", "w3"]
            .iter()
            .map(|p| spawn_node(&net, p, 8000))
            .collect();
        for node in &nodes {
            node.coordinator.join().await.unwrap();
            let id = node.ctx.peer_id().to_string();
            eventually("join", || nodes[0].ctx.registry().contains(&id)).await;
        }

        eventually("full mesh", || net.is_linked("w2", "w3")).await;
        eventually("w3 holds w2 channel", || nodes[2].ctx.connections().contains("w2")).await;
        for node in &nodes {
            eventually("converged", || node.ctx.registry().len() == 3).await;
        }
    }

    #[tokio::test]
    async fn frames_for_unknown_destinations_are_dropped() {
        let net = MemoryNetwork::new();
        let w1 = spawn_node(&net, "w1", 8000);
        w1.coordinator.join().await.unwrap();
        let w2 = spawn_node(&net, "w2", 4000);
        w2.coordinator.join().await.unwrap();
        eventually("linked", || w2.ctx.connections().contains("w1")).await;

        // Addressed to a peer the admin has no channel to.
        w2.ctx
            .connections()
            .send_to("ghost", MeshMessage::StateRequest)
            .unwrap();
        // Garbage is logged and discarded.
        w2.ctx.connections().channel("w1").unwrap().send("{not json").unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(w1.ctx.connections().contains("w2"));
    }

    #[tokio::test]
    async fn leave_announces_departure() {
        let net = MemoryNetwork::new();
        let w1 = spawn_node(&net, "w1", 8000);
        w1.coordinator.join().await.unwrap();
        let w2 = spawn_node(&net, "w2", 4000);
        w2.coordinator.join().await.unwrap();
        eventually("joined", || w1.ctx.registry().contains("w2")).await;

        w2.coordinator.leave().await;
        eventually("w2 removed", || !w1.ctx.registry().contains("w2")).await;
        assert!(w1.ctx.connections().is_empty());
        assert!(w1.ctx.is_admin());
    }

    #[tokio::test]
    async fn admin_loss_promotes_successor_at_relay() {
        let net = MemoryNetwork::new();
        let w1 = spawn_node(&net, "w1", 8000);
        w1.coordinator.join().await.unwrap();
        let w2 = spawn_node(&net, "w2", 4000);
        w2.coordinator.join().await.unwrap();
        eventually("joined", || w2.ctx.admin_peer_id().as_deref() == Some("w1")).await;

        net.isolate("w1");
        eventually("w2 promoted", || w2.ctx.is_admin()).await;
        eventually("relay slot", || net.relay_admin("room-a").as_deref() == Some("w2")).await;
        assert!(!w2.ctx.registry().contains("w1"));
    }
}
