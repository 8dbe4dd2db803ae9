//! Heartbeat monitor: liveness of directly connected peers.
//!
//! Two loops share one last-seen table. The send loop pings every open
//! channel each interval; the check loop declares any peer silent for
//! longer than `interval × timeout_multiplier` dead and hands it to the
//! coordinator's departure path.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gpumesh_cluster::{MeshCoordinator, MessageHandler};
use gpumesh_core::{MeshMessage, MessageSink, PeerId};

pub struct HeartbeatMonitor {
    coordinator: Arc<MeshCoordinator>,
    /// peer → last heartbeat or heartbeat response received.
    last_seen: Mutex<HashMap<PeerId, Instant>>,
    sequence: AtomicU64,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    pub fn new(coordinator: Arc<MeshCoordinator>) -> Arc<Self> {
        let config = &coordinator.context().config().heartbeat;
        let interval = config.interval();
        let timeout = config.timeout();
        Arc::new(Self {
            coordinator,
            last_seen: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            interval,
            timeout,
        })
    }

    /// Note that `peer_id` is alive.
    pub fn record(&self, peer_id: &str) {
        self.last_seen
            .lock()
            .insert(peer_id.to_string(), Instant::now());
    }

    pub fn last_seen(&self, peer_id: &str) -> Option<Instant> {
        self.last_seen.lock().get(peer_id).copied()
    }

    pub fn tracked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.last_seen.lock().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Ping every connected peer. Returns how many pings left.
    pub fn send_heartbeats(&self) -> usize {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let sent = self
            .coordinator
            .context()
            .connections()
            .broadcast(&MeshMessage::Heartbeat { sequence });
        debug!(sequence, sent, "heartbeats sent");
        sent
    }

    /// Declare silent peers dead. Returns the peers that were dropped.
    pub fn check_timeouts(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let dead: Vec<PeerId> = {
            let mut last_seen = self.last_seen.lock();
            let dead: Vec<PeerId> = last_seen
                .iter()
                .filter(|(_, seen)| now.duration_since(**seen) > self.timeout)
                .map(|(peer, _)| peer.clone())
                .collect();
            for peer in &dead {
                last_seen.remove(peer);
            }
            dead
        };

        for peer_id in &dead {
            warn!(%peer_id, timeout = ?self.timeout, "heartbeat timeout, peer declared dead");
            self.coordinator.handle_peer_lost(peer_id);
        }
        dead
    }

    /// Spawn the send and check loops.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(interval = ?self.interval, timeout = ?self.timeout, "heartbeat monitor started");
        let sender = {
            let this = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { this.run_loop(shutdown, |m| { m.send_heartbeats(); }).await })
        };
        let checker = {
            let this = self.clone();
            tokio::spawn(async move { this.run_loop(shutdown, |m| { m.check_timeouts(); }).await })
        };
        vec![sender, checker]
    }

    async fn run_loop<F>(&self, mut shutdown: watch::Receiver<bool>, tick: F)
    where
        F: Fn(&Self),
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => tick(self),
                _ = shutdown.changed() => {
                    debug!("heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}

impl MessageHandler for HeartbeatMonitor {
    fn handle(&self, from: &str, message: &MeshMessage) -> bool {
        match message {
            MeshMessage::Heartbeat { sequence } => {
                self.record(from);
                let reply = MeshMessage::HeartbeatResponse {
                    sequence: *sequence,
                };
                if let Err(e) = self.coordinator.send_to(from, reply) {
                    debug!(%from, error = %e, "heartbeat response not delivered");
                }
                true
            }
            MeshMessage::HeartbeatResponse { .. } => {
                self.record(from);
                true
            }
            _ => false,
        }
    }

    fn on_peer_departed(&self, peer_id: &str) {
        self.last_seen.lock().remove(peer_id);
    }
}

#[cfg(test)]
mod tests {
    use gpumesh_cluster::{AdminController, MemoryNetwork, MeshContext, PeerChannel};
    use gpumesh_core::{Envelope, MeshConfig, PeerClass, TransportError, WorkerMetadata};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<String>>,
    }

    impl PeerChannel for Recorder {
        fn send(&self, frame: &str) -> Result<(), TransportError> {
            self.frames.lock().push(frame.to_string());
            Ok(())
        }

        fn close(&self) {}
    }

    fn coordinator(net: &MemoryNetwork, peer: &str) -> Arc<MeshCoordinator> {
        let mut config = MeshConfig::scaffold(peer, "room-a", 8000);
        config.heartbeat.interval_ms = 1_000;
        let ctx = MeshContext::new(config);
        let endpoint = net.endpoint(peer);
        let admin = Arc::new(AdminController::new(ctx.clone()));
        MeshCoordinator::new(ctx, admin, endpoint.links, endpoint.bootstrap)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_is_declared_dead_after_three_intervals() {
        let net = MemoryNetwork::new();
        let coord = coordinator(&net, "w1");
        let ctx = coord.context().clone();
        ctx.registry()
            .add_worker("w2", &WorkerMetadata::with_gpu_memory(4000), false);
        ctx.connections()
            .insert("w2", PeerClass::Worker, Arc::new(Recorder::default()));
        let monitor = HeartbeatMonitor::new(coord);

        monitor.record("w2");
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(monitor.check_timeouts().is_empty());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(monitor.check_timeouts(), vec!["w2".to_string()]);
        assert!(monitor.tracked_peers().is_empty());
        assert!(!ctx.connections().contains("w2"));

        for _ in 0..10 {
            if !ctx.registry().contains("w2") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!ctx.registry().contains("w2"));
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_heartbeats_keep_peer_alive() {
        let net = MemoryNetwork::new();
        let monitor = HeartbeatMonitor::new(coordinator(&net, "w1"));

        monitor.record("w2");
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(2)).await;
            monitor.handle("w2", &MeshMessage::HeartbeatResponse { sequence: 1 });
            assert!(monitor.check_timeouts().is_empty());
        }
    }

    #[tokio::test]
    async fn heartbeat_is_answered_and_recorded() {
        let net = MemoryNetwork::new();
        let coord = coordinator(&net, "w1");
        let channel = Arc::new(Recorder::default());
        coord
            .context()
            .connections()
            .insert("w2", PeerClass::Worker, channel.clone());
        let monitor = HeartbeatMonitor::new(coord);

        assert!(monitor.handle("w2", &MeshMessage::Heartbeat { sequence: 7 }));
        assert!(monitor.last_seen("w2").is_some());
        assert!(!monitor.handle("w2", &MeshMessage::StateRequest));

        let frames = channel.frames.lock();
        let reply = Envelope::decode(&frames[0]).unwrap();
        assert_eq!(reply.message, MeshMessage::HeartbeatResponse { sequence: 7 });

        monitor.on_peer_departed("w2");
        assert!(monitor.last_seen("w2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn send_loop_pings_every_interval() {
        let net = MemoryNetwork::new();
        let coord = coordinator(&net, "w1");
        let channel = Arc::new(Recorder::default());
        coord
            .context()
            .connections()
            .insert("w2", PeerClass::Worker, channel.clone());
        let ctx = coord.context().clone();
        let monitor = HeartbeatMonitor::new(coord);

        let handles = monitor.start(ctx.shutdown_signal());
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        ctx.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let frames = channel.frames.lock();
        assert_eq!(frames.len(), 2);
        let second = Envelope::decode(&frames[1]).unwrap();
        assert_eq!(second.message, MeshMessage::Heartbeat { sequence: 2 });
    }
}
