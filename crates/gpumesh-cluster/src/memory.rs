//! In-process transport: a relay and a link stack sharing one address space.
//!
//! `MemoryNetwork` implements [`BootstrapTransport`] and [`LinkFactory`]
//! for any number of local endpoints. It runs the same negotiation a real
//! stack would (offer, answer, trickled candidates) so the coordinator's
//! signalling and relay paths are exercised end to end, and it supports
//! fault injection: severing one link or isolating a node entirely.
//!
//! ```text
//! MemoryNetwork (Arc<Mutex<NetState>>)
//!   ├── endpoints: peer → event queue
//!   ├── links:     {a, b} pairs with open channels
//!   ├── rooms:     room → confirmed admin (one per room)
//!   └── isolated:  peers cut off from links and relay
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use gpumesh_core::{Envelope, PeerId, TransportError};

use crate::transport::{
    BootstrapEvent, BootstrapTransport, LinkEvent, LinkFactory, LinkState, MeshEvent, PeerChannel,
};

#[derive(Default)]
struct NetState {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<MeshEvent>>,
    /// (offerer, answerer) → outstanding offer.
    offers: HashMap<(PeerId, PeerId), String>,
    /// (offerer, answerer) → answer issued for that offer.
    answers: HashMap<(PeerId, PeerId), String>,
    links: HashSet<(PeerId, PeerId)>,
    /// room → confirmed admin.
    room_admins: HashMap<String, PeerId>,
    /// peer → room it holds a relay connection to.
    relay: HashMap<PeerId, String>,
    isolated: HashSet<PeerId>,
    next_nonce: u64,
}

impl NetState {
    fn emit(&self, peer_id: &str, event: MeshEvent) -> bool {
        match self.endpoints.get(peer_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn nonce(&mut self) -> u64 {
        self.next_nonce += 1;
        self.next_nonce
    }

    fn cut_off(&self, a: &str, b: &str) -> bool {
        self.isolated.contains(a) || self.isolated.contains(b)
    }

    /// Drop the a↔b link and tell both ends.
    fn drop_link(&mut self, a: &str, b: &str, state: LinkState) -> bool {
        if !self.links.remove(&link_key(a, b)) {
            return false;
        }
        for (local, remote) in [(a, b), (b, a)] {
            self.emit(
                local,
                MeshEvent::Link(LinkEvent::StateChanged {
                    peer_id: remote.to_string(),
                    state,
                }),
            );
        }
        true
    }

    fn relay_members(&self, room_id: &str) -> Vec<PeerId> {
        self.relay
            .iter()
            .filter(|(_, room)| room.as_str() == room_id)
            .map(|(peer, _)| peer.clone())
            .collect()
    }

    /// Apply an admin claim from `peer_id` and notify whoever needs to know.
    fn claim_admin(&mut self, room_id: &str, peer_id: &str) {
        match self.room_admins.get(room_id).cloned() {
            Some(admin) if admin != peer_id => {
                debug!(%room_id, %peer_id, %admin, "relay rejected admin claim");
                self.emit(
                    peer_id,
                    MeshEvent::Bootstrap(BootstrapEvent::AdminConflict {
                        confirmed_admin: admin,
                    }),
                );
            }
            _ => {
                self.room_admins
                    .insert(room_id.to_string(), peer_id.to_string());
                debug!(%room_id, %peer_id, "relay confirmed admin");
                for member in self.relay_members(room_id) {
                    self.emit(
                        &member,
                        MeshEvent::Bootstrap(BootstrapEvent::AdminConfirmed {
                            admin: peer_id.to_string(),
                        }),
                    );
                }
            }
        }
    }

    fn leave_relay(&mut self, peer_id: &str) {
        if let Some(room_id) = self.relay.remove(peer_id) {
            if self.room_admins.get(&room_id).map(String::as_str) == Some(peer_id) {
                self.room_admins.remove(&room_id);
                debug!(%room_id, %peer_id, "relay admin slot released");
            }
        }
    }
}

fn link_key(a: &str, b: &str) -> (PeerId, PeerId) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn negotiation_error(peer: &str, reason: &str) -> TransportError {
    TransportError::Negotiation {
        peer: peer.to_string(),
        reason: reason.to_string(),
    }
}

/// A shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

/// One node's attachment to a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    pub links: Arc<MemoryLinks>,
    pub bootstrap: Arc<MemoryBootstrap>,
    pub events: mpsc::UnboundedReceiver<MeshEvent>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `peer_id`. Re-attaching replaces the previous event queue.
    pub fn endpoint(&self, peer_id: &str) -> MemoryEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().endpoints.insert(peer_id.to_string(), tx);
        MemoryEndpoint {
            links: Arc::new(MemoryLinks {
                local: peer_id.to_string(),
                state: self.state.clone(),
            }),
            bootstrap: Arc::new(MemoryBootstrap {
                local: peer_id.to_string(),
                state: self.state.clone(),
            }),
            events: rx,
        }
    }

    /// Drop the a↔b link; both ends see `disconnected`.
    pub fn sever(&self, a: &str, b: &str) -> bool {
        self.state.lock().drop_link(a, b, LinkState::Disconnected)
    }

    /// Cut `peer_id` off from every link and from the relay.
    pub fn isolate(&self, peer_id: &str) {
        let mut state = self.state.lock();
        state.isolated.insert(peer_id.to_string());
        let linked: Vec<(PeerId, PeerId)> = state
            .links
            .iter()
            .filter(|(a, b)| a == peer_id || b == peer_id)
            .cloned()
            .collect();
        for (a, b) in linked {
            state.drop_link(&a, &b, LinkState::Disconnected);
        }
        state.leave_relay(peer_id);
        debug!(%peer_id, "peer isolated");
    }

    /// Allow `peer_id` to negotiate again. Dropped links stay dropped.
    pub fn heal(&self, peer_id: &str) {
        self.state.lock().isolated.remove(peer_id);
    }

    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// The admin the relay has confirmed for `room_id`.
    pub fn relay_admin(&self, room_id: &str) -> Option<PeerId> {
        self.state.lock().room_admins.get(room_id).cloned()
    }
}

// ── Channels ──────────────────────────────────────────────────────

struct MemoryChannel {
    local: PeerId,
    remote: PeerId,
    state: Arc<Mutex<NetState>>,
}

impl PeerChannel for MemoryChannel {
    fn send(&self, frame: &str) -> Result<(), TransportError> {
        let state = self.state.lock();
        if !state.links.contains(&link_key(&self.local, &self.remote)) {
            return Err(TransportError::Closed(self.remote.clone()));
        }
        let delivered = state.emit(
            &self.remote,
            MeshEvent::Frame {
                from_link: self.local.clone(),
                payload: frame.to_string(),
            },
        );
        if delivered {
            Ok(())
        } else {
            Err(TransportError::Closed(self.remote.clone()))
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.links.remove(&link_key(&self.local, &self.remote)) {
            state.emit(
                &self.remote,
                MeshEvent::Link(LinkEvent::StateChanged {
                    peer_id: self.local.clone(),
                    state: LinkState::Closed,
                }),
            );
        }
    }
}

// ── Link factory ──────────────────────────────────────────────────

/// [`LinkFactory`] half of a [`MemoryEndpoint`].
pub struct MemoryLinks {
    local: PeerId,
    state: Arc<Mutex<NetState>>,
}

#[async_trait]
impl LinkFactory for MemoryLinks {
    async fn create_offer(&self, remote: &str) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        if state.cut_off(&self.local, remote) {
            return Err(negotiation_error(remote, "peer unreachable"));
        }
        let nonce = state.nonce();
        let sdp = format!("offer:{}->{remote}:{nonce}", self.local);
        state
            .offers
            .insert((self.local.clone(), remote.to_string()), sdp.clone());

        state.emit(
            &self.local,
            MeshEvent::Link(LinkEvent::StateChanged {
                peer_id: remote.to_string(),
                state: LinkState::Checking,
            }),
        );
        state.emit(
            &self.local,
            MeshEvent::Link(LinkEvent::LocalCandidate {
                peer_id: remote.to_string(),
                candidate: format!("candidate:{}:{nonce}", self.local),
            }),
        );
        Ok(sdp)
    }

    async fn accept_offer(&self, remote: &str, sdp: &str) -> Result<String, TransportError> {
        let mut state = self.state.lock();
        if !sdp.starts_with(&format!("offer:{remote}->{}:", self.local)) {
            return Err(negotiation_error(remote, "offer not addressed to this peer"));
        }
        if state.cut_off(&self.local, remote) {
            return Err(negotiation_error(remote, "peer unreachable"));
        }
        let nonce = state.nonce();
        let answer = format!("answer:{}->{remote}:{nonce}", self.local);
        state
            .answers
            .insert((remote.to_string(), self.local.clone()), answer.clone());

        state.emit(
            &self.local,
            MeshEvent::Link(LinkEvent::LocalCandidate {
                peer_id: remote.to_string(),
                candidate: format!("candidate:{}:{nonce}", self.local),
            }),
        );
        Ok(answer)
    }

    async fn accept_answer(&self, remote: &str, sdp: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let key = (self.local.clone(), remote.to_string());
        if state.offers.remove(&key).is_none() {
            return Err(negotiation_error(remote, "no outstanding offer"));
        }
        if state.answers.remove(&key).as_deref() != Some(sdp) {
            return Err(negotiation_error(remote, "answer does not match offer"));
        }
        if state.cut_off(&self.local, remote) {
            return Err(negotiation_error(remote, "peer unreachable"));
        }

        state.links.insert(link_key(&self.local, remote));
        for (local, peer) in [(self.local.as_str(), remote), (remote, self.local.as_str())] {
            let channel = Arc::new(MemoryChannel {
                local: local.to_string(),
                remote: peer.to_string(),
                state: self.state.clone(),
            });
            state.emit(
                local,
                MeshEvent::Link(LinkEvent::Open {
                    peer_id: peer.to_string(),
                    channel,
                }),
            );
        }
        debug!(local = %self.local, %remote, "memory link open");
        Ok(())
    }

    async fn add_remote_candidate(
        &self,
        remote: &str,
        candidate: &str,
    ) -> Result<(), TransportError> {
        if candidate.starts_with(&format!("candidate:{remote}:")) {
            Ok(())
        } else {
            Err(negotiation_error(remote, "candidate from unexpected peer"))
        }
    }
}

// ── Bootstrap relay ───────────────────────────────────────────────

/// [`BootstrapTransport`] half of a [`MemoryEndpoint`].
///
/// The relay confirms exactly one admin per room: the first claimant
/// while the slot is free. Later claimants are told who holds it.
pub struct MemoryBootstrap {
    local: PeerId,
    state: Arc<Mutex<NetState>>,
}

#[async_trait]
impl BootstrapTransport for MemoryBootstrap {
    async fn connect(&self, room_id: &str, claim_admin: bool) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.isolated.contains(&self.local) {
            return Err(TransportError::BootstrapOffline);
        }
        state.relay.insert(self.local.clone(), room_id.to_string());
        debug!(peer_id = %self.local, %room_id, claim_admin, "relay connected");

        if claim_admin {
            state.claim_admin(room_id, &self.local);
        } else if let Some(admin) = state.room_admins.get(room_id).cloned() {
            state.emit(
                &self.local,
                MeshEvent::Bootstrap(BootstrapEvent::AdminConfirmed { admin }),
            );
        }
        Ok(())
    }

    async fn declare_admin(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let room_id = state
            .relay
            .get(&self.local)
            .cloned()
            .ok_or(TransportError::BootstrapOffline)?;
        state.claim_admin(&room_id, &self.local);
        Ok(())
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let state = self.state.lock();
        let room_id = state
            .relay
            .get(&self.local)
            .ok_or(TransportError::BootstrapOffline)?;
        let to = envelope
            .to_peer_id
            .as_deref()
            .ok_or_else(|| TransportError::UnknownPeer(String::new()))?;

        let reachable = state.relay.get(to) == Some(room_id) && !state.isolated.contains(to);
        if !reachable
            || !state.emit(to, MeshEvent::Bootstrap(BootstrapEvent::Signal(envelope.clone())))
        {
            return Err(TransportError::UnknownPeer(to.to_string()));
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().leave_relay(&self.local);
    }

    fn is_connected(&self) -> bool {
        self.state.lock().relay.contains_key(&self.local)
    }
}

#[cfg(test)]
mod tests {
    use gpumesh_core::MeshMessage;

    use super::*;

    async fn next_open(
        events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    ) -> (PeerId, Arc<dyn PeerChannel>) {
        loop {
            match events.recv().await {
                Some(MeshEvent::Link(LinkEvent::Open { peer_id, channel })) => {
                    return (peer_id, channel);
                }
                Some(_) => continue,
                None => panic!("event queue closed"),
            }
        }
    }

    async fn linked_pair(net: &MemoryNetwork) -> (MemoryEndpoint, MemoryEndpoint) {
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        let offer = a.links.create_offer("b").await.unwrap();
        let answer = b.links.accept_offer("a", &offer).await.unwrap();
        a.links.accept_answer("b", &answer).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn offer_answer_opens_both_ends() {
        let net = MemoryNetwork::new();
        let (mut a, mut b) = linked_pair(&net).await;

        let (peer_a, chan_a) = next_open(&mut a.events).await;
        let (peer_b, _chan_b) = next_open(&mut b.events).await;
        assert_eq!(peer_a, "b");
        assert_eq!(peer_b, "a");
        assert!(net.is_linked("a", "b"));

        chan_a.send("hello").unwrap();
        loop {
            if let Some(MeshEvent::Frame { from_link, payload }) = b.events.recv().await {
                assert_eq!(from_link, "a");
                assert_eq!(payload, "hello");
                break;
            }
        }
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let _b = net.endpoint("b");
        assert!(a.links.accept_answer("b", "answer:b->a:1").await.is_err());
        assert!(a.links.accept_offer("b", "offer:c->a:1").await.is_err());
        assert!(a.links.add_remote_candidate("b", "candidate:c:1").await.is_err());
    }

    #[tokio::test]
    async fn sever_reports_disconnected_and_closes_channel() {
        let net = MemoryNetwork::new();
        let (mut a, _b) = linked_pair(&net).await;
        let (_, chan) = next_open(&mut a.events).await;

        assert!(net.sever("a", "b"));
        assert!(chan.send("late").is_err());
        loop {
            if let Some(MeshEvent::Link(LinkEvent::StateChanged { peer_id, state })) =
                a.events.recv().await
            {
                assert_eq!(peer_id, "b");
                assert_eq!(state, LinkState::Disconnected);
                break;
            }
        }
    }

    #[tokio::test]
    async fn relay_confirms_one_admin_per_room() {
        let net = MemoryNetwork::new();
        let mut a = net.endpoint("a");
        let mut b = net.endpoint("b");

        a.bootstrap.connect("room", true).await.unwrap();
        b.bootstrap.connect("room", true).await.unwrap();

        assert!(matches!(
            a.events.recv().await,
            Some(MeshEvent::Bootstrap(BootstrapEvent::AdminConfirmed { admin })) if admin == "a"
        ));
        assert!(matches!(
            b.events.recv().await,
            Some(MeshEvent::Bootstrap(BootstrapEvent::AdminConflict { confirmed_admin }))
                if confirmed_admin == "a"
        ));
        assert_eq!(net.relay_admin("room").as_deref(), Some("a"));

        a.bootstrap.close();
        assert!(net.relay_admin("room").is_none());
    }

    #[tokio::test]
    async fn relay_signals_only_reach_room_members() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let mut b = net.endpoint("b");
        let _c = net.endpoint("c");

        a.bootstrap.connect("room", false).await.unwrap();
        b.bootstrap.connect("room", false).await.unwrap();

        let env = Envelope::new("a", Some("b"), MeshMessage::StateRequest);
        a.bootstrap.send(&env).unwrap();
        assert!(matches!(
            b.events.recv().await,
            Some(MeshEvent::Bootstrap(BootstrapEvent::Signal(e))) if e == env
        ));

        let to_c = Envelope::new("a", Some("c"), MeshMessage::StateRequest);
        assert!(matches!(
            a.bootstrap.send(&to_c),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn isolated_peer_cannot_negotiate_or_relay() {
        let net = MemoryNetwork::new();
        let a = net.endpoint("a");
        let _b = net.endpoint("b");
        a.bootstrap.connect("room", true).await.unwrap();

        net.isolate("a");
        assert!(net.relay_admin("room").is_none());
        assert!(!a.bootstrap.is_connected());
        assert!(a.links.create_offer("b").await.is_err());
        assert!(matches!(
            a.bootstrap.connect("room", false).await,
            Err(TransportError::BootstrapOffline)
        ));

        net.heal("a");
        assert!(a.links.create_offer("b").await.is_ok());
    }
}
