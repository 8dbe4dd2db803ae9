//! Transport seams: the bootstrap relay, the link factory, and peer channels.
//!
//! The coordinator never talks to a network stack directly. A deployment
//! plugs in a relay client (websocket, HTTP long-poll, ...) and a direct
//! link stack (WebRTC data channels, QUIC, ...) behind these traits; the
//! in-process [`MemoryNetwork`](crate::memory::MemoryNetwork) implements
//! both for tests and simulation.
//!
//! All inbound activity is delivered as [`MeshEvent`]s on one unbounded
//! queue per node, consumed by the coordinator's event loop.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use gpumesh_core::{Envelope, PeerId, TransportError};

/// An open, bidirectional frame channel to one remote peer.
pub trait PeerChannel: Send + Sync {
    /// Enqueue one encoded frame. Never blocks.
    fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Close the channel. The remote side observes a terminal link state.
    fn close(&self);
}

pub type ChannelHandle = Arc<dyn PeerChannel>;

// ── Link state ────────────────────────────────────────────────────

/// Connectivity state of one direct link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Terminal states end the link; the connection entry is dropped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// Links only move forward: {new, checking} → {connected, completed}
    /// → terminal. Self-transitions and anything out of a terminal state
    /// are rejected.
    pub fn can_transition_to(self, next: LinkState) -> bool {
        use LinkState::*;
        match (self, next) {
            (a, b) if a == b => false,
            (Disconnected | Failed | Closed, _) => false,
            (New, _) => true,
            (Checking, New) => false,
            (Checking, _) => true,
            (Connected | Completed, New | Checking) => false,
            (Connected | Completed, _) => true,
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkState::New => "new",
            LinkState::Checking => "checking",
            LinkState::Connected => "connected",
            LinkState::Completed => "completed",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ── Events ────────────────────────────────────────────────────────

/// Emitted by a [`LinkFactory`].
pub enum LinkEvent {
    /// A channel to `peer_id` is ready for frames.
    Open {
        peer_id: PeerId,
        channel: ChannelHandle,
    },
    StateChanged {
        peer_id: PeerId,
        state: LinkState,
    },
    /// A local connectivity candidate to trickle to `peer_id`.
    LocalCandidate { peer_id: PeerId, candidate: String },
}

/// Emitted by a [`BootstrapTransport`].
#[derive(Debug, Clone)]
pub enum BootstrapEvent {
    /// An envelope relayed by the bootstrap server.
    Signal(Envelope),
    /// The relay confirmed `admin` as the room's single admin.
    AdminConfirmed { admin: PeerId },
    /// This node claimed admin but the relay already confirmed another.
    AdminConflict { confirmed_admin: PeerId },
}

/// Everything the coordinator's event loop consumes.
pub enum MeshEvent {
    Link(LinkEvent),
    Bootstrap(BootstrapEvent),
    /// A raw frame received on the direct channel from `from_link`.
    Frame { from_link: PeerId, payload: String },
}

impl fmt::Debug for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::Link(LinkEvent::Open { peer_id, .. }) => {
                write!(f, "Link(Open {{ peer_id: {peer_id} }})")
            }
            MeshEvent::Link(LinkEvent::StateChanged { peer_id, state }) => {
                write!(f, "Link(StateChanged {{ peer_id: {peer_id}, state: {state} }})")
            }
            MeshEvent::Link(LinkEvent::LocalCandidate { peer_id, .. }) => {
                write!(f, "Link(LocalCandidate {{ peer_id: {peer_id} }})")
            }
            MeshEvent::Bootstrap(event) => write!(f, "Bootstrap({event:?})"),
            MeshEvent::Frame { from_link, payload } => {
                write!(f, "Frame {{ from_link: {from_link}, len: {} }}", payload.len())
            }
        }
    }
}

// ── Transports ────────────────────────────────────────────────────

/// Creates direct links to remote peers.
///
/// Negotiation payloads are opaque strings carried in `mesh_offer`,
/// `mesh_answer`, and `mesh_ice_candidate` envelopes. Results (open
/// channels, state changes, local candidates) arrive as [`LinkEvent`]s.
#[async_trait]
pub trait LinkFactory: Send + Sync {
    /// Start a link to `remote`; returns the offer to send it.
    async fn create_offer(&self, remote: &str) -> Result<String, TransportError>;

    /// Accept an offer from `remote`; returns the answer to send back.
    async fn accept_offer(&self, remote: &str, sdp: &str) -> Result<String, TransportError>;

    async fn accept_answer(&self, remote: &str, sdp: &str) -> Result<(), TransportError>;

    async fn add_remote_candidate(&self, remote: &str, candidate: &str)
    -> Result<(), TransportError>;
}

/// Client of the rendezvous relay, bound to one local peer.
#[async_trait]
pub trait BootstrapTransport: Send + Sync {
    /// Join `room_id`'s relay, optionally claiming the admin slot.
    async fn connect(&self, room_id: &str, claim_admin: bool) -> Result<(), TransportError>;

    /// Claim the admin slot on an already-open connection.
    async fn declare_admin(&self) -> Result<(), TransportError>;

    /// Relay an addressed envelope to another member of the room.
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    fn close(&self);

    fn is_connected(&self) -> bool;
}
