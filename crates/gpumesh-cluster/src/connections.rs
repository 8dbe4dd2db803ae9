//! Connection registry: open channels keyed by peer, split by peer class.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, trace};

use gpumesh_core::{Envelope, MeshMessage, MessageSink, PeerClass, PeerId, TransportError};

use crate::transport::ChannelHandle;

#[derive(Default)]
struct Classes {
    workers: HashMap<PeerId, ChannelHandle>,
    admins: HashMap<PeerId, ChannelHandle>,
    clients: HashMap<PeerId, ChannelHandle>,
}

impl Classes {
    fn class_mut(&mut self, class: PeerClass) -> &mut HashMap<PeerId, ChannelHandle> {
        match class {
            PeerClass::Worker => &mut self.workers,
            PeerClass::Admin => &mut self.admins,
            PeerClass::Client => &mut self.clients,
        }
    }

    fn take(&mut self, peer_id: &str) -> Option<(PeerClass, ChannelHandle)> {
        for class in [PeerClass::Admin, PeerClass::Worker, PeerClass::Client] {
            if let Some(channel) = self.class_mut(class).remove(peer_id) {
                return Some((class, channel));
            }
        }
        None
    }

    fn find(&self, peer_id: &str) -> Option<(PeerClass, &ChannelHandle)> {
        if let Some(c) = self.admins.get(peer_id) {
            return Some((PeerClass::Admin, c));
        }
        if let Some(c) = self.workers.get(peer_id) {
            return Some((PeerClass::Worker, c));
        }
        self.clients.get(peer_id).map(|c| (PeerClass::Client, c))
    }
}

/// Open channels of one node.
///
/// A peer lives in exactly one class sub-registry; inserting it under a
/// new class moves it. Doubles as the node's [`MessageSink`]: frames go
/// straight to the destination when a channel exists, otherwise through
/// the admin, which relays them.
pub struct ConnectionRegistry {
    local_peer_id: PeerId,
    classes: Mutex<Classes>,
}

impl ConnectionRegistry {
    pub fn new(local_peer_id: &str) -> Self {
        Self {
            local_peer_id: local_peer_id.to_string(),
            classes: Mutex::new(Classes::default()),
        }
    }

    /// Register an open channel. Returns the channel it replaced, if any.
    pub fn insert(
        &self,
        peer_id: &str,
        class: PeerClass,
        channel: ChannelHandle,
    ) -> Option<ChannelHandle> {
        let mut classes = self.classes.lock();
        let previous = classes.take(peer_id).map(|(_, c)| c);
        classes.class_mut(class).insert(peer_id.to_string(), channel);
        debug!(%peer_id, %class, "connection registered");
        previous
    }

    pub fn remove(&self, peer_id: &str) -> Option<(PeerClass, ChannelHandle)> {
        self.classes.lock().take(peer_id)
    }

    pub fn channel(&self, peer_id: &str) -> Option<ChannelHandle> {
        self.classes.lock().find(peer_id).map(|(_, c)| c.clone())
    }

    pub fn class_of(&self, peer_id: &str) -> Option<PeerClass> {
        self.classes.lock().find(peer_id).map(|(class, _)| class)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.classes.lock().find(peer_id).is_some()
    }

    /// Every connected peer, sorted.
    pub fn peers(&self) -> Vec<PeerId> {
        let classes = self.classes.lock();
        let mut peers: Vec<PeerId> = classes
            .admins
            .keys()
            .chain(classes.workers.keys())
            .chain(classes.clients.keys())
            .cloned()
            .collect();
        peers.sort();
        peers
    }

    pub fn peers_in(&self, class: PeerClass) -> Vec<PeerId> {
        let mut classes = self.classes.lock();
        let mut peers: Vec<PeerId> = classes.class_mut(class).keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        let classes = self.classes.lock();
        classes.admins.len() + classes.workers.len() + classes.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move the admin marker to `admin`: a previous admin link becomes a
    /// worker link and `admin`'s link (if open) becomes the admin link.
    pub fn retag_admin(&self, admin: Option<&str>) {
        let mut classes = self.classes.lock();
        let stale: Vec<PeerId> = classes
            .admins
            .keys()
            .filter(|id| Some(id.as_str()) != admin)
            .cloned()
            .collect();
        for peer_id in stale {
            if let Some(channel) = classes.admins.remove(&peer_id) {
                classes.workers.insert(peer_id, channel);
            }
        }
        if let Some(admin) = admin {
            if let Some(channel) = classes.workers.remove(admin) {
                classes.admins.insert(admin.to_string(), channel);
            }
        }
    }

    /// Channel to the admin, if this node holds one.
    pub fn admin_channel(&self) -> Option<(PeerId, ChannelHandle)> {
        self.classes
            .lock()
            .admins
            .iter()
            .next()
            .map(|(id, c)| (id.clone(), c.clone()))
    }

    /// Send to every connected peer. Returns how many sends succeeded.
    pub fn broadcast(&self, message: &MeshMessage) -> usize {
        self.peers()
            .iter()
            .filter(|peer_id| self.send_to(peer_id, message.clone()).is_ok())
            .count()
    }

    /// Close and forget every channel.
    pub fn close_all(&self) {
        let drained: Vec<ChannelHandle> = {
            let mut classes = self.classes.lock();
            let mut all = Vec::new();
            all.extend(classes.admins.drain().map(|(_, c)| c));
            all.extend(classes.workers.drain().map(|(_, c)| c));
            all.extend(classes.clients.drain().map(|(_, c)| c));
            all
        };
        for channel in drained {
            channel.close();
        }
    }
}

impl MessageSink for ConnectionRegistry {
    fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    fn send_to(&self, peer_id: &str, message: MeshMessage) -> Result<(), TransportError> {
        let kind = message.kind();
        let frame = Envelope::new(&self.local_peer_id, Some(peer_id), message).encode()?;

        if let Some(channel) = self.channel(peer_id) {
            trace!(%peer_id, kind, "direct send");
            return channel.send(&frame);
        }
        match self.admin_channel() {
            Some((admin, channel)) if admin != peer_id => {
                trace!(%peer_id, via = %admin, kind, "relayed send");
                channel.send(&frame)
            }
            _ => Err(TransportError::NotConnected(peer_id.to_string())),
        }
    }
}
