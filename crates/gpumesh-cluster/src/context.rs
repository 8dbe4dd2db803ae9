//! Shared per-node context.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::info;

use gpumesh_core::{MeshConfig, WorkerMetadata};
use gpumesh_registry::RoomRegistry;

use crate::connections::ConnectionRegistry;

/// Everything a node's components share. Built once, passed by `Arc`.
pub struct MeshContext {
    peer_id: String,
    room_id: String,
    metadata: WorkerMetadata,
    config: MeshConfig,
    registry: Arc<RoomRegistry>,
    connections: Arc<ConnectionRegistry>,
    is_admin: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl MeshContext {
    /// Build the context for the worker described by `config`.
    ///
    /// The registry starts with this worker as sole member and admin,
    /// until the relay or a state broadcast says otherwise.
    pub fn new(config: MeshConfig) -> Arc<Self> {
        let peer_id = config.worker.peer_id.clone();
        let room_id = config.worker.room_id.clone();
        let metadata = config.metadata();

        let registry = Arc::new(RoomRegistry::create(&room_id, Some((&peer_id, &metadata))));
        let connections = Arc::new(ConnectionRegistry::new(&peer_id));
        let (shutdown, _) = watch::channel(false);

        info!(%peer_id, %room_id, gpu_memory_mb = metadata.gpu_memory_mb, "mesh context created");

        Arc::new(Self {
            peer_id,
            room_id,
            metadata,
            config,
            registry,
            connections,
            is_admin: AtomicBool::new(true),
            shutdown,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn metadata(&self) -> &WorkerMetadata {
        &self.metadata
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Whether this node currently acts as room admin.
    pub fn is_admin(&self) -> bool {
        self.is_admin.load(Ordering::SeqCst)
    }

    pub fn set_admin_flag(&self, is_admin: bool) {
        self.is_admin.store(is_admin, Ordering::SeqCst);
    }

    /// Current admin per the registry, if it names a present member.
    pub fn admin_peer_id(&self) -> Option<String> {
        self.registry.admin_peer_id()
    }

    /// A receiver that flips to `true` once [`Self::shutdown`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_sole_admin() {
        let ctx = MeshContext::new(MeshConfig::scaffold("w1", "room-a", 8000));
        assert!(ctx.is_admin());
        assert_eq!(ctx.admin_peer_id().as_deref(), Some("w1"));
        assert_eq!(ctx.registry().len(), 1);
        assert!(ctx.connections().is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_fires() {
        let ctx = MeshContext::new(MeshConfig::scaffold("w1", "room-a", 8000));
        let mut rx = ctx.shutdown_signal();
        assert!(!ctx.is_shutting_down());
        ctx.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
