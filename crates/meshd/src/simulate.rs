//! In-process room simulation over [`MemoryNetwork`].
//!
//! Workers start one at a time in election order, so the relay's first
//! claimant is the worker an election over the full room would pick.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::info;

use gpumesh_cluster::{MemoryNetwork, elect_admin};
use gpumesh_core::{MeshConfig, PeerId, WorkerMetadata, WorkerRecord};

use crate::node::WorkerNode;

/// Parse `id=gpu_memory_mb`.
pub fn parse_member(spec: &str) -> anyhow::Result<(PeerId, u64)> {
    let (id, gpu) = spec
        .split_once('=')
        .with_context(|| format!("expected id=gpu_memory_mb, got {spec:?}"))?;
    let id = id.trim();
    if id.is_empty() {
        bail!("empty peer id in {spec:?}");
    }
    let gpu: u64 = gpu
        .trim()
        .parse()
        .with_context(|| format!("invalid gpu memory in {spec:?}"))?;
    Ok((id.to_string(), gpu))
}

/// Pure election over `members`.
pub fn elect(members: &[(PeerId, u64)]) -> Option<PeerId> {
    let records: Vec<WorkerRecord> = members
        .iter()
        .map(|(id, gpu)| WorkerRecord::from_metadata(id, &WorkerMetadata::with_gpu_memory(*gpu), false))
        .collect();
    elect_admin(records.iter())
}

#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub room_id: String,
    pub workers: Vec<(PeerId, u64)>,
    pub kill: Option<PeerId>,
    /// Upper bound on each wait for the room to converge.
    pub settle: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    pub admin: PeerId,
    pub members: Vec<PeerId>,
    /// Admin each survivor agrees on after the kill.
    pub after_kill: Option<PeerId>,
    pub survivors: Vec<PeerId>,
}

/// Poll `check` until it holds or `limit` passes.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Every node names the same admin.
fn agreed_admin(nodes: &BTreeMap<PeerId, WorkerNode>) -> Option<PeerId> {
    let mut admins = nodes.values().map(WorkerNode::admin_peer_id);
    let first = admins.next()??;
    admins.all(|a| a.as_deref() == Some(first.as_str())).then_some(first)
}

fn sim_config(room_id: &str, peer_id: &str, gpu: u64) -> MeshConfig {
    let mut config = MeshConfig::scaffold(peer_id, room_id, gpu);
    config.mesh.batch_pause_ms = 20;
    config.mesh.shutdown_grace_ms = 20;
    config.mesh.admin_verify_timeout_ms = 500;
    config.heartbeat.interval_ms = 200;
    config
}

pub async fn run_simulation(options: SimulationOptions) -> anyhow::Result<SimulationReport> {
    if options.workers.is_empty() {
        bail!("simulation needs at least one worker");
    }
    // Largest GPU first: the first relay claimant is then the worker a
    // full-room election picks. An admin that joined earlier is kept.
    let mut order = options.workers.clone();
    order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let net = MemoryNetwork::new();
    let mut nodes: BTreeMap<PeerId, WorkerNode> = BTreeMap::new();

    for (peer_id, gpu) in &order {
        let node = WorkerNode::on_memory(&net, sim_config(&options.room_id, peer_id, *gpu));
        node.join().await.with_context(|| format!("{peer_id} failed to join"))?;
        nodes.insert(peer_id.clone(), node);

        let expected = nodes.len();
        let converged = wait_until(options.settle, || {
            nodes.values().all(|n| n.snapshot().workers.len() == expected)
        })
        .await;
        if !converged {
            bail!("room did not converge after {peer_id} joined");
        }
        info!(%peer_id, gpu_memory_mb = gpu, members = expected, "worker joined simulation");
    }

    let admin = agreed_admin(&nodes).context("nodes disagree on the admin")?;
    let members: Vec<PeerId> = nodes.keys().cloned().collect();
    info!(%admin, members = members.len(), "room formed");

    let mut after_kill = None;
    if let Some(victim) = &options.kill {
        let node = nodes
            .remove(victim)
            .with_context(|| format!("no worker named {victim}"))?;
        net.isolate(victim);
        node.context().shutdown();
        info!(%victim, "worker killed");

        if !nodes.is_empty() {
            let settled = wait_until(options.settle, || {
                nodes.values().all(|n| !n.snapshot().workers.contains_key(victim.as_str()))
                    && agreed_admin(&nodes).is_some()
            })
            .await;
            if !settled {
                bail!("survivors did not agree on a new admin after {victim} was killed");
            }
            after_kill = agreed_admin(&nodes);
            info!(admin = ?after_kill, "re-election settled");
        }
    }

    let survivors: Vec<PeerId> = nodes.keys().cloned().collect();
    for node in nodes.values() {
        node.shutdown().await;
    }

    Ok(SimulationReport {
        admin,
        members,
        after_kill,
        survivors,
    })
}
