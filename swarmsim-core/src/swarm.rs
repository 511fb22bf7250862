//! Swarm factory: creates a manager plus seeds and peers from configuration.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::SwarmConfig;
use crate::directory::Directory;
use crate::manager::{ManagerHandle, NodeManager};
use crate::node::{Node, NodeSpec, node_rng_seed};
use crate::stats::SwarmStatistics;
use crate::Result;

/// Name the manager is bound under in the swarm's directory.
pub const MANAGER_NAME: &str = "NodeManager";

/// One simulated swarm.
pub struct Swarm {
    config: SwarmConfig,
    manager: Arc<NodeManager>,
    directory: Directory<dyn ManagerHandle>,
    nodes: Mutex<Vec<Arc<Node>>>,
    seed_counter: AtomicUsize,
    peer_counter: AtomicUsize,
    ordinal: AtomicU64,
    rng: Mutex<ChaCha8Rng>,
}

impl Swarm {
    /// Creates an empty swarm with its manager bound and ready.
    ///
    /// # Errors
    /// - `SwarmError::Configuration` - The configuration failed validation
    pub fn new(config: SwarmConfig) -> Result<Self> {
        config.validate()?;

        let manager = Arc::new(NodeManager::new(config.simulation.event_buffer));
        let directory: Directory<dyn ManagerHandle> = Directory::new();
        directory.bind(
            MANAGER_NAME,
            Arc::clone(&manager) as Arc<dyn ManagerHandle>,
        )?;

        let rng = match config.simulation.deterministic_seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::seed_from_u64(rand::random()),
        };

        Ok(Self {
            config,
            manager,
            directory,
            nodes: Mutex::new(Vec::new()),
            seed_counter: AtomicUsize::new(0),
            peer_counter: AtomicUsize::new(0),
            ordinal: AtomicU64::new(0),
            rng: Mutex::new(rng),
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<NodeManager> {
        &self.manager
    }

    pub fn directory(&self) -> &Directory<dyn ManagerHandle> {
        &self.directory
    }

    /// Nodes created by this swarm and not yet torn down.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.lock().clone()
    }

    pub fn stats(&self) -> SwarmStatistics {
        self.manager.statistics()
    }

    /// Adds `count` seeds running at the top of both bandwidth ranges.
    ///
    /// # Errors
    /// - `SwarmError::Registry` - A node could not register with the manager
    pub async fn add_seeds(&self, count: usize) -> Result<Vec<Arc<Node>>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let name = format!("seed{}", self.seed_counter.fetch_add(1, Ordering::Relaxed));
            let spec = NodeSpec::seed(
                name,
                self.config.bandwidth.upload_max,
                self.config.bandwidth.download_max,
            );
            created.push(self.spawn(spec).await?);
        }
        Ok(created)
    }

    /// Adds `count` peers with bandwidth drawn uniformly from the configured ranges.
    ///
    /// # Errors
    /// - `SwarmError::Registry` - A node could not register with the manager
    pub async fn add_peers(&self, count: usize) -> Result<Vec<Arc<Node>>> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let name = format!("peer{}", self.peer_counter.fetch_add(1, Ordering::Relaxed));
            let (upload, download) = self.draw_bandwidth();
            created.push(self.spawn(NodeSpec::peer(name, upload, download)).await?);
        }
        Ok(created)
    }

    fn draw_bandwidth(&self) -> (f64, f64) {
        let bandwidth = &self.config.bandwidth;
        let mut rng = self.rng.lock();
        (
            rng.random_range(bandwidth.upload_min..=bandwidth.upload_max),
            rng.random_range(bandwidth.download_min..=bandwidth.download_max),
        )
    }

    async fn spawn(&self, spec: NodeSpec) -> Result<Arc<Node>> {
        let ordinal = self.ordinal.fetch_add(1, Ordering::Relaxed);
        let spec = spec.with_rng_seed(node_rng_seed(
            self.config.simulation.deterministic_seed,
            ordinal,
        ));
        let node = Node::join(spec, &self.config, &self.directory, MANAGER_NAME).await?;
        self.nodes.lock().push(Arc::clone(&node));
        Ok(node)
    }

    /// Waits until every registered node is a seed.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub async fn wait_until_complete(&self, timeout: Duration) -> bool {
        let mut stats = self.manager.watch_statistics();
        let completed = tokio::time::timeout(timeout, stats.wait_for(|stats| stats.is_complete));
        matches!(completed.await, Ok(Ok(_)))
    }

    /// Disposes every node and restarts naming from zero.
    pub async fn reset(&self) {
        let nodes = std::mem::take(&mut *self.nodes.lock());
        tracing::info!("Resetting swarm: disposing {} nodes", nodes.len());
        join_all(nodes.iter().map(|node| node.dispose())).await;

        self.seed_counter.store(0, Ordering::Relaxed);
        self.peer_counter.store(0, Ordering::Relaxed);
    }

    /// Disposes every node and unbinds the manager.
    pub async fn shutdown(self) {
        self.reset().await;
        self.directory.unbind(MANAGER_NAME);
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("nodes", &self.nodes.lock().len())
            .field("stats", &self.stats())
            .finish()
    }
}
