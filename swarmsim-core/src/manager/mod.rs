//! Population registry and statistics aggregation.
//!
//! The manager is the single source of truth for which nodes exist. Node
//! negotiation never passes through it; it only tracks membership, brokers
//! seed promotion and recomputes swarm statistics after every change.

pub mod handle;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::watch;

pub use handle::ManagerHandle;

use crate::directory::RegistryError;
use crate::events::{EventBus, ManagerEvent, Subscription};
use crate::node::{PeerHandle, TransportError};
use crate::stats::{NodeSample, StatsUpdate, SwarmStatistics};

#[derive(Default)]
struct Population {
    peers: IndexMap<String, Arc<dyn PeerHandle>>,
    seeds: IndexMap<String, Arc<dyn PeerHandle>>,
}

fn same_node(a: &Arc<dyn PeerHandle>, b: &Arc<dyn PeerHandle>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// In-process node manager.
pub struct NodeManager {
    population: Mutex<Population>,
    // Serializes snapshot-and-update so a slower scan never overwrites a newer one.
    recompute: tokio::sync::Mutex<()>,
    stats: watch::Sender<SwarmStatistics>,
    events: EventBus<ManagerEvent>,
}

impl NodeManager {
    /// Creates an empty manager whose subscribers buffer `event_buffer` events.
    pub fn new(event_buffer: usize) -> Self {
        let (stats, _) = watch::channel(SwarmStatistics::new());
        Self {
            population: Mutex::new(Population::default()),
            recompute: tokio::sync::Mutex::new(()),
            stats,
            events: EventBus::new(event_buffer),
        }
    }

    /// Current statistics snapshot.
    pub fn statistics(&self) -> SwarmStatistics {
        self.stats.borrow().clone()
    }

    /// Receiver that observes every statistics recomputation.
    pub fn watch_statistics(&self) -> watch::Receiver<SwarmStatistics> {
        self.stats.subscribe()
    }

    pub fn node_count(&self) -> usize {
        self.population.lock().peers.len()
    }

    pub fn seed_count(&self) -> usize {
        self.population.lock().seeds.len()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.population.lock().peers.keys().cloned().collect()
    }

    pub fn seed_names(&self) -> Vec<String> {
        self.population.lock().seeds.keys().cloned().collect()
    }

    /// Rescans the population and updates statistics.
    async fn update_stats(&self) {
        let _serial = self.recompute.lock().await;

        let (nodes, seed_count) = {
            let population = self.population.lock();
            let nodes: Vec<Arc<dyn PeerHandle>> = population.peers.values().cloned().collect();
            (nodes, population.seeds.len())
        };

        let samples = join_all(nodes.iter().map(|node| sample(node.as_ref()))).await;

        let mut outcome = StatsUpdate::Recomputed;
        self.stats.send_modify(|stats| {
            outcome = stats.update(&samples, seed_count);
        });

        let stats = self.statistics();
        match outcome {
            StatsUpdate::Rebaselined => tracing::info!(
                "Statistics baseline reset: {} seeds, {} peers",
                stats.initial_seed_count,
                stats.initial_peer_count
            ),
            StatsUpdate::Recomputed => tracing::debug!(
                "Statistics updated: {} nodes, mean completion {} ms, complete={}",
                stats.total_node_count,
                stats.mean_time_to_completion_ms,
                stats.is_complete
            ),
        }
    }
}

/// Reads one node for a statistics scan; unreachable nodes count as
/// non-seeds with no elapsed time.
async fn sample(node: &dyn PeerHandle) -> NodeSample {
    let is_seed = match node.is_seed().await {
        Ok(is_seed) => is_seed,
        Err(e) => {
            tracing::warn!("Skipping unreachable node in statistics: {}", e);
            return NodeSample::peer(0);
        }
    };
    let transfer_time_ms = node.transfer_time_ms().await.unwrap_or(0);
    NodeSample {
        is_seed,
        transfer_time_ms,
    }
}

impl Default for NodeManager {
    fn default() -> Self {
        Self::new(crate::config::SimulationConfig::default().event_buffer)
    }
}

#[async_trait]
impl ManagerHandle for NodeManager {
    async fn register_node(&self, node: Arc<dyn PeerHandle>) -> Result<(), RegistryError> {
        let name = node.name().to_string();
        let is_seed = node.is_seed().await?;

        let added = {
            let mut population = self.population.lock();
            match population.peers.get(&name) {
                Some(existing) if same_node(existing, &node) => false,
                Some(_) => return Err(RegistryError::NameTaken { name }),
                None => {
                    population.peers.insert(name.clone(), Arc::clone(&node));
                    if is_seed {
                        population.seeds.insert(name.clone(), Arc::clone(&node));
                    }
                    true
                }
            }
        };

        if added {
            tracing::info!("Registered node {} (seed={})", name, is_seed);
        }
        self.update_stats().await;
        if added {
            self.events.publish(ManagerEvent::NodeAdded { name, node });
        }
        Ok(())
    }

    async fn deregister_node(&self, name: &str) -> Result<(), RegistryError> {
        let removed = {
            let mut population = self.population.lock();
            population.seeds.shift_remove(name);
            population.peers.shift_remove(name).is_some()
        };

        if !removed {
            return Ok(());
        }

        tracing::info!("Deregistered node {}", name);
        self.update_stats().await;
        self.events.publish(ManagerEvent::NodeRemoved {
            name: name.to_string(),
        });
        Ok(())
    }

    async fn add_seed(&self, node: Arc<dyn PeerHandle>) -> Result<(), RegistryError> {
        let name = node.name().to_string();

        let promoted = {
            let mut population = self.population.lock();
            if population.seeds.contains_key(&name) {
                false
            } else {
                population
                    .peers
                    .entry(name.clone())
                    .or_insert_with(|| Arc::clone(&node));
                population.seeds.insert(name.clone(), node);
                true
            }
        };

        if promoted {
            tracing::info!("Node {} promoted to seed", name);
            self.update_stats().await;
        }
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<Arc<dyn PeerHandle>>, TransportError> {
        Ok(self.population.lock().peers.values().cloned().collect())
    }

    async fn seeds(&self) -> Result<Vec<Arc<dyn PeerHandle>>, TransportError> {
        Ok(self.population.lock().seeds.values().cloned().collect())
    }

    async fn subscribe(&self) -> Result<Subscription<ManagerEvent>, TransportError> {
        Ok(self.events.subscribe())
    }

    async fn bandwidth_utilization(&self) -> Result<f64, TransportError> {
        let nodes: Vec<Arc<dyn PeerHandle>> =
            self.population.lock().peers.values().cloned().collect();
        let rates = join_all(nodes.iter().map(|node| node.current_download_rate())).await;
        Ok(rates.into_iter().filter_map(Result::ok).sum())
    }

    async fn stats(&self) -> Result<SwarmStatistics, TransportError> {
        Ok(self.statistics())
    }
}
