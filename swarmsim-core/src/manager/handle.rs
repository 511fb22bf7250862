//! Capability surface of the node manager.

use std::sync::Arc;

use async_trait::async_trait;

use crate::directory::RegistryError;
use crate::events::{ManagerEvent, Subscription};
use crate::node::{PeerHandle, TransportError};
use crate::stats::SwarmStatistics;

/// Operations nodes and drivers use to reach the population registry.
#[async_trait]
pub trait ManagerHandle: Send + Sync {
    /// Adds a node to the population.
    ///
    /// # Errors
    /// - `RegistryError::NameTaken` - A different node is registered under the same name
    async fn register_node(&self, node: Arc<dyn PeerHandle>) -> Result<(), RegistryError>;

    /// Removes a node from the population. Unknown names are ignored.
    async fn deregister_node(&self, name: &str) -> Result<(), RegistryError>;

    /// Promotes a node to the seed set. Repeated promotion is a no-op.
    async fn add_seed(&self, node: Arc<dyn PeerHandle>) -> Result<(), RegistryError>;

    /// Every registered node in registration order.
    async fn nodes(&self) -> Result<Vec<Arc<dyn PeerHandle>>, TransportError>;

    /// Registered nodes that hold the complete file.
    async fn seeds(&self) -> Result<Vec<Arc<dyn PeerHandle>>, TransportError>;

    async fn subscribe(&self) -> Result<Subscription<ManagerEvent>, TransportError>;

    /// Sum of current download rates across the population.
    async fn bandwidth_utilization(&self) -> Result<f64, TransportError>;

    async fn stats(&self) -> Result<SwarmStatistics, TransportError>;
}
