//! Capability surface a node exposes to its peers and observers.

use async_trait::async_trait;
use serde::Serialize;

use crate::events::{NodeEvent, Subscription};

/// Failure reaching a remote object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Remote object unavailable: {name}")]
    Unavailable { name: String },
}

/// Outcome of a block request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockGrant {
    /// Responder does not hold the block at full completion
    NotHeld,
    /// Responder holds the block but has no bandwidth to lend right now
    Refused,
    /// Bandwidth reserved for the transfer, in bytes per second
    Granted(f64),
}

impl BlockGrant {
    /// Numeric encoding: `-1` not held, `0` refused, positive bandwidth granted.
    pub fn as_wire(self) -> f64 {
        match self {
            BlockGrant::NotHeld => -1.0,
            BlockGrant::Refused => 0.0,
            BlockGrant::Granted(bandwidth) => bandwidth,
        }
    }

    pub fn bandwidth(self) -> Option<f64> {
        match self {
            BlockGrant::Granted(bandwidth) => Some(bandwidth),
            _ => None,
        }
    }
}

/// Point-in-time view of a node for dashboards and reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub is_seed: bool,
    pub block_size: u64,
    pub block_count: u32,
    pub max_upload_rate: f64,
    pub max_download_rate: f64,
    pub current_upload_rate: f64,
    pub current_download_rate: f64,
    pub available_upload_rate: f64,
    pub available_download_rate: f64,
    /// Open reservations this node lends to peers
    pub upload_count: usize,
    /// Open reservations this node borrows from peers
    pub download_count: usize,
    pub progress: f64,
    pub transfer_time_ms: u64,
    pub estimated_time_ms: Option<u64>,
    /// Completion value per block, `-1` for missing
    pub blocks: Vec<f64>,
}

/// Remote-facing operations of a node.
///
/// Every call may fail with `TransportError::Unavailable` once the node is
/// gone; callers treat that as the peer having left.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Node identity. Always answerable, even after disposal.
    fn name(&self) -> &str;

    /// Asks the node to lend upload bandwidth for one block.
    async fn request_block(
        &self,
        requester: &str,
        index: u32,
        max_download: f64,
    ) -> Result<BlockGrant, TransportError>;

    /// Returns the bandwidth lent for (requester, index). No-op when nothing
    /// is outstanding.
    async fn finalize_block(&self, requester: &str, index: u32) -> Result<(), TransportError>;

    async fn is_seed(&self) -> Result<bool, TransportError>;

    /// Simulated milliseconds spent downloading; zero for created seeds.
    async fn transfer_time_ms(&self) -> Result<u64, TransportError>;

    async fn current_download_rate(&self) -> Result<f64, TransportError>;

    async fn status(&self) -> Result<NodeStatus, TransportError>;

    /// Subscribes to progress events.
    async fn subscribe(&self) -> Result<Subscription<NodeEvent>, TransportError>;

    /// Stops the node and removes it from its swarm.
    async fn dispose(&self) -> Result<(), TransportError>;
}
