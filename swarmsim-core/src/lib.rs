//! Swarmsim Core - Bandwidth-constrained swarm simulation engine
//!
//! Simulates BitTorrent-style block exchange among seeds and peers: nodes
//! negotiate scarce upload and download capacity, transfer blocks over
//! dilated simulated time, and become seeds once complete. A node manager
//! tracks the population and aggregates completion statistics.

pub mod config;
pub mod directory;
pub mod events;
pub mod manager;
pub mod node;
pub mod stats;
pub mod swarm;
pub mod timing;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::SwarmConfig;
pub use directory::{Directory, RegistryError};
pub use events::{Delivery, EventBus, ManagerEvent, NodeEvent, Subscription};
pub use manager::{ManagerHandle, NodeManager};
pub use node::{BlockGrant, Node, NodeSpec, NodeStatus, PeerHandle, PoolError, TransportError};
pub use stats::SwarmStatistics;
pub use swarm::Swarm;

/// Errors that can bubble up from any swarmsim subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },
}

impl SwarmError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SwarmError::Registry(e) => match e {
                RegistryError::NameTaken { name } => {
                    format!("A node named {name} already exists")
                }
                RegistryError::NotBound { name } => {
                    format!("Nothing is registered under {name}")
                }
                _ => "Registration failed".to_string(),
            },
            SwarmError::Transport(TransportError::Unavailable { name }) => {
                format!("Node {name} is no longer reachable")
            }
            SwarmError::Pool(_) => "Node is shutting down".to_string(),
            SwarmError::Configuration { reason } => format!("Invalid configuration: {reason}"),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(self, SwarmError::Configuration { .. })
    }
}

pub type Result<T> = std::result::Result<T, SwarmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        let taken = SwarmError::from(RegistryError::NameTaken {
            name: "peer0".to_string(),
        });
        assert_eq!(taken.user_message(), "A node named peer0 already exists");
        assert!(!taken.is_user_error());

        let config = SwarmError::Configuration {
            reason: "block size cannot be zero".to_string(),
        };
        assert!(config.is_user_error());
        assert_eq!(
            config.to_string(),
            "Configuration error: block size cannot be zero"
        );
    }
}
