//! Error types for the HeatMesh collaborator layer.

use thiserror::Error;

/// Errors raised by the external collaborators (transport, loader, barrier).
#[derive(Debug, Error)]
pub enum EnvError {
    /// Send or receive failed on the underlying socket/channel
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The transport or mesh has been shut down
    #[error("Channel closed: {0}")]
    Closed(String),

    /// A node rejected routing tables, memory writes or the application image
    #[error("Device load failed on node {node}: {reason}")]
    LoadFailed { node: String, reason: String },

    /// Packet encoding/decoding failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The routing collaborator could not build tables
    #[error("Routing error: {0}")]
    RoutingError(String),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a closed-channel error.
    pub fn closed(msg: impl Into<String>) -> Self {
        Self::Closed(msg.into())
    }

    /// Creates a load failure for a node.
    pub fn load_failed(node: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::LoadFailed {
            node: node.to_string(),
            reason: reason.into(),
        }
    }
}
