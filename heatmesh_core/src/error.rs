//! Error taxonomy for the deployment pipeline.

use heatmesh_env::{EnvError, NodeCoord, Phase};
use thiserror::Error;

/// Fatal errors: any of these aborts the whole deployment.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Key space or per-node core budget exceeded
    #[error("Capacity exceeded: {0}")]
    Capacity(String),

    /// Malformed grid or machine shape
    #[error("Invalid topology: {0}")]
    Topology(String),

    /// Not every core reached a phase in time
    #[error("Synchronisation timeout: {reached}/{expected} cores reached {phase} within {timeout_ms}ms")]
    SyncTimeout {
        phase: Phase,
        reached: usize,
        expected: usize,
        timeout_ms: u64,
    },

    /// Unreadable or inconsistent deployment configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Barrier operations called out of order
    #[error("Barrier protocol violation: {0}")]
    Protocol(String),

    /// One or more nodes failed to load
    #[error("Device load failed on {} node(s): {}", failures.len(), summarize(failures))]
    Load { failures: Vec<(NodeCoord, String)> },

    /// Send/receive failure from a collaborator
    #[error("Transport error: {0}")]
    Transport(#[from] EnvError),
}

fn summarize(failures: &[(NodeCoord, String)]) -> String {
    failures
        .iter()
        .map(|(node, reason)| format!("{node}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DeployError {
    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn topology(msg: impl Into<String>) -> Self {
        Self::Topology(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// A malformed telemetry report. Non-fatal: the report is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("report from unknown node {0}")]
    UnknownNode(NodeCoord),

    #[error("report from {node} has {actual} bytes, expected {expected}")]
    Length {
        node: NodeCoord,
        expected: usize,
        actual: usize,
    },
}
