//! Device-load and barrier collaborators.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{ApplicationMap, NodeCoord, Phase, RoutingTables};
use std::collections::BTreeMap;

/// Outcome of loading something onto every node of a machine.
pub type NodeResults = BTreeMap<NodeCoord, Result<(), EnvError>>;

/// Loads routing tables, node memory and application images.
///
/// Every method reports per node; the caller decides whether a single failure
/// is fatal (for a deployment it always is).
#[async_trait]
pub trait DeviceLoader: Send + Sync + 'static {
    /// Installs the routing tables on their nodes.
    async fn load_routing_tables(&self, tables: &RoutingTables) -> NodeResults;

    /// Reserves a zeroed node-local buffer shared by the cores of a node.
    async fn alloc_shared(&self, node: NodeCoord, size: usize) -> Result<(), EnvError>;

    /// Writes a configuration block into the memory reserved for one core.
    async fn write_core_memory(&self, node: NodeCoord, core: u8, data: &[u8]) -> Result<(), EnvError>;

    /// Loads the application image onto the given cores and starts them.
    async fn load_application(&self, image: &str, cores: &ApplicationMap) -> NodeResults;
}

/// Barrier primitive provided by the machine's management layer.
#[async_trait]
pub trait SyncPrimitive: Send + Sync + 'static {
    /// Blocks until at least `expected` cores have reached `phase`.
    ///
    /// Returns the number of cores observed in the phase.
    async fn wait_for_phase(&self, phase: Phase, expected: usize) -> Result<usize, EnvError>;

    /// Returns how many cores are currently in `phase` (non-blocking).
    fn count_in_phase(&self, phase: Phase) -> usize;

    /// Releases every core waiting in `phase` (non-blocking).
    fn broadcast_signal(&self, phase: Phase) -> Result<(), EnvError>;
}
