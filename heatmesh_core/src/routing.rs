//! Routing collaborator interface.
//!
//! The core never looks inside the tables a router produces; it hands them
//! straight to the device loader.

use crate::keys::NetKeys;
use crate::nets::NetList;
use crate::topology::Topology;
use heatmesh_env::{EnvError, Machine, RoutingTables};

/// Turns logical nets into per-node forwarding tables.
///
/// Implementations must be pure: identical inputs yield identical tables.
pub trait Router: Send + Sync {
    fn route(
        &self,
        nets: &NetList,
        keys: &NetKeys,
        machine: &Machine,
        placements: &Topology,
    ) -> Result<RoutingTables, EnvError>;
}
