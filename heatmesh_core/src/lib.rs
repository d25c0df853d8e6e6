//! HeatMesh Core - distributed 2-D heat diffusion on a mesh of many-core nodes
//!
//! The deployment pipeline runs once, before any core starts:
//! 1. **Topology**: grid cells mapped onto `(node, core)` pairs, a 4x4 block per node
//! 2. **Nets**: one broadcast net per cell plus four boundary nets rooted at the anchor
//! 3. **Keys**: a unique 31-bit routing key per net (bit 31 is the status bit)
//! 4. **Configs**: seven-word fixed-point config block per core
//!
//! After loading, the [`sync::SyncController`] releases every core through a
//! barrier and the [`telemetry`] loop streams the heatmap back while the
//! operator drives the four edge temperatures.

pub mod config;
pub mod deploy;
pub mod error;
pub mod fixed;
pub mod keys;
pub mod nets;
pub mod routing;
pub mod sync;
pub mod telemetry;
pub mod topology;

#[cfg(feature = "dashboard")]
pub mod dashboard;

// Re-export key types for convenience
pub use config::{serialize_configs, CellConfig, CoreConfig};
pub use deploy::{launch, load, plan, DeploymentConfig, DeploymentPlan};
pub use error::{DecodeError, DeployError};
pub use fixed::Fix16;
pub use keys::{assign_keys, EdgeKeys, KeySpace, NetKeys};
pub use nets::{build_nets, Net, NetId, NetKind, NetList};
pub use routing::Router;
pub use sync::{RunState, SyncConfig, SyncController};
pub use telemetry::{
    clamp_temperature, BoundaryCommand, Heatmap, HeatmapRenderer, HeatmapSnapshot, ListenerStats, LogRenderer, OperatorInput,
    SessionOutcome, SharedHeatmap, TelemetryConfig, TelemetryController, TelemetryListener, TelemetrySession,
};
pub use topology::{map_cells, Cell, CellCoord, Direction, Topology, TopologyConfig};

#[cfg(feature = "dashboard")]
pub use dashboard::{ChannelRenderer, DashboardFrame, HeatmapDashboard};
