//! HeatMesh deterministic simulation harness
//!
//! This crate provides an in-process mesh machine that implements every
//! collaborator the deployment pipeline talks to, so a full deployment can
//! run without hardware.
//!
//! # Core Principle: One Seed, One Run
//!
//! All sources of non-determinism are controlled:
//! - **Time**: tokio's paused clock advances only when every task is idle
//! - **Machine shape**: degraded nodes come from a ChaCha8 stream
//! - **Faults**: stalled cores, failing loads and short reports are chosen per seed
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ScenarioRunner                         │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ tokio current-thread runtime (paused virtual clock)  │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! │       │                        │                            │
//! │  ┌────▼─────────┐   controls  ┌▼──────────────────────┐     │
//! │  │ Telemetry    │────────────►│ SimMesh               │     │
//! │  │ Session      │◄────────────│  DeviceLoader         │     │
//! │  └──────────────┘   reports   │  SyncPrimitive        │     │
//! │                  SimTransport │  per-core heat kernel │     │
//! │                               └───────────▲───────────┘     │
//! │                                           │ tables          │
//! │                               ┌───────────┴───────────┐     │
//! │                               │ XyRouter              │     │
//! │                               └───────────────────────┘     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use heatmesh_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::SteadyState);
//! assert!(result.passed);
//! ```

mod machine;
mod mesh;
mod network;
mod router;
pub mod scenarios;

pub use machine::MachineGenerator;
pub use mesh::{diffuse, report_phase, CorePhase, MeshConfig, MeshFaults, MeshStats, SimMesh};
pub use network::SimTransport;
pub use router::{link_of, neighbour_node, XyRouter};

// Scenario runner
mod runner;
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};

// Frame export for playback
mod exporter;
pub use exporter::{ExportRenderer, HeatmapFrame, SimExport};
