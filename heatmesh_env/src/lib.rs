//! HeatMesh Collaborator Abstraction Layer
//!
//! This crate defines the black boxes the HeatMesh pipeline talks to, so the
//! same deployment code runs against a **Production** mesh (UDP + management
//! layer) or the in-process **Simulation** mesh.
//!
//! # Collaborators
//!
//! - Transport (`send_control()`, `recv_report()`, `close()`)
//! - Device load (routing tables, node memory, application image)
//! - Barrier primitive (`wait_for_phase()`, `broadcast_signal()`)
//!
//! # Example
//!
//! ```ignore
//! use heatmesh_env::{MeshTransport, ControlPacket};
//!
//! async fn listen<T: MeshTransport>(transport: &T) {
//!     while let Ok(Some(report)) = transport.recv_report().await {
//!         handle_report(report);
//!     }
//! }
//! ```

mod device;
mod network;
mod types;
mod error;
mod tokio_impl;

pub use device::{DeviceLoader, NodeResults, SyncPrimitive};
pub use network::MeshTransport;
pub use types::{
    ApplicationMap, ControlPacket, CoreLocation, Machine, NodeCoord, Phase, ReportPacket,
    RoutingEntry, RoutingTables, KEY_MASK, STATUS_BIT,
};
pub use error::EnvError;
pub use tokio_impl::UdpTransport;
