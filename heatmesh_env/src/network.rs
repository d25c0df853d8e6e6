//! Transport abstraction between the host and the mesh.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{ControlPacket, ReportPacket};

/// Connectionless packet I/O between the host and a running mesh.
///
/// # Implementations
///
/// - **Production**: `UdpTransport` - a pair of UDP sockets
/// - **Simulation**: Channel-based link into the in-process mesh
///
/// # Packet Flow
///
/// ```text
/// Host                        Transport                       Mesh
///   |-- send_control(key, v) --->|                              |
///   |                            |-- multicast(key, v) -------->|
///   |                            |<-- report(node, payload) ----|
///   |<-- recv_report() ----------|                              |
/// ```
#[async_trait]
pub trait MeshTransport: Send + Sync + 'static {
    /// Sends a control packet to the mesh.
    ///
    /// # Returns
    /// * `Ok(())` - Packet handed to the transport (delivery is not confirmed)
    /// * `Err(EnvError)` - Immediate send failure or transport closed
    async fn send_control(&self, packet: ControlPacket) -> Result<(), EnvError>;

    /// Receives the next telemetry report.
    ///
    /// # Returns
    /// * `Ok(Some(report))` - A report was received
    /// * `Ok(None)` - The transport was closed (shutdown, not an error)
    /// * `Err(EnvError)` - The receive primitive failed unexpectedly
    ///
    /// # Blocking
    /// Blocks until a report arrives or the transport closes. Must return
    /// promptly once [`MeshTransport::close`] has been called.
    async fn recv_report(&self) -> Result<Option<ReportPacket>, EnvError>;

    /// Closes the transport. Pending and future receives return `Ok(None)`.
    fn close(&self);

    /// Returns true once [`MeshTransport::close`] has been called.
    fn is_closed(&self) -> bool;
}
