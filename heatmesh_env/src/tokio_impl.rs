//! Production implementation of MeshTransport using Tokio UDP sockets.

use crate::error::EnvError;
use crate::network::MeshTransport;
use crate::types::{ControlPacket, ReportPacket};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Largest report datagram accepted from the mesh.
const MAX_DATAGRAM: usize = 512;

/// UDP transport talking to a mesh's management endpoint.
///
/// Control packets leave through a socket connected to the mesh, reports
/// arrive on a separately bound socket (the mesh is configured to tag its
/// reports back to that address).
pub struct UdpTransport {
    /// Socket connected to the mesh control endpoint
    out_sock: UdpSocket,

    /// Socket receiving telemetry reports
    in_sock: UdpSocket,

    /// Close flag; receivers wake as soon as it flips
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    /// Default port on which reports are received.
    pub const REPORT_PORT: u16 = 50007;

    /// Connects to `mesh_addr` and binds the report socket on `report_bind`.
    pub async fn connect(mesh_addr: SocketAddr, report_bind: SocketAddr) -> Result<Self, EnvError> {
        let out_bind: SocketAddr = if mesh_addr.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|e| EnvError::network(format!("{e}")))?
        } else {
            "[::]:0".parse().map_err(|e| EnvError::network(format!("{e}")))?
        };
        let out_sock = UdpSocket::bind(out_bind)
            .await
            .map_err(|e| EnvError::network(format!("bind control socket: {e}")))?;
        out_sock
            .connect(mesh_addr)
            .await
            .map_err(|e| EnvError::network(format!("connect {mesh_addr}: {e}")))?;

        let in_sock = UdpSocket::bind(report_bind)
            .await
            .map_err(|e| EnvError::network(format!("bind report socket {report_bind}: {e}")))?;

        let (closed, _) = watch::channel(false);

        Ok(Self {
            out_sock,
            in_sock,
            closed,
        })
    }

    /// Address the mesh should send its reports to.
    pub fn report_addr(&self) -> Result<SocketAddr, EnvError> {
        self.in_sock
            .local_addr()
            .map_err(|e| EnvError::network(format!("{e}")))
    }
}

/// Resolves once the close flag is set (or its sender is gone).
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl MeshTransport for UdpTransport {
    async fn send_control(&self, packet: ControlPacket) -> Result<(), EnvError> {
        if self.is_closed() {
            return Err(EnvError::closed("udp transport"));
        }
        self.out_sock
            .send(&packet.to_bytes())
            .await
            .map(|_| ())
            .map_err(|e| EnvError::network(format!("send control: {e}")))
    }

    async fn recv_report(&self) -> Result<Option<ReportPacket>, EnvError> {
        let mut closed_rx = self.closed.subscribe();
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            if *closed_rx.borrow() {
                return Ok(None);
            }

            let len = tokio::select! {
                _ = wait_closed(&mut closed_rx) => return Ok(None),
                res = self.in_sock.recv(&mut buf) => {
                    res.map_err(|e| EnvError::network(format!("receive report: {e}")))?
                }
            };

            match ReportPacket::from_datagram(&buf[..len]) {
                Ok(report) => return Ok(Some(report)),
                Err(e) => {
                    // Header-level garbage never reaches the listener
                    tracing::warn!("Dropping unparseable datagram ({} bytes): {}", len, e);
                }
            }
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeCoord;
    use std::sync::Arc;
    use std::time::Duration;

    async fn loopback_pair() -> (UdpTransport, UdpSocket) {
        let mesh = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let transport = UdpTransport::connect(
            mesh.local_addr().unwrap(),
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        (transport, mesh)
    }

    #[tokio::test]
    async fn test_udp_control_send() {
        let (transport, mesh) = loopback_pair().await;

        transport
            .send_control(ControlPacket::new(42, 0x0032_0000))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let len = mesh.recv(&mut buf).await.unwrap();
        let packet = ControlPacket::from_bytes(&buf[..len]).unwrap();
        assert_eq!(packet.key, 42);
        assert_eq!(packet.value, 0x0032_0000);
    }

    #[tokio::test]
    async fn test_udp_report_receive() {
        let (transport, mesh) = loopback_pair().await;
        let report = ReportPacket::new(NodeCoord::new(1, 2), 1, vec![0, 0, 50, 0]);

        mesh.send_to(&report.to_datagram().unwrap(), transport.report_addr().unwrap())
            .await
            .unwrap();

        let received = transport.recv_report().await.unwrap();
        assert_eq!(received, Some(report));
    }

    #[tokio::test]
    async fn test_udp_close_wakes_receiver() {
        let (transport, _mesh) = loopback_pair().await;
        let transport = Arc::new(transport);

        let rx_side = transport.clone();
        let pending = tokio::spawn(async move { rx_side.recv_report().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.close();

        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("receiver did not wake on close")
            .unwrap();
        assert!(matches!(result, Ok(None)));
        assert!(transport.send_control(ControlPacket::new(1, 1)).await.is_err());
    }
}
