//! Simulated host link into a [`SimMesh`].

use crate::mesh::SimMesh;
use async_trait::async_trait;
use heatmesh_env::{ControlPacket, EnvError, MeshTransport, ReportPacket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Channel-backed transport between the host and an emulated mesh.
pub struct SimTransport {
    mesh: SimMesh,

    /// Report stream from the mesh (behind tokio mutex for async)
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ReportPacket>>>,

    closed: watch::Sender<bool>,

    /// Control packets accepted
    sent: AtomicU64,
}

impl SimTransport {
    /// Connects to a mesh. Each mesh accepts a single host link.
    pub fn connect(mesh: &SimMesh) -> Result<Self, EnvError> {
        let rx = mesh
            .take_reports()
            .ok_or_else(|| EnvError::network("mesh already has a host link"))?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            mesh: mesh.clone(),
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            closed,
            sent: AtomicU64::new(0),
        })
    }

    /// Number of control packets handed to the mesh.
    pub fn controls_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MeshTransport for SimTransport {
    async fn send_control(&self, packet: ControlPacket) -> Result<(), EnvError> {
        if self.is_closed() {
            return Err(EnvError::closed("sim transport"));
        }
        self.mesh.inject_control(packet)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn recv_report(&self) -> Result<Option<ReportPacket>, EnvError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            report = rx.recv() => Ok(report),
            _ = closed.changed() => Ok(None),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
