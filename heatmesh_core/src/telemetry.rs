//! Telemetry/Control Loop - live heatmap and boundary injection.
//!
//! Two tasks share one [`Heatmap`] behind a mutex:
//!
//! ```text
//!              +-------------------+   decode (no lock)   +-----------+
//!  transport ->| TelemetryListener |---- lock: write+dirty --->|           |
//!              +-------------------+                       |  Heatmap  |
//!              +--------------------+  lock: copy+clear    |           |
//!  operator -->| TelemetryController|<------------------------|           |
//!              +--------------------+   render (no lock)   +-----------+
//!                       |
//!                       +-- BoundaryCommand --> transport
//! ```
//!
//! Closing the transport stops both tasks.

use crate::error::{DecodeError, DeployError};
use crate::fixed::{decode_vector, Fix16};
use crate::keys::EdgeKeys;
use crate::topology::{CellCoord, Direction, Topology};
use heatmesh_env::{ControlPacket, EnvError, MeshTransport, NodeCoord, ReportPacket};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Operator console settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Temperature shown before the first report and pushed to every edge
    pub initial_temperature: f64,

    /// Upper bound for operator-set boundary temperatures
    pub max_temperature: f64,

    /// Render ticks per second
    pub update_fps: u32,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            initial_temperature: 50.0,
            max_temperature: 100.0,
            update_fps: 20,
        }
    }
}

impl TelemetryConfig {
    /// Render period, never shorter than one millisecond.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis((1000 / self.update_fps.max(1) as u64).max(1))
    }

    /// Clamps a requested boundary temperature to `[0, max_temperature]`.
    pub fn clamp(&self, value: f64) -> f64 {
        clamp_temperature(value, self.max_temperature)
    }

    /// Rejects temperature bounds the console cannot work with.
    pub fn validate(&self) -> Result<(), DeployError> {
        if !self.max_temperature.is_finite() || self.max_temperature < 0.0 {
            return Err(DeployError::config(format!(
                "max_temperature must be finite and non-negative, got {}",
                self.max_temperature
            )));
        }
        if !self.initial_temperature.is_finite() {
            return Err(DeployError::config(format!(
                "initial_temperature must be finite, got {}",
                self.initial_temperature
            )));
        }
        Ok(())
    }
}

/// Clamps `value` into `[0, max]`. NaN maps to 0 and a negative or NaN
/// `max` is treated as 0.
pub fn clamp_temperature(value: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.max(0.0).min(max.max(0.0))
}

// =============================================================================
// HEATMAP STATE
// =============================================================================

/// Current temperature estimate of every grid cell.
///
/// Cells not hosted by any core hold `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Heatmap {
    width: u32,
    height: u32,
    values: Vec<Option<f64>>,
    dirty: bool,
}

/// Heatmap shared between the listener and the controller.
pub type SharedHeatmap = Arc<Mutex<Heatmap>>;

/// Locks a shared heatmap, recovering from a poisoned lock.
pub fn lock_heatmap(heatmap: &SharedHeatmap) -> MutexGuard<'_, Heatmap> {
    heatmap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Heatmap {
    /// Creates a heatmap with every hosted cell at `initial`.
    pub fn new(topology: &Topology, initial: f64) -> Self {
        let (width, height) = (topology.width(), topology.height());
        let mut values = vec![None; width as usize * height as usize];
        for cell in topology.cells() {
            if let Some(i) = Self::index_in(width, height, cell.coord) {
                values[i] = Some(initial);
            }
        }
        Self {
            width,
            height,
            values,
            dirty: true,
        }
    }

    pub fn shared(self) -> SharedHeatmap {
        Arc::new(Mutex::new(self))
    }

    fn index_in(width: u32, height: u32, coord: CellCoord) -> Option<usize> {
        (coord.x < width && coord.y < height).then(|| (coord.y * width + coord.x) as usize)
    }

    pub fn get(&self, coord: CellCoord) -> Option<f64> {
        Self::index_in(self.width, self.height, coord).and_then(|i| self.values[i])
    }

    /// Writes one value; returns false for an unhosted or out-of-range cell.
    pub fn set(&mut self, coord: CellCoord, value: f64) -> bool {
        match Self::index_in(self.width, self.height, coord) {
            Some(i) if self.values[i].is_some() => {
                self.values[i] = Some(value);
                true
            }
            _ => false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Copies the values and clears the dirty flag, if it was set.
    pub fn take_if_dirty(&mut self) -> Option<HeatmapSnapshot> {
        if !self.dirty {
            return None;
        }
        self.dirty = false;
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> HeatmapSnapshot {
        HeatmapSnapshot {
            width: self.width,
            height: self.height,
            values: self.values.clone(),
        }
    }
}

/// Immutable copy of the heatmap taken under the lock, rendered outside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeatmapSnapshot {
    pub width: u32,
    pub height: u32,

    /// Row-major, `y * width + x`
    pub values: Vec<Option<f64>>,
}

impl HeatmapSnapshot {
    pub fn get(&self, x: u32, y: u32) -> Option<f64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.values[(y * self.width + x) as usize]
    }

    /// Hosted values only.
    pub fn hosted(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().flatten().copied()
    }

    pub fn min(&self) -> Option<f64> {
        self.hosted().reduce(f64::min)
    }

    pub fn max(&self) -> Option<f64> {
        self.hosted().reduce(f64::max)
    }

    pub fn mean(&self) -> Option<f64> {
        let (sum, n) = self.hosted().fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }
}

// =============================================================================
// LISTENER
// =============================================================================

/// Counters kept by the listener.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerStats {
    pub applied: u64,
    pub discarded: u64,
}

/// Decodes node reports into the shared heatmap.
pub struct TelemetryListener<T: MeshTransport> {
    transport: Arc<T>,
    heatmap: SharedHeatmap,

    /// Cells hosted by each node, ascending core order
    node_cells: BTreeMap<NodeCoord, Vec<CellCoord>>,

    stats: ListenerStats,
}

impl<T: MeshTransport> TelemetryListener<T> {
    pub fn new(transport: Arc<T>, heatmap: SharedHeatmap, topology: &Topology) -> Self {
        let node_cells = topology
            .nodes()
            .map(|(node, cells)| (node, cells.to_vec()))
            .collect();
        Self {
            transport,
            heatmap,
            node_cells,
            stats: ListenerStats::default(),
        }
    }

    /// Applies one report atomically: every cell of the node or none.
    ///
    /// Returns the number of cells updated.
    pub fn apply_report(&self, report: &ReportPacket) -> Result<usize, DecodeError> {
        let cells = self
            .node_cells
            .get(&report.source)
            .ok_or(DecodeError::UnknownNode(report.source))?;

        let expected = cells.len() * 4;
        let values = decode_vector(&report.payload)
            .filter(|v| v.len() == cells.len())
            .ok_or(DecodeError::Length {
                node: report.source,
                expected,
                actual: report.payload.len(),
            })?;

        let mut heatmap = lock_heatmap(&self.heatmap);
        for (coord, value) in cells.iter().zip(&values) {
            heatmap.set(*coord, *value);
        }
        heatmap.mark_dirty();
        Ok(values.len())
    }

    /// Receives reports until the transport closes.
    ///
    /// Malformed reports are logged and discarded. A failing receive closes
    /// the transport, which stops the controller, and ends the listener
    /// with the error. Closure ends it cleanly.
    pub async fn run(mut self) -> Result<ListenerStats, EnvError> {
        info!("Telemetry listener started ({} reporting nodes)", self.node_cells.len());
        loop {
            let report = match self.transport.recv_report().await {
                Ok(Some(report)) => report,
                Ok(None) => {
                    info!(
                        "Telemetry listener stopped: {} reports applied, {} discarded",
                        self.stats.applied, self.stats.discarded
                    );
                    return Ok(self.stats);
                }
                Err(e) => {
                    error!("Telemetry receive failed: {}", e);
                    self.transport.close();
                    return Err(e);
                }
            };

            match self.apply_report(&report) {
                Ok(_) => self.stats.applied += 1,
                Err(e) => {
                    warn!("Discarding report: {}", e);
                    self.stats.discarded += 1;
                }
            }
        }
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

/// An operator-set boundary temperature for one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryCommand {
    pub direction: Direction,
    pub key: u32,
    pub value: Fix16,
}

impl BoundaryCommand {
    pub fn to_packet(&self) -> ControlPacket {
        ControlPacket::new(self.key, self.value.0)
    }
}

/// Draws heatmap frames. Called outside the heatmap lock.
pub trait HeatmapRenderer: Send {
    fn render(&mut self, frame: &HeatmapSnapshot, boundaries: &[f64; 4]);
}

/// Renderer that summarises each frame in the log.
#[derive(Debug, Default)]
pub struct LogRenderer {
    frames: u64,
}

impl HeatmapRenderer for LogRenderer {
    fn render(&mut self, frame: &HeatmapSnapshot, boundaries: &[f64; 4]) {
        self.frames += 1;
        info!(
            "frame {}: min {:.2} max {:.2} mean {:.2} | E {:.1} W {:.1} N {:.1} S {:.1}",
            self.frames,
            frame.min().unwrap_or(f64::NAN),
            frame.max().unwrap_or(f64::NAN),
            frame.mean().unwrap_or(f64::NAN),
            boundaries[0],
            boundaries[1],
            boundaries[2],
            boundaries[3]
        );
    }
}

/// Operator actions fed into [`TelemetryController::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorInput {
    SetBoundary(Direction, f64),
    Quit,
}

/// Renders dirty frames and sends boundary commands.
pub struct TelemetryController<T: MeshTransport, R: HeatmapRenderer> {
    transport: Arc<T>,
    heatmap: SharedHeatmap,
    edge_keys: EdgeKeys,
    config: TelemetryConfig,
    renderer: R,

    /// Last value sent per edge, canonical direction order
    boundaries: [f64; 4],
}

impl<T: MeshTransport, R: HeatmapRenderer> TelemetryController<T, R> {
    pub fn new(
        transport: Arc<T>,
        heatmap: SharedHeatmap,
        edge_keys: EdgeKeys,
        config: TelemetryConfig,
        renderer: R,
    ) -> Self {
        let initial = config.clamp(config.initial_temperature);
        Self {
            transport,
            heatmap,
            edge_keys,
            config,
            renderer,
            boundaries: [initial; 4],
        }
    }

    pub fn boundaries(&self) -> [f64; 4] {
        self.boundaries
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    /// Clamps, encodes and sends a boundary temperature immediately.
    pub async fn set_boundary(&mut self, direction: Direction, value: f64) -> Result<BoundaryCommand, EnvError> {
        let value = self.config.clamp(value);
        let command = BoundaryCommand {
            direction,
            key: self.edge_keys.get(direction),
            value: Fix16::from_f64(value),
        };
        self.transport.send_control(command.to_packet()).await?;
        self.boundaries[direction.index()] = value;
        debug!("Boundary {} set to {:.2} (key {:#x})", direction, value, command.key);
        Ok(command)
    }

    /// Pushes the current boundary value to all four edges.
    pub async fn send_boundaries(&mut self) -> Result<(), EnvError> {
        for dir in Direction::ALL {
            self.set_boundary(dir, self.boundaries[dir.index()]).await?;
        }
        Ok(())
    }

    /// Renders one frame if the heatmap changed since the last render.
    pub fn render_if_dirty(&mut self) -> bool {
        let frame = lock_heatmap(&self.heatmap).take_if_dirty();
        match frame {
            Some(frame) => {
                self.renderer.render(&frame, &self.boundaries);
                true
            }
            None => false,
        }
    }

    /// Ticks the renderer and applies operator input until the transport
    /// closes or the operator quits (which closes the transport).
    pub async fn run(mut self, mut input: mpsc::Receiver<OperatorInput>) -> Result<R, EnvError> {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut input_open = true;

        loop {
            if self.transport.is_closed() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.render_if_dirty();
                }
                cmd = input.recv(), if input_open => match cmd {
                    Some(OperatorInput::SetBoundary(dir, value)) => {
                        if let Err(e) = self.set_boundary(dir, value).await {
                            error!("Boundary send failed: {}", e);
                            self.transport.close();
                            return Err(e);
                        }
                    }
                    Some(OperatorInput::Quit) => {
                        info!("Operator quit");
                        self.transport.close();
                    }
                    None => input_open = false,
                },
            }
        }

        self.render_if_dirty();
        Ok(self.renderer)
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Summary of a finished session.
#[derive(Debug)]
pub struct SessionOutcome<R> {
    pub listener: ListenerStats,
    pub renderer: R,
}

/// A running listener plus its controller, started after the barrier.
pub struct TelemetrySession<T: MeshTransport, R: HeatmapRenderer> {
    transport: Arc<T>,
    heatmap: SharedHeatmap,
    listener: JoinHandle<Result<ListenerStats, EnvError>>,
    controller: TelemetryController<T, R>,
}

impl<T: MeshTransport, R: HeatmapRenderer> TelemetrySession<T, R> {
    /// Spawns the listener and pushes the initial boundary temperature.
    pub async fn start(
        transport: Arc<T>,
        topology: &Topology,
        edge_keys: EdgeKeys,
        config: TelemetryConfig,
        renderer: R,
    ) -> Result<Self, EnvError> {
        let heatmap = Heatmap::new(topology, config.initial_temperature).shared();
        let listener = TelemetryListener::new(transport.clone(), heatmap.clone(), topology);
        let listener = tokio::spawn(listener.run());

        let mut controller =
            TelemetryController::new(transport.clone(), heatmap.clone(), edge_keys, config, renderer);
        if let Err(e) = controller.send_boundaries().await {
            transport.close();
            return Err(e);
        }

        Ok(Self {
            transport,
            heatmap,
            listener,
            controller,
        })
    }

    pub fn heatmap(&self) -> SharedHeatmap {
        self.heatmap.clone()
    }

    pub fn transport(&self) -> Arc<T> {
        self.transport.clone()
    }

    /// Runs the controller to completion, then joins the listener.
    pub async fn run(self, input: mpsc::Receiver<OperatorInput>) -> Result<SessionOutcome<R>, EnvError> {
        let controlled = self.controller.run(input).await;
        self.transport.close();

        let listener = self
            .listener
            .await
            .map_err(|e| EnvError::network(format!("listener task failed: {e}")))?;

        let renderer = controlled?;
        Ok(SessionOutcome {
            listener: listener?,
            renderer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::encode_vector;
    use crate::keys::{assign_keys, KeySpace};
    use crate::nets::build_nets;
    use crate::topology::{map_cells, TopologyConfig};
    use approx::assert_relative_eq;
    use async_trait::async_trait;
    use heatmesh_env::Machine;
    use tokio::sync::{watch, Mutex as AsyncMutex};

    /// In-memory transport: reports are pushed by the test, controls recorded.
    struct LoopbackTransport {
        reports: AsyncMutex<mpsc::UnboundedReceiver<ReportPacket>>,
        controls: Mutex<Vec<ControlPacket>>,
        closed: watch::Sender<bool>,
    }

    impl LoopbackTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<ReportPacket>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let (closed, _) = watch::channel(false);
            let transport = Arc::new(Self {
                reports: AsyncMutex::new(rx),
                controls: Mutex::new(Vec::new()),
                closed,
            });
            (transport, tx)
        }

        fn sent(&self) -> Vec<ControlPacket> {
            self.controls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MeshTransport for LoopbackTransport {
        async fn send_control(&self, packet: ControlPacket) -> Result<(), EnvError> {
            if self.is_closed() {
                return Err(EnvError::closed("loopback"));
            }
            self.controls.lock().unwrap().push(packet);
            Ok(())
        }

        async fn recv_report(&self) -> Result<Option<ReportPacket>, EnvError> {
            let mut closed = self.closed.subscribe();
            let mut rx = self.reports.lock().await;
            if *closed.borrow_and_update() {
                return Ok(None);
            }
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

    /// Transport whose receive side is broken; sends still succeed.
    struct BrokenReceiver {
        controls: Mutex<Vec<ControlPacket>>,
        closed: watch::Sender<bool>,
    }

    impl BrokenReceiver {
        fn new() -> Arc<Self> {
            let (closed, _) = watch::channel(false);
            Arc::new(Self {
                controls: Mutex::new(Vec::new()),
                closed,
            })
        }
    }

    #[async_trait]
    impl MeshTransport for BrokenReceiver {
        async fn send_control(&self, packet: ControlPacket) -> Result<(), EnvError> {
            self.controls.lock().unwrap().push(packet);
            Ok(())
        }

        async fn recv_report(&self) -> Result<Option<ReportPacket>, EnvError> {
            Err(EnvError::network("receive socket failed"))
        }

        fn close(&self) {
            self.closed.send_replace(true);
        }

        fn is_closed(&self) -> bool {
            *self.closed.borrow()
        }
    }

    #[derive(Default)]
    struct RecordingRenderer {
        frames: Vec<HeatmapSnapshot>,
    }

    impl HeatmapRenderer for RecordingRenderer {
        fn render(&mut self, frame: &HeatmapSnapshot, _boundaries: &[f64; 4]) {
            self.frames.push(frame.clone());
        }
    }

    /// One node with three cores: two hosted cells, (0,0) and (1,0).
    fn two_cell_topology() -> Topology {
        map_cells(&Machine::new(1, 1, 3), &TopologyConfig::default()).unwrap()
    }

    fn edge_keys(topology: &Topology) -> EdgeKeys {
        let nets = build_nets(topology).unwrap();
        assign_keys(&nets, &KeySpace::default()).unwrap().edge_keys(&nets)
    }

    #[test]
    fn test_report_updates_exactly_hosted_cells() {
        let topology = two_cell_topology();
        let (transport, _tx) = LoopbackTransport::new();
        let heatmap = Heatmap::new(&topology, 20.0).shared();
        lock_heatmap(&heatmap).take_if_dirty();

        let listener = TelemetryListener::new(transport, heatmap.clone(), &topology);
        let report = ReportPacket::new(NodeCoord::ORIGIN, 1, encode_vector(&[50.0, 51.5]));
        assert_eq!(listener.apply_report(&report), Ok(2));

        let state = lock_heatmap(&heatmap);
        assert!(state.is_dirty());
        assert_relative_eq!(state.get(CellCoord::new(0, 0)).unwrap(), 50.0);
        assert_relative_eq!(state.get(CellCoord::new(1, 0)).unwrap(), 51.5);

        let changed = state
            .snapshot()
            .hosted()
            .filter(|v| (*v - 20.0).abs() > f64::EPSILON)
            .count();
        assert_eq!(changed, 2);
        assert_eq!(state.get(CellCoord::new(2, 0)), None);
    }

    #[test]
    fn test_truncated_report_leaves_state_unchanged() {
        let topology = two_cell_topology();
        let (transport, _tx) = LoopbackTransport::new();
        let heatmap = Heatmap::new(&topology, 20.0).shared();
        lock_heatmap(&heatmap).take_if_dirty();
        let before = lock_heatmap(&heatmap).clone();

        let listener = TelemetryListener::new(transport, heatmap.clone(), &topology);
        let mut payload = encode_vector(&[50.0, 51.5]);
        payload.truncate(6);
        let err = listener
            .apply_report(&ReportPacket::new(NodeCoord::ORIGIN, 1, payload))
            .unwrap_err();

        assert_eq!(
            err,
            DecodeError::Length {
                node: NodeCoord::ORIGIN,
                expected: 8,
                actual: 6
            }
        );
        assert_eq!(*lock_heatmap(&heatmap), before);
    }

    #[test]
    fn test_oversized_and_unknown_reports_rejected() {
        let topology = two_cell_topology();
        let (transport, _tx) = LoopbackTransport::new();
        let heatmap = Heatmap::new(&topology, 20.0).shared();
        let listener = TelemetryListener::new(transport, heatmap, &topology);

        let long = ReportPacket::new(NodeCoord::ORIGIN, 1, encode_vector(&[1.0, 2.0, 3.0]));
        assert!(matches!(listener.apply_report(&long), Err(DecodeError::Length { .. })));

        let stranger = ReportPacket::new(NodeCoord::new(5, 5), 1, encode_vector(&[1.0]));
        assert_eq!(
            listener.apply_report(&stranger),
            Err(DecodeError::UnknownNode(NodeCoord::new(5, 5)))
        );
    }

    #[tokio::test]
    async fn test_listener_counts_and_stops_on_close() {
        let topology = two_cell_topology();
        let (transport, tx) = LoopbackTransport::new();
        let heatmap = Heatmap::new(&topology, 20.0).shared();
        let listener = TelemetryListener::new(transport.clone(), heatmap.clone(), &topology);
        let handle = tokio::spawn(listener.run());

        tx.send(ReportPacket::new(NodeCoord::ORIGIN, 1, encode_vector(&[30.0, 31.0]))).unwrap();
        tx.send(ReportPacket::new(NodeCoord::ORIGIN, 1, vec![0; 3])).unwrap();
        tx.send(ReportPacket::new(NodeCoord::ORIGIN, 1, encode_vector(&[40.0, 41.0]))).unwrap();

        while lock_heatmap(&heatmap).get(CellCoord::new(1, 0)) != Some(41.0) {
            tokio::task::yield_now().await;
        }
        transport.close();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats, ListenerStats { applied: 2, discarded: 1 });
    }

    #[tokio::test]
    async fn test_set_boundary_clamps_and_sends_immediately() {
        let topology = two_cell_topology();
        let keys = edge_keys(&topology);
        let (transport, _tx) = LoopbackTransport::new();
        let heatmap = Heatmap::new(&topology, 50.0).shared();
        let mut controller = TelemetryController::new(
            transport.clone(),
            heatmap,
            keys,
            TelemetryConfig::default(),
            RecordingRenderer::default(),
        );

        let cmd = controller.set_boundary(Direction::North, 250.0).await.unwrap();
        controller.set_boundary(Direction::North, 250.0).await.unwrap();
        controller.set_boundary(Direction::West, -5.0).await.unwrap();

        assert_eq!(cmd.key, keys.get(Direction::North));
        assert_eq!(cmd.value, Fix16::from_f64(100.0));

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], ControlPacket::new(keys.get(Direction::North), 100 << 16));
        assert_eq!(sent[2], ControlPacket::new(keys.get(Direction::West), 0));
        assert_eq!(controller.boundaries(), [50.0, 0.0, 100.0, 50.0]);
    }

    #[test]
    fn test_render_only_when_dirty() {
        let topology = two_cell_topology();
        let (transport, _tx) = LoopbackTransport::new();
        let heatmap = Heatmap::new(&topology, 50.0).shared();
        let mut controller = TelemetryController::new(
            transport,
            heatmap.clone(),
            edge_keys(&topology),
            TelemetryConfig::default(),
            RecordingRenderer::default(),
        );

        assert!(controller.render_if_dirty());
        assert!(!controller.render_if_dirty());

        lock_heatmap(&heatmap).set(CellCoord::ORIGIN, 75.0);
        lock_heatmap(&heatmap).mark_dirty();
        assert!(controller.render_if_dirty());

        assert!(!lock_heatmap(&heatmap).is_dirty());
        assert_eq!(controller.renderer().frames.len(), 2);
        assert_eq!(controller.renderer().frames[1].get(0, 0), Some(75.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_pushes_initial_boundaries_and_quits() {
        let topology = two_cell_topology();
        let keys = edge_keys(&topology);
        let (transport, tx) = LoopbackTransport::new();

        let session = TelemetrySession::start(
            transport.clone(),
            &topology,
            keys,
            TelemetryConfig::default(),
            RecordingRenderer::default(),
        )
        .await
        .unwrap();
        let heatmap = session.heatmap();

        let initial: Vec<_> = transport.sent();
        assert_eq!(initial.len(), 4);
        for (packet, dir) in initial.iter().zip(Direction::ALL) {
            assert_eq!(packet.key, keys.get(dir));
            assert_eq!(Fix16(packet.value).to_f64(), 50.0);
        }

        let (input_tx, input_rx) = mpsc::channel(8);
        let running = tokio::spawn(session.run(input_rx));

        tx.send(ReportPacket::new(NodeCoord::ORIGIN, 1, encode_vector(&[60.0, 61.0]))).unwrap();
        input_tx.send(OperatorInput::SetBoundary(Direction::East, 80.0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        input_tx.send(OperatorInput::Quit).await.unwrap();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome.listener.applied, 1);
        assert!(!outcome.renderer.frames.is_empty());
        assert_eq!(transport.sent().len(), 5);
        assert!(transport.is_closed());
        assert_eq!(lock_heatmap(&heatmap).get(CellCoord::new(1, 0)), Some(61.0));
    }

    #[test]
    fn test_tick_interval() {
        assert_eq!(TelemetryConfig::default().tick_interval(), Duration::from_millis(50));
        let config = TelemetryConfig {
            update_fps: 0,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1000));

        let fast = TelemetryConfig {
            update_fps: 2000,
            ..Default::default()
        };
        assert_eq!(fast.tick_interval(), Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_listener_receive_failure_closes_transport() {
        let topology = two_cell_topology();
        let transport = BrokenReceiver::new();
        let heatmap = Heatmap::new(&topology, 20.0).shared();
        let listener = TelemetryListener::new(transport.clone(), heatmap, &topology);

        let err = listener.run().await.unwrap_err();
        assert!(matches!(err, EnvError::NetworkError(_)));
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_surfaces_receive_failure_without_operator() {
        let topology = two_cell_topology();
        let transport = BrokenReceiver::new();
        let session = TelemetrySession::start(
            transport.clone(),
            &topology,
            edge_keys(&topology),
            TelemetryConfig::default(),
            RecordingRenderer::default(),
        )
        .await
        .unwrap();

        // Input stays open: only the listener failure can end the session
        let (_input_tx, input_rx) = mpsc::channel(8);
        let result = tokio::time::timeout(Duration::from_secs(5), session.run(input_rx))
            .await
            .expect("session kept running after the listener failed");

        assert!(matches!(result, Err(EnvError::NetworkError(_))));
        assert!(transport.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_controller_survives_extreme_config() {
        let topology = two_cell_topology();
        let (transport, _tx) = LoopbackTransport::new();
        let config = TelemetryConfig {
            initial_temperature: 50.0,
            max_temperature: -1.0,
            update_fps: 2000,
        };
        assert!(config.validate().is_err());

        let mut controller = TelemetryController::new(
            transport.clone(),
            Heatmap::new(&topology, 50.0).shared(),
            edge_keys(&topology),
            config,
            RecordingRenderer::default(),
        );
        assert_eq!(controller.boundaries(), [0.0; 4]);
        let cmd = controller.set_boundary(Direction::East, 30.0).await.unwrap();
        assert_eq!(cmd.value, Fix16::from_f64(0.0));

        let (input_tx, input_rx) = mpsc::channel(1);
        let running = tokio::spawn(controller.run(input_rx));
        tokio::time::sleep(Duration::from_millis(10)).await;
        input_tx.send(OperatorInput::Quit).await.unwrap();
        let renderer = running.await.unwrap().unwrap();
        assert_eq!(renderer.frames.len(), 1);
    }

    #[test]
    fn test_clamp_temperature_bounds() {
        assert_eq!(clamp_temperature(150.0, 100.0), 100.0);
        assert_eq!(clamp_temperature(-3.0, 100.0), 0.0);
        assert_eq!(clamp_temperature(f64::NAN, 100.0), 0.0);
        assert_eq!(clamp_temperature(40.0, f64::NAN), 0.0);
        assert!(TelemetryConfig::default().validate().is_ok());
    }
}
