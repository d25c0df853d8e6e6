//! SimMesh - an in-process emulator of a loaded mesh machine.
//!
//! The emulator implements the device-load and barrier collaborators and
//! runs the per-core heat kernel on a virtual tick:
//!
//! ```text
//!   load_routing_tables / alloc_shared / write_core_memory / load_application
//!        |
//!        v
//!   cores READY (sync0) --broadcast_signal(sync0)--> RUNNING --run_ticks--> EXITED
//!
//!   every tick:
//!     1. host control packets are multicast from node (0, 0)
//!     2. each running core updates its temperature and multicasts it
//!     3. each core writes its temperature into its node's shared slot
//!     4. a node's reporting core sends the slots to the host once per period
//! ```
//!
//! Multicast delivery follows the loaded routing tables hop by hop, so a
//! wrong table shows up as a wrong heatmap.

use crate::router::{link_of, neighbour_node};
use async_trait::async_trait;
use heatmesh_core::{CellConfig, Direction, Fix16};
use heatmesh_env::{
    ApplicationMap, ControlPacket, CoreLocation, DeviceLoader, EnvError, Machine, NodeCoord, NodeResults, Phase,
    ReportPacket, RoutingEntry, RoutingTables, SyncPrimitive, KEY_MASK,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Emulator timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Ticks each core runs before reaching exit
    pub run_ticks: u64,

    /// Ticks between two reports from the same node
    pub report_period: u64,

    /// Virtual duration of one tick
    pub tick_interval_us: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            run_ticks: 2048,
            report_period: 64,
            tick_interval_us: 1000,
        }
    }
}

impl MeshConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(self.tick_interval_us.max(1))
    }
}

/// Injected faults.
#[derive(Debug, Clone, Default)]
pub struct MeshFaults {
    /// Cores that never finish local setup
    pub stall_before_ready: BTreeSet<CoreLocation>,

    /// Cores that never reach exit
    pub stall_before_exit: BTreeSet<CoreLocation>,

    /// Nodes whose application load fails
    pub failing_nodes: BTreeSet<NodeCoord>,

    /// Nodes whose reports lose their last two bytes
    pub truncated_reports: BTreeSet<NodeCoord>,
}

/// Lifecycle of one emulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorePhase {
    Ready,
    Running,
    Exited,
    Stalled,
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStats {
    pub ticks: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    pub controls_received: u64,
    pub reports_sent: u64,
}

/// One step of the heat kernel on s15.16 values.
///
/// `t += ((sum(n_i - t) / 4) * alpha) >> 16`
pub fn diffuse(temperature: i32, neighbours: &[i32; 4], alpha: Fix16) -> i32 {
    let sum: i64 = neighbours.iter().map(|n| *n as i64 - temperature as i64).sum();
    let mean = (sum / 4).clamp(i32::MIN as i64, i32::MAX as i64) as i32;
    let delta = Fix16(mean).mul(alpha).0 as i64;
    (temperature as i64 + delta).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Report slot offset of a node within a period.
pub fn report_phase(node: NodeCoord, period: u64) -> u64 {
    let phase = (((node.y & 7) << 3) | (node.x & 7)) as u64;
    phase % period.max(1)
}

#[derive(Debug, Clone)]
struct SimCore {
    location: CoreLocation,
    config: CellConfig,
    temperature: i32,
    neighbours: [i32; 4],
    phase: CorePhase,
}

impl SimCore {
    fn on_packet(&mut self, key: u32, payload: i32) {
        let key = key & KEY_MASK;
        for (i, neighbour_key) in self.config.neighbour_keys.iter().enumerate() {
            if *neighbour_key == key {
                self.neighbours[i] = payload;
            }
        }
    }
}

#[derive(Debug, Default)]
struct NodeState {
    tables: Vec<RoutingEntry>,
    shared: Option<Vec<i32>>,
    configs: BTreeMap<u8, CellConfig>,
}

#[derive(Debug, Default)]
struct MeshState {
    nodes: BTreeMap<NodeCoord, NodeState>,
    cores: BTreeMap<CoreLocation, SimCore>,
    controls: VecDeque<ControlPacket>,
    signals: Vec<Phase>,
    started: bool,
    stats: MeshStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PhaseCounts {
    ready: usize,
    exited: usize,
}

struct MeshInner {
    machine: Machine,
    config: MeshConfig,
    faults: MeshFaults,
    state: Mutex<MeshState>,
    counts: watch::Sender<PhaseCounts>,
    shutdown: watch::Sender<bool>,
    reports_tx: mpsc::UnboundedSender<ReportPacket>,
    reports_rx: Mutex<Option<mpsc::UnboundedReceiver<ReportPacket>>>,
}

/// Handle to an emulated machine. Clones share the same mesh.
#[derive(Clone)]
pub struct SimMesh {
    inner: Arc<MeshInner>,
}

impl SimMesh {
    pub fn new(machine: Machine, config: MeshConfig, faults: MeshFaults) -> Self {
        let (counts, _) = watch::channel(PhaseCounts::default());
        let (shutdown, _) = watch::channel(false);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MeshInner {
                machine,
                config,
                faults,
                state: Mutex::new(MeshState::default()),
                counts,
                shutdown,
                reports_tx,
                reports_rx: Mutex::new(Some(reports_rx)),
            }),
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.inner.machine
    }

    pub fn config(&self) -> &MeshConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, MeshState> {
        self.inner.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands out the report stream; only the first caller gets it.
    pub(crate) fn take_reports(&self) -> Option<mpsc::UnboundedReceiver<ReportPacket>> {
        self.inner
            .reports_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Queues a host control packet for the next tick.
    pub fn inject_control(&self, packet: ControlPacket) -> Result<(), EnvError> {
        if self.is_shut_down() {
            return Err(EnvError::closed("mesh is shut down"));
        }
        let mut state = self.lock();
        state.controls.push_back(packet);
        state.stats.controls_received += 1;
        Ok(())
    }

    pub fn stats(&self) -> MeshStats {
        self.lock().stats
    }

    /// Signals broadcast so far, in order.
    pub fn signals(&self) -> Vec<Phase> {
        self.lock().signals.clone()
    }

    pub fn core_phase(&self, location: CoreLocation) -> Option<CorePhase> {
        self.lock().cores.get(&location).map(|c| c.phase)
    }

    /// Current temperature of a core's cell.
    pub fn temperature(&self, location: CoreLocation) -> Option<f64> {
        self.lock()
            .cores
            .get(&location)
            .map(|c| Fix16(c.temperature).to_f64())
    }

    pub fn loaded_cores(&self) -> usize {
        self.lock().cores.len()
    }

    /// Stops the tick loop; queued and future controls are rejected.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    fn publish_counts(&self, state: &MeshState) {
        let counts = PhaseCounts {
            ready: state.cores.values().filter(|c| c.phase == CorePhase::Ready).count(),
            exited: state.cores.values().filter(|c| c.phase == CorePhase::Exited).count(),
        };
        self.inner.counts.send_replace(counts);
    }

    fn check_node(&self, node: NodeCoord) -> Result<(), EnvError> {
        if self.inner.machine.contains(node) {
            Ok(())
        } else {
            Err(EnvError::load_failed(node, "node outside machine"))
        }
    }

    /// Runs one tick of every running core.
    pub fn step(&self) {
        let machine = &self.inner.machine;
        let period = self.inner.config.report_period.max(1);
        let mut guard = self.lock();
        let state = &mut *guard;
        state.stats.ticks += 1;
        let tick = state.stats.ticks;

        // Host control packets enter the mesh at the origin node
        let controls: Vec<ControlPacket> = state.controls.drain(..).collect();
        for control in controls {
            multicast(machine, state, NodeCoord::ORIGIN, control.key, control.value);
        }

        let mut sends = Vec::new();
        for core in state.cores.values_mut().filter(|c| c.phase == CorePhase::Running) {
            core.temperature = diffuse(core.temperature, &core.neighbours, core.config.alpha);
            sends.push((core.location.node, core.config.own_key, core.temperature));
        }
        for (node, key, value) in sends {
            multicast(machine, state, node, key, value);
        }

        let MeshState { nodes, cores, stats, .. } = state;
        for core in cores.values().filter(|c| c.phase == CorePhase::Running) {
            let slot = core.location.core as usize - 1;
            if let Some(shared) = nodes.get_mut(&core.location.node).and_then(|n| n.shared.as_mut()) {
                if let Some(value) = shared.get_mut(slot) {
                    *value = core.temperature;
                }
            }
        }

        for core in cores.values() {
            let count = core.config.observation_count as usize;
            let node = core.location.node;
            if core.phase != CorePhase::Running || count == 0 || tick % period != report_phase(node, period) {
                continue;
            }
            let Some(shared) = nodes.get(&node).and_then(|n| n.shared.as_ref()) else {
                continue;
            };

            let mut payload: Vec<u8> = shared
                .iter()
                .take(count)
                .flat_map(|v| v.to_le_bytes())
                .collect();
            if self.inner.faults.truncated_reports.contains(&node) {
                payload.truncate(payload.len().saturating_sub(2));
            }

            if self
                .inner
                .reports_tx
                .send(ReportPacket::new(node, core.location.core, payload))
                .is_ok()
            {
                stats.reports_sent += 1;
            }
        }
    }

    /// Moves every running core to exit, except those stalled by a fault.
    fn finish(&self) {
        let mut state = self.lock();
        for core in state.cores.values_mut().filter(|c| c.phase == CorePhase::Running) {
            if self.inner.faults.stall_before_exit.contains(&core.location) {
                core.phase = CorePhase::Stalled;
            } else {
                core.phase = CorePhase::Exited;
            }
        }
        info!("Mesh finished after {} ticks", state.stats.ticks);
        self.publish_counts(&state);
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.inner.config.tick_interval());
        let mut shutdown = self.inner.shutdown.subscribe();

        for _ in 0..self.inner.config.run_ticks {
            tokio::select! {
                _ = ticker.tick() => self.step(),
                _ = shutdown.changed() => {
                    debug!("Mesh shut down mid-run");
                    return;
                }
            }
        }
        self.finish();
    }
}

/// Delivers one packet along the routing tables starting at `origin`.
fn multicast(machine: &Machine, state: &mut MeshState, origin: NodeCoord, key: u32, payload: i32) {
    let mut queue = VecDeque::from([origin]);
    let mut visited = BTreeSet::new();

    while let Some(node) = queue.pop_front() {
        if !visited.insert(node) {
            continue;
        }
        let route = state
            .nodes
            .get(&node)
            .and_then(|n| n.tables.iter().find(|e| e.matches(key)))
            .map(|e| e.route);
        let Some(route) = route else {
            state.stats.packets_dropped += 1;
            continue;
        };

        for dir in Direction::ALL {
            if route & RoutingEntry::link_bit(link_of(dir)) != 0 {
                if let Some(next) = neighbour_node(machine, node, dir) {
                    queue.push_back(next);
                }
            }
        }

        let max_core = 32 - RoutingEntry::ROUTE_CORE_SHIFT;
        for core in 0..max_core as u8 {
            if route & RoutingEntry::core_bit(core) == 0 {
                continue;
            }
            match state.cores.get_mut(&CoreLocation::new(node, core)) {
                Some(target) if target.phase == CorePhase::Running => {
                    target.on_packet(key, payload);
                    state.stats.packets_delivered += 1;
                }
                _ => state.stats.packets_dropped += 1,
            }
        }
    }
}

#[async_trait]
impl DeviceLoader for SimMesh {
    async fn load_routing_tables(&self, tables: &RoutingTables) -> NodeResults {
        let mut state = self.lock();
        let mut results = NodeResults::new();
        for (node, entries) in tables {
            let result = self.check_node(*node).map(|_| {
                state.nodes.entry(*node).or_default().tables = entries.clone();
            });
            results.insert(*node, result);
        }
        debug!("Loaded routing tables on {} nodes", tables.len());
        results
    }

    async fn alloc_shared(&self, node: NodeCoord, size: usize) -> Result<(), EnvError> {
        self.check_node(node)?;
        if size % 4 != 0 {
            return Err(EnvError::load_failed(node, format!("shared buffer size {} is not word aligned", size)));
        }
        self.lock().nodes.entry(node).or_default().shared = Some(vec![0; size / 4]);
        Ok(())
    }

    async fn write_core_memory(&self, node: NodeCoord, core: u8, data: &[u8]) -> Result<(), EnvError> {
        self.check_node(node)?;
        if core == 0 || core >= self.inner.machine.cores_at(node) {
            return Err(EnvError::load_failed(node, format!("core {} is not an application core", core)));
        }
        let config = CellConfig::from_bytes(data).ok_or_else(|| {
            EnvError::SerializationError(format!("config for {}#{} is {} bytes", node, core, data.len()))
        })?;
        self.lock().nodes.entry(node).or_default().configs.insert(core, config);
        Ok(())
    }

    async fn load_application(&self, image: &str, cores: &ApplicationMap) -> NodeResults {
        let mut state = self.lock();
        let mut results = NodeResults::new();

        for (node, node_cores) in cores {
            if let Err(e) = self.check_node(*node) {
                results.insert(*node, Err(e));
                continue;
            }
            if self.inner.faults.failing_nodes.contains(node) {
                warn!("Injected load failure on {}", node);
                results.insert(*node, Err(EnvError::load_failed(node, format!("{} failed to start", image))));
                continue;
            }

            let configs = state.nodes.get(node).map(|n| n.configs.clone()).unwrap_or_default();
            let mut result = Ok(());
            for core in node_cores {
                let location = CoreLocation::new(*node, *core);
                let Some(config) = configs.get(core) else {
                    result = Err(EnvError::load_failed(node, format!("core {} has no config", core)));
                    break;
                };
                let phase = if self.inner.faults.stall_before_ready.contains(&location) {
                    CorePhase::Stalled
                } else {
                    CorePhase::Ready
                };
                state.cores.insert(
                    location,
                    SimCore {
                        location,
                        config: *config,
                        temperature: 0,
                        neighbours: [0; 4],
                        phase,
                    },
                );
            }
            results.insert(*node, result);
        }

        info!("Started {} on {} cores", image, state.cores.len());
        self.publish_counts(&state);
        results
    }
}

#[async_trait]
impl SyncPrimitive for SimMesh {
    async fn wait_for_phase(&self, phase: Phase, expected: usize) -> Result<usize, EnvError> {
        let mut counts = self.inner.counts.subscribe();
        loop {
            let current = *counts.borrow_and_update();
            let reached = match phase {
                Phase::Sync0 => current.ready,
                Phase::Exit => current.exited,
            };
            if reached >= expected {
                return Ok(reached);
            }
            counts
                .changed()
                .await
                .map_err(|_| EnvError::closed("mesh barrier"))?;
        }
    }

    fn count_in_phase(&self, phase: Phase) -> usize {
        let counts = *self.inner.counts.borrow();
        match phase {
            Phase::Sync0 => counts.ready,
            Phase::Exit => counts.exited,
        }
    }

    fn broadcast_signal(&self, phase: Phase) -> Result<(), EnvError> {
        let mut state = self.lock();
        state.signals.push(phase);

        match phase {
            Phase::Sync0 => {
                if state.started {
                    return Ok(());
                }
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|e| EnvError::network(format!("no runtime to run the mesh: {e}")))?;
                for core in state.cores.values_mut().filter(|c| c.phase == CorePhase::Ready) {
                    core.phase = CorePhase::Running;
                }
                state.started = true;
                self.publish_counts(&state);
                runtime.spawn(self.clone().run());
                info!("Start signal: mesh running");
            }
            Phase::Exit => {
                drop(state);
                self.shutdown();
            }
        }
        Ok(())
    }
}
