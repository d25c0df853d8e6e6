//! Scenario runner - deploys HeatMesh onto an emulated mesh and checks the
//! resulting heatmap.
//!
//! Every scenario runs on a single-threaded tokio runtime with a paused
//! clock, so barrier timeouts, tick intervals and render cadence are all
//! virtual and a given seed always produces the same run.
//!
//! ```text
//!   plan (XyRouter) ──> SimMesh::load ──> sync0 barrier ──> start
//!                                                            │
//!   operator script ──> TelemetryController ──controls──> SimMesh ticks
//!                                                            │
//!   ExportRenderer <── Heatmap <── TelemetryListener <──reports
//! ```

use crate::exporter::{ExportRenderer, SimExport};
use crate::machine::MachineGenerator;
use crate::mesh::{MeshConfig, MeshFaults, SimMesh};
use crate::network::SimTransport;
use crate::router::XyRouter;
use crate::scenarios::ScenarioId;

use heatmesh_core::telemetry::lock_heatmap;
use heatmesh_core::{
    deploy, DeployError, DeploymentConfig, DeploymentPlan, Direction, HeatmapRenderer, HeatmapSnapshot,
    ListenerStats, OperatorInput, SessionOutcome, SyncConfig, TelemetrySession,
};
use heatmesh_env::{CoreLocation, EnvError, Machine, MeshTransport, NodeCoord, Phase, SyncPrimitive};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Tolerance for comparing reported temperatures against edge values.
const TEMPERATURE_EPSILON: f64 = 1e-3;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Mesh ticks executed
    pub total_ticks: u64,

    /// Grid cells in the deployment plan
    pub cells: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

impl ScenarioResult {
    fn new(scenario: ScenarioId, seed: u64) -> Self {
        Self {
            scenario,
            seed,
            passed: false,
            total_ticks: 0,
            cells: 0,
            failure_reason: None,
            metrics: ScenarioMetrics::default(),
        }
    }

    fn check(&mut self, passed: bool, reason: impl FnOnce() -> String) {
        self.passed = passed;
        self.failure_reason = (!passed).then(reason);
    }
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Reports written into the heatmap
    pub reports_applied: u64,

    /// Reports rejected by the listener
    pub reports_discarded: u64,

    /// Reports the mesh sent
    pub reports_sent: u64,

    /// Boundary commands sent by the host
    pub controls_sent: u64,

    /// Multicast deliveries inside the mesh
    pub packets_delivered: u64,

    /// Multicast packets with no matching route or target
    pub packets_dropped: u64,

    pub frames_rendered: u64,

    /// Mean of the final heatmap
    pub final_mean: Option<f64>,
}

/// One scripted operator action, timed in mesh ticks after start.
#[derive(Debug, Clone, Copy)]
struct ScriptStep {
    at_tick: u64,
    direction: Direction,
    value: f64,
}

/// Machine, faults and operator script for one scenario.
struct Setup {
    machine: Machine,
    faults: MeshFaults,
    script: Vec<ScriptStep>,
}

/// What a completed deployment leaves behind.
struct Drive<R> {
    listener: ListenerStats,
    renderer: R,
    snapshot: HeatmapSnapshot,
    controls_sent: u64,
    operator_quit: bool,
}

enum FirstDone<R> {
    Mesh(Result<(), DeployError>),
    Session(Result<Result<SessionOutcome<R>, EnvError>, JoinError>),
}

/// Runs deployment scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    deployment: DeploymentConfig,
    mesh: MeshConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            deployment: DeploymentConfig::default(),
            mesh: MeshConfig::default(),
        }
    }

    /// Sets the number of ticks each core runs.
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.mesh.run_ticks = ticks;
        self
    }

    /// Sets the deployment configuration.
    pub fn with_deployment(mut self, deployment: DeploymentConfig) -> Self {
        self.deployment = deployment;
        self
    }

    /// Sets the emulator timing.
    pub fn with_mesh(mut self, mesh: MeshConfig) -> Self {
        self.mesh = mesh;
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_exported(scenario).0
    }

    /// Runs a scenario and writes every rendered frame to `path`.
    pub fn run_with_export(&self, scenario: ScenarioId, path: &str) -> ScenarioResult {
        let (result, export) = self.run_exported(scenario);
        match export.write_to_file(path) {
            Ok(()) => info!("Exported {} frames to {}", export.frames.len(), path),
            Err(e) => error!("Failed to write export: {:?}", e),
        }
        result
    }

    fn run_exported(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build();
        match runtime {
            Ok(runtime) => runtime.block_on(self.execute(scenario)),
            Err(e) => {
                let mut result = ScenarioResult::new(scenario, self.seed);
                result.check(false, || format!("failed to build runtime: {e}"));
                (result, SimExport::new(scenario.name(), self.seed))
            }
        }
    }

    /// Deploys onto `machine` and streams the heatmap to `renderer` until
    /// the mesh exits or the operator quits. Runs on the caller's runtime
    /// and clock.
    pub async fn run_live<R: HeatmapRenderer + 'static>(
        &self,
        machine: Machine,
        renderer: R,
        input: mpsc::Receiver<OperatorInput>,
    ) -> Result<ListenerStats, DeployError> {
        let plan = deploy::plan(&machine, &self.deployment, &XyRouter)?;
        let mesh = SimMesh::new(machine, self.mesh.clone(), MeshFaults::default());
        let outcome = self.drive(&plan, &mesh, renderer, input).await;
        mesh.shutdown();

        let drive = outcome?;
        if drive.operator_quit {
            info!("Operator ended the run after {} ticks", mesh.stats().ticks);
        }
        Ok(drive.listener)
    }

    // =========================================================================
    // SETUP
    // =========================================================================

    fn setup(&self, scenario: ScenarioId) -> Setup {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut faults = MeshFaults::default();
        let mut script = Vec::new();

        let machine = match scenario {
            ScenarioId::SteadyState => Machine::new(2, 2, 18),
            ScenarioId::PartialMachine => MachineGenerator::new(self.seed).generate(3, 3, 18, 0.5),
            ScenarioId::SingleCell => Machine::new(1, 1, 2),
            ScenarioId::BoundarySweep => {
                let at_tick = self.mesh.run_ticks / 8;
                script.push(ScriptStep { at_tick, direction: Direction::East, value: 100.0 });
                script.push(ScriptStep { at_tick, direction: Direction::West, value: 0.0 });
                Machine::new(2, 1, 18)
            }
            ScenarioId::StalledCore => {
                let machine = Machine::new(2, 2, 18);
                let node = NodeCoord::new(rng.gen_range(0..2), rng.gen_range(0..2));
                let core = rng.gen_range(1..=16);
                faults.stall_before_ready.insert(CoreLocation::new(node, core));
                machine
            }
            ScenarioId::CorruptReports => {
                faults.truncated_reports.insert(NodeCoord::new(1, 0));
                Machine::new(2, 1, 18)
            }
            ScenarioId::LoadFailure => {
                let node = NodeCoord::new(rng.gen_range(0..2), rng.gen_range(0..2));
                faults.failing_nodes.insert(node);
                Machine::new(2, 2, 18)
            }
        };

        Setup { machine, faults, script }
    }

    // =========================================================================
    // EXECUTION
    // =========================================================================

    async fn execute(&self, scenario: ScenarioId) -> (ScenarioResult, SimExport) {
        let mut result = ScenarioResult::new(scenario, self.seed);
        let setup = self.setup(scenario);

        let plan = match deploy::plan(&setup.machine, &self.deployment, &XyRouter) {
            Ok(plan) => plan,
            Err(e) => {
                result.check(false, || format!("planning failed: {e}"));
                return (result, SimExport::new(scenario.name(), self.seed));
            }
        };
        result.cells = plan.topology.len();
        info!(
            "{}: {} cells on {} nodes, {} faults injected",
            scenario.name(),
            result.cells,
            setup.machine.node_count(),
            setup.faults.stall_before_ready.len()
                + setup.faults.failing_nodes.len()
                + setup.faults.truncated_reports.len()
        );

        let failing_nodes = setup.faults.failing_nodes.clone();
        let truncated_nodes = setup.faults.truncated_reports.clone();
        let mesh = SimMesh::new(setup.machine, self.mesh.clone(), setup.faults);

        let (input_tx, input_rx) = mpsc::channel(16);
        let script = tokio::spawn(play_script(input_tx, setup.script, self.mesh.clone()));
        let renderer = ExportRenderer::new(scenario.name(), self.seed);
        let outcome = self.drive(&plan, &mesh, renderer, input_rx).await;
        script.abort();
        mesh.shutdown();

        let stats = mesh.stats();
        result.total_ticks = stats.ticks;
        result.metrics.reports_sent = stats.reports_sent;
        result.metrics.packets_delivered = stats.packets_delivered;
        result.metrics.packets_dropped = stats.packets_dropped;

        let drive = match outcome {
            Ok(drive) if scenario.expects_failure() => {
                result.check(false, || "deployment succeeded despite the injected fault".to_string());
                return (result, drive.renderer.into_export());
            }
            Ok(drive) => drive,
            Err(e) => {
                match (scenario, &e) {
                    (
                        ScenarioId::StalledCore,
                        DeployError::SyncTimeout { phase: Phase::Sync0, reached, expected, .. },
                    ) => {
                        let (reached, expected) = (*reached, *expected);
                        result.check(reached + 1 == expected && mesh.signals().is_empty(), || {
                            format!("barrier reached {reached}/{expected}, signals {:?}", mesh.signals())
                        });
                    }
                    (ScenarioId::LoadFailure, DeployError::Load { failures }) => {
                        let blamed: Vec<NodeCoord> = failures.iter().map(|(node, _)| *node).collect();
                        let expected: Vec<NodeCoord> = failing_nodes.iter().copied().collect();
                        result.check(blamed == expected && mesh.signals().is_empty(), || {
                            format!("failures blamed {:?}, expected {:?}", blamed, expected)
                        });
                    }
                    _ => result.check(false, || format!("deployment failed: {e}")),
                }
                if result.passed {
                    info!("{}: deployment failed as expected: {}", scenario.name(), e);
                }
                return (result, SimExport::new(scenario.name(), self.seed));
            }
        };

        result.metrics.reports_applied = drive.listener.applied;
        result.metrics.reports_discarded = drive.listener.discarded;
        result.metrics.controls_sent = drive.controls_sent;
        result.metrics.frames_rendered = drive.renderer.frames().len() as u64;
        result.metrics.final_mean = drive.snapshot.mean();

        self.evaluate(scenario, &plan, &drive, &truncated_nodes, &mut result);

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("  {} RESULTS:", scenario.name().to_uppercase());
        info!(
            "    Reports: {} applied, {} discarded ({} sent)",
            drive.listener.applied, drive.listener.discarded, stats.reports_sent
        );
        info!(
            "    Heatmap: min {:.2} max {:.2} mean {:.2}",
            drive.snapshot.min().unwrap_or(f64::NAN),
            drive.snapshot.max().unwrap_or(f64::NAN),
            drive.snapshot.mean().unwrap_or(f64::NAN)
        );
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let mut export = drive.renderer.into_export();
        export.finalize(result.passed, result.failure_reason.clone());
        (result, export)
    }

    /// Loads, starts and streams one deployment.
    ///
    /// Ends when every core exits (the transport is then closed) or when the
    /// operator quits (the mesh is then sent the exit signal).
    async fn drive<R: HeatmapRenderer + 'static>(
        &self,
        plan: &DeploymentPlan,
        mesh: &SimMesh,
        renderer: R,
        input: mpsc::Receiver<OperatorInput>,
    ) -> Result<Drive<R>, DeployError> {
        let transport = Arc::new(SimTransport::connect(mesh)?);

        // Give the mesh at least twice its nominal run time to reach exit
        let run_ms = self.mesh.run_ticks.saturating_mul(self.mesh.tick_interval_us) / 1000;
        let sync = SyncConfig {
            done_timeout_ms: self.deployment.sync.done_timeout_ms.max(run_ms.saturating_mul(2)),
            ..self.deployment.sync.clone()
        };

        let mut controller = deploy::launch(plan, mesh, Arc::new(mesh.clone()), &sync).await?;
        let session = TelemetrySession::start(
            transport.clone(),
            &plan.topology,
            plan.edge_keys,
            self.deployment.telemetry.clone(),
            renderer,
        )
        .await?;
        let heatmap = session.heatmap();
        let mut running = tokio::spawn(session.run(input));

        let first = tokio::select! {
            done = controller.wait_done() => FirstDone::Mesh(done),
            joined = &mut running => FirstDone::Session(joined),
        };

        let (done, joined, operator_quit) = match first {
            FirstDone::Mesh(done) => {
                // Let reports already queued reach the listener
                tokio::time::sleep(self.deployment.telemetry.tick_interval() * 2).await;
                transport.close();
                (done, running.await, false)
            }
            FirstDone::Session(joined) => {
                debug!("Session ended before the mesh; sending {}", Phase::Exit);
                mesh.broadcast_signal(Phase::Exit)?;
                (Ok(()), joined, true)
            }
        };

        done?;
        let session = joined.map_err(|e| EnvError::network(format!("session task failed: {e}")))??;
        let snapshot = lock_heatmap(&heatmap).snapshot();

        Ok(Drive {
            listener: session.listener,
            renderer: session.renderer,
            snapshot,
            controls_sent: transport.controls_sent(),
            operator_quit,
        })
    }

    // =========================================================================
    // EVALUATION
    // =========================================================================

    fn evaluate(
        &self,
        scenario: ScenarioId,
        plan: &DeploymentPlan,
        drive: &Drive<ExportRenderer>,
        truncated_nodes: &std::collections::BTreeSet<NodeCoord>,
        result: &mut ScenarioResult,
    ) {
        let snapshot = &drive.snapshot;
        let telemetry = &self.deployment.telemetry;
        let hosted = snapshot.hosted().count();

        if drive.listener.applied == 0 {
            return result.check(false, || "no reports reached the heatmap".to_string());
        }
        if hosted != plan.topology.len() {
            return result.check(false, || {
                format!("heatmap hosts {} cells, plan has {}", hosted, plan.topology.len())
            });
        }
        let (min, max) = (snapshot.min().unwrap_or(0.0), snapshot.max().unwrap_or(0.0));
        if min < -TEMPERATURE_EPSILON || max > telemetry.max_temperature + TEMPERATURE_EPSILON {
            return result.check(false, || format!("temperature out of range: [{min:.3}, {max:.3}]"));
        }

        match scenario {
            ScenarioId::SteadyState | ScenarioId::PartialMachine => {
                let edge = telemetry.clamp(telemetry.initial_temperature);
                result.check(
                    drive.listener.discarded == 0 && min > 0.0 && max <= edge + TEMPERATURE_EPSILON,
                    || {
                        format!(
                            "discarded {}, heatmap [{min:.3}, {max:.3}] with edges at {edge}",
                            drive.listener.discarded
                        )
                    },
                );
            }
            ScenarioId::SingleCell => {
                let edge = telemetry.clamp(telemetry.initial_temperature);
                let value = snapshot.get(0, 0).unwrap_or(f64::NAN);
                result.check(plan.topology.len() == 1 && value > 0.0 && value <= edge + TEMPERATURE_EPSILON, || {
                    format!("{} cells, anchor at {value:.3}", plan.topology.len())
                });
            }
            ScenarioId::BoundarySweep => {
                let half = snapshot.width / 2;
                let column_mean = |xs: std::ops::Range<u32>| {
                    let values: Vec<f64> = xs
                        .flat_map(|x| (0..snapshot.height).filter_map(move |y| snapshot.get(x, y)))
                        .collect();
                    values.iter().sum::<f64>() / values.len().max(1) as f64
                };
                let west = column_mean(0..half);
                let east = column_mean(half..snapshot.width);
                result.check(east > west, || format!("east half {east:.2} not hotter than west half {west:.2}"));
            }
            ScenarioId::CorruptReports => {
                // Cells on a node whose reports are all rejected keep the display default
                let untouched = truncated_nodes.iter().all(|node| {
                    plan.topology.node_cells(*node).iter().all(|c| {
                        snapshot
                            .get(c.x, c.y)
                            .is_some_and(|v| (v - telemetry.initial_temperature).abs() < TEMPERATURE_EPSILON)
                    })
                });
                result.check(drive.listener.discarded > 0 && untouched, || {
                    format!(
                        "discarded {}, truncated nodes untouched: {}",
                        drive.listener.discarded, untouched
                    )
                });
            }
            ScenarioId::StalledCore | ScenarioId::LoadFailure => {
                result.check(false, || "deployment succeeded despite the injected fault".to_string());
            }
        }

        if !result.passed {
            warn!(
                "{} failed: {}",
                scenario.name(),
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }
}

/// Feeds scripted boundary changes to the controller on the mesh clock.
async fn play_script(input: mpsc::Sender<OperatorInput>, script: Vec<ScriptStep>, mesh: MeshConfig) {
    let start = tokio::time::Instant::now();
    for step in script {
        let at = mesh.tick_interval().saturating_mul(u32::try_from(step.at_tick).unwrap_or(u32::MAX));
        tokio::time::sleep_until(start + at).await;
        debug!("Script: {} -> {:.1} at tick {}", step.direction, step.value, step.at_tick);
        if input
            .send(OperatorInput::SetBoundary(step.direction, step.value))
            .await
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_state_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::SteadyState);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.cells, 64);
        assert_eq!(result.total_ticks, 2048);
        assert_eq!(result.metrics.reports_discarded, 0);
        assert!(result.metrics.frames_rendered > 0);
        // Initial push on all four edges
        assert_eq!(result.metrics.controls_sent, 4);
    }

    #[test]
    fn test_single_cell_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::SingleCell);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.cells, 1);
    }

    #[test]
    fn test_boundary_sweep_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::BoundarySweep);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.controls_sent, 6);
    }

    #[test]
    fn test_corrupt_reports_scenario() {
        let result = ScenarioRunner::new(42).run(ScenarioId::CorruptReports);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.reports_applied > 0);
        assert!(result.metrics.reports_discarded > 0);
    }

    #[test]
    fn test_stalled_core_scenario() {
        let result = ScenarioRunner::new(7).run(ScenarioId::StalledCore);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.total_ticks, 0);
    }

    #[test]
    fn test_load_failure_scenario() {
        let result = ScenarioRunner::new(7).run(ScenarioId::LoadFailure);

        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.total_ticks, 0);
    }

    #[test]
    fn test_partial_machine_deterministic() {
        // Same seed should give the same machine and the same run
        let result1 = ScenarioRunner::new(42).run(ScenarioId::PartialMachine);
        let result2 = ScenarioRunner::new(42).run(ScenarioId::PartialMachine);

        assert!(result1.passed, "{:?}", result1.failure_reason);
        assert_eq!(result1.cells, result2.cells);
        assert_eq!(result1.metrics.reports_applied, result2.metrics.reports_applied);
        assert_eq!(result1.metrics.packets_delivered, result2.metrics.packets_delivered);
        assert_eq!(result1.metrics.final_mean, result2.metrics.final_mean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_run_ends_on_operator_quit() {
        let runner = ScenarioRunner::new(1).with_ticks(100_000);
        let (tx, rx) = mpsc::channel(4);
        let live = tokio::spawn(async move {
            runner
                .run_live(Machine::new(1, 1, 18), heatmesh_core::LogRenderer::default(), rx)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        tx.send(OperatorInput::SetBoundary(Direction::North, 80.0)).await.unwrap();
        tx.send(OperatorInput::Quit).await.unwrap();

        let stats = live.await.unwrap().unwrap();
        assert!(stats.applied > 0);
        assert_eq!(stats.discarded, 0);
    }
}
