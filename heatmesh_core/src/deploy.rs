//! Deployment orchestration.
//!
//! ```text
//!  plan():  Machine -> map_cells -> build_nets -> assign_keys -> Router -> serialize_configs
//!  load():  routing tables -> shared buffers -> core configs -> application image
//!  launch(): load() -> sync0 barrier -> start signal
//! ```
//!
//! `plan` is pure and touches no device. `load` aborts on the first stage
//! with any failing node; nothing after it is attempted.

use crate::config::{serialize_configs, CoreConfig};
use crate::error::DeployError;
use crate::keys::{assign_keys, EdgeKeys, KeySpace, NetKeys};
use crate::nets::{build_nets, NetList};
use crate::routing::Router;
use crate::sync::{SyncConfig, SyncController};
use crate::telemetry::TelemetryConfig;
use crate::topology::{map_cells, Topology, TopologyConfig};
use heatmesh_env::{DeviceLoader, Machine, NodeCoord, NodeResults, RoutingTables, SyncPrimitive};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Every tunable of one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Diffusivity constant written into every cell config
    pub alpha: f64,

    /// Application image loaded onto every hosting core
    pub application: String,

    pub topology: TopologyConfig,
    pub keys: KeySpace,
    pub sync: SyncConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            alpha: 0.04,
            application: "heat.aplx".to_string(),
            topology: TopologyConfig::default(),
            keys: KeySpace::default(),
            sync: SyncConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DeploymentConfig {
    /// Reads a JSON config; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DeployError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DeployError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, DeployError> {
        let config: Self = serde_json::from_str(text).map_err(|e| DeployError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse but cannot run.
    pub fn validate(&self) -> Result<(), DeployError> {
        if !self.alpha.is_finite() {
            return Err(DeployError::config(format!("alpha must be finite, got {}", self.alpha)));
        }
        self.telemetry.validate()
    }
}

/// Everything needed to load a machine, computed without touching it.
#[derive(Debug, Clone)]
pub struct DeploymentPlan {
    pub topology: Topology,
    pub nets: NetList,
    pub keys: NetKeys,
    pub edge_keys: EdgeKeys,

    /// Grouped by node, ascending core within each node
    pub configs: Vec<CoreConfig>,

    pub routing_tables: RoutingTables,
    pub application: String,
}

impl DeploymentPlan {
    /// Number of cores that will run the application.
    pub fn expected_cores(&self) -> usize {
        self.configs.len()
    }

    /// Bytes of shared report buffer each node needs.
    pub fn shared_buffers(&self) -> impl Iterator<Item = (NodeCoord, usize)> + '_ {
        self.topology.nodes().map(|(node, cells)| (node, cells.len() * 4))
    }
}

/// Builds the full deployment plan for a machine.
pub fn plan<R: Router + ?Sized>(
    machine: &Machine,
    config: &DeploymentConfig,
    router: &R,
) -> Result<DeploymentPlan, DeployError> {
    config.validate()?;
    let topology = map_cells(machine, &config.topology)?;
    let nets = build_nets(&topology)?;
    let keys = assign_keys(&nets, &config.keys)?;
    let edge_keys = keys.edge_keys(&nets);

    let routing_tables = router.route(&nets, &keys, machine, &topology)?;
    let entries: usize = routing_tables.values().map(Vec::len).sum();
    info!(
        "Routed {} nets: {} entries on {} nodes",
        nets.len(),
        entries,
        routing_tables.len()
    );

    let configs = serialize_configs(&topology, &nets, &keys, config.alpha);

    Ok(DeploymentPlan {
        topology,
        nets,
        keys,
        edge_keys,
        configs,
        routing_tables,
        application: config.application.clone(),
    })
}

fn check_stage(stage: &str, results: NodeResults) -> Result<(), DeployError> {
    let failures: Vec<(NodeCoord, String)> = results
        .into_iter()
        .filter_map(|(node, r)| r.err().map(|e| (node, e.to_string())))
        .collect();

    if failures.is_empty() {
        debug!("{} loaded", stage);
        return Ok(());
    }
    for (node, reason) in &failures {
        error!("{} failed on {}: {}", stage, node, reason);
    }
    Err(DeployError::Load { failures })
}

/// Loads a plan onto a machine in order: routing tables, shared buffers,
/// core configs, application image.
pub async fn load<L: DeviceLoader + ?Sized>(plan: &DeploymentPlan, loader: &L) -> Result<(), DeployError> {
    info!("Loading routing tables onto {} nodes", plan.routing_tables.len());
    check_stage("Routing tables", loader.load_routing_tables(&plan.routing_tables).await)?;

    let mut results = NodeResults::new();
    for (node, size) in plan.shared_buffers() {
        results.insert(node, loader.alloc_shared(node, size).await);
    }
    check_stage("Shared buffers", results)?;

    let mut results = NodeResults::new();
    for core in &plan.configs {
        let node = core.location.node;
        if matches!(results.get(&node), Some(Err(_))) {
            continue;
        }
        let written = loader
            .write_core_memory(node, core.location.core, &core.config.to_bytes())
            .await;
        results.insert(node, written);
    }
    check_stage("Core configs", results)?;

    let cores = plan.topology.application_map();
    info!("Loading {} onto {} cores", plan.application, plan.expected_cores());
    check_stage("Application", loader.load_application(&plan.application, &cores).await)?;

    Ok(())
}

/// Loads the plan and releases every core through the start barrier.
///
/// Returns the running controller; the caller waits for completion.
pub async fn launch<L, S>(
    plan: &DeploymentPlan,
    loader: &L,
    sync: Arc<S>,
    config: &SyncConfig,
) -> Result<SyncController<S>, DeployError>
where
    L: DeviceLoader + ?Sized,
    S: SyncPrimitive,
{
    load(plan, loader).await?;
    let mut controller = SyncController::new(sync, plan.expected_cores(), config.clone());
    controller.start().await?;
    Ok(controller)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::RunState;
    use async_trait::async_trait;
    use heatmesh_env::{ApplicationMap, EnvError, Phase, RoutingEntry};
    use std::sync::Mutex;

    /// Installs one local-delivery entry per net on its source node.
    struct SourceOnlyRouter;

    impl Router for SourceOnlyRouter {
        fn route(
            &self,
            nets: &NetList,
            keys: &NetKeys,
            _machine: &Machine,
            placements: &Topology,
        ) -> Result<RoutingTables, EnvError> {
            let mut tables = RoutingTables::new();
            for net in nets.nets() {
                let cell = placements
                    .cell(net.source)
                    .ok_or_else(|| EnvError::RoutingError(format!("unplaced source {}", net.source)))?;
                let (key, mask) = keys.get(net.id);
                tables.entry(cell.node()).or_default().push(RoutingEntry {
                    key,
                    mask,
                    route: RoutingEntry::core_bit(cell.core()),
                });
            }
            Ok(tables)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Tables(usize),
        Alloc(NodeCoord, usize),
        Write(NodeCoord, u8),
        App(String, usize),
    }

    #[derive(Default)]
    struct RecordingLoader {
        ops: Mutex<Vec<Op>>,
        fail_alloc: Option<NodeCoord>,
        fail_app: Option<NodeCoord>,
    }

    impl RecordingLoader {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceLoader for RecordingLoader {
        async fn load_routing_tables(&self, tables: &RoutingTables) -> NodeResults {
            self.ops.lock().unwrap().push(Op::Tables(tables.len()));
            tables.keys().map(|n| (*n, Ok(()))).collect()
        }

        async fn alloc_shared(&self, node: NodeCoord, size: usize) -> Result<(), EnvError> {
            self.ops.lock().unwrap().push(Op::Alloc(node, size));
            if self.fail_alloc == Some(node) {
                return Err(EnvError::load_failed(node, "out of memory"));
            }
            Ok(())
        }

        async fn write_core_memory(&self, node: NodeCoord, core: u8, data: &[u8]) -> Result<(), EnvError> {
            assert_eq!(data.len(), 28);
            self.ops.lock().unwrap().push(Op::Write(node, core));
            Ok(())
        }

        async fn load_application(&self, image: &str, cores: &ApplicationMap) -> NodeResults {
            let total = cores.values().map(|c| c.len()).sum();
            self.ops.lock().unwrap().push(Op::App(image.to_string(), total));
            cores
                .keys()
                .map(|n| {
                    let result = if self.fail_app == Some(*n) {
                        Err(EnvError::load_failed(*n, "boot failed"))
                    } else {
                        Ok(())
                    };
                    (*n, result)
                })
                .collect()
        }
    }

    /// Barrier whose cores are all ready immediately.
    struct ReadyBarrier {
        cores: usize,
        signals: Mutex<Vec<Phase>>,
    }

    #[async_trait]
    impl SyncPrimitive for ReadyBarrier {
        async fn wait_for_phase(&self, _phase: Phase, _expected: usize) -> Result<usize, EnvError> {
            Ok(self.cores)
        }

        fn count_in_phase(&self, _phase: Phase) -> usize {
            self.cores
        }

        fn broadcast_signal(&self, phase: Phase) -> Result<(), EnvError> {
            self.signals.lock().unwrap().push(phase);
            Ok(())
        }
    }

    fn partial_machine() -> Machine {
        Machine::new(2, 1, 18).with_cores(NodeCoord::new(1, 0), 3)
    }

    #[test]
    fn test_plan_is_pure_and_complete() {
        let machine = partial_machine();
        let config = DeploymentConfig::default();
        let a = plan(&machine, &config, &SourceOnlyRouter).unwrap();
        let b = plan(&machine, &config, &SourceOnlyRouter).unwrap();

        assert_eq!(a.expected_cores(), 18);
        assert_eq!(a.keys.len(), 18 + 4);
        assert_eq!(a.configs, b.configs);
        assert_eq!(a.routing_tables, b.routing_tables);
        assert_eq!(
            a.shared_buffers().collect::<Vec<_>>(),
            vec![(NodeCoord::ORIGIN, 64), (NodeCoord::new(1, 0), 8)]
        );
    }

    #[test]
    fn test_plan_capacity_error_before_routing() {
        let config = DeploymentConfig {
            keys: KeySpace { base: 0, limit: 4 },
            ..Default::default()
        };
        let err = plan(&Machine::new(1, 1, 18), &config, &SourceOnlyRouter).unwrap_err();
        assert!(matches!(err, DeployError::Capacity(_)));
    }

    #[tokio::test]
    async fn test_load_order() {
        let plan = plan(&partial_machine(), &DeploymentConfig::default(), &SourceOnlyRouter).unwrap();
        let loader = RecordingLoader::default();
        load(&plan, &loader).await.unwrap();

        let ops = loader.ops();
        assert_eq!(ops[0], Op::Tables(plan.routing_tables.len()));
        assert_eq!(ops[1], Op::Alloc(NodeCoord::ORIGIN, 64));
        assert_eq!(ops[2], Op::Alloc(NodeCoord::new(1, 0), 8));

        let writes: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                Op::Write(n, c) => Some((*n, *c)),
                _ => None,
            })
            .collect();
        assert_eq!(writes.len(), 18);
        assert_eq!(writes[0], (NodeCoord::ORIGIN, 1));
        assert_eq!(writes[15], (NodeCoord::ORIGIN, 16));
        assert_eq!(writes[16], (NodeCoord::new(1, 0), 1));

        assert_eq!(ops.last(), Some(&Op::App("heat.aplx".to_string(), 18)));
    }

    #[tokio::test]
    async fn test_alloc_failure_aborts_before_configs() {
        let plan = plan(&partial_machine(), &DeploymentConfig::default(), &SourceOnlyRouter).unwrap();
        let loader = RecordingLoader {
            fail_alloc: Some(NodeCoord::new(1, 0)),
            ..Default::default()
        };
        let err = load(&plan, &loader).await.unwrap_err();

        match err {
            DeployError::Load { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, NodeCoord::new(1, 0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!loader.ops().iter().any(|op| matches!(op, Op::Write(..) | Op::App(..))));
    }

    #[tokio::test]
    async fn test_launch_starts_barrier_after_load() {
        let plan = plan(&partial_machine(), &DeploymentConfig::default(), &SourceOnlyRouter).unwrap();
        let loader = RecordingLoader::default();
        let barrier = Arc::new(ReadyBarrier {
            cores: 18,
            signals: Mutex::new(Vec::new()),
        });

        let controller = launch(&plan, &loader, barrier.clone(), &SyncConfig::default())
            .await
            .unwrap();
        assert_eq!(controller.state(), RunState::Running);
        assert_eq!(*barrier.signals.lock().unwrap(), vec![Phase::Sync0]);
    }

    #[tokio::test]
    async fn test_failed_application_never_signals() {
        let plan = plan(&partial_machine(), &DeploymentConfig::default(), &SourceOnlyRouter).unwrap();
        let loader = RecordingLoader {
            fail_app: Some(NodeCoord::ORIGIN),
            ..Default::default()
        };
        let barrier = Arc::new(ReadyBarrier {
            cores: 18,
            signals: Mutex::new(Vec::new()),
        });

        let result = launch(&plan, &loader, barrier.clone(), &SyncConfig::default()).await;
        assert!(matches!(result, Err(DeployError::Load { .. })));
        assert!(barrier.signals.lock().unwrap().is_empty());
    }

    #[test]
    fn test_config_from_json_defaults_missing_fields() {
        let config = DeploymentConfig::from_json(r#"{ "alpha": 0.1, "telemetry": { "initial_temperature": 20.0, "max_temperature": 80.0, "update_fps": 10 } }"#)
            .unwrap();

        assert_eq!(config.alpha, 0.1);
        assert_eq!(config.application, "heat.aplx");
        assert_eq!(config.telemetry.update_fps, 10);
        assert_eq!(config.topology, TopologyConfig::default());

        assert!(matches!(
            DeploymentConfig::from_json("{ not json"),
            Err(DeployError::Config(_))
        ));
    }

    #[test]
    fn test_config_rejects_unusable_temperature_bounds() {
        let negative = DeploymentConfig::from_json(r#"{ "telemetry": { "initial_temperature": 20.0, "max_temperature": -1.0, "update_fps": 10 } }"#);
        assert!(matches!(negative, Err(DeployError::Config(_))));

        let mut config = DeploymentConfig::default();
        config.telemetry.max_temperature = f64::NAN;
        let err = plan(&Machine::new(1, 1, 4), &config, &SourceOnlyRouter).unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));

        config.telemetry.max_temperature = 100.0;
        config.alpha = f64::INFINITY;
        assert!(config.validate().is_err());
    }
}
