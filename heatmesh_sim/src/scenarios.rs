//! Deployment scenarios run against the emulated mesh.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// HM-001: 2x2 fully populated machine, uniform edges
    SteadyState,

    /// HM-002: 3x3 machine with seeded degraded nodes
    PartialMachine,

    /// HM-003: one node with a single application core
    SingleCell,

    /// HM-004: operator drives east hot and west cold mid-run
    BoundarySweep,

    // ═══════════════════════════════════════════════════
    // FAULT SCENARIOS
    // ═══════════════════════════════════════════════════
    /// HM-005: one core never reaches the start barrier
    StalledCore,

    /// HM-006: one node sends short report packets
    CorruptReports,

    /// HM-007: one node rejects its config write
    LoadFailure,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::SteadyState,
            ScenarioId::PartialMachine,
            ScenarioId::SingleCell,
            ScenarioId::BoundarySweep,
            ScenarioId::StalledCore,
            ScenarioId::CorruptReports,
            ScenarioId::LoadFailure,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "steady_state",
            ScenarioId::PartialMachine => "partial_machine",
            ScenarioId::SingleCell => "single_cell",
            ScenarioId::BoundarySweep => "boundary_sweep",
            ScenarioId::StalledCore => "stalled_core",
            ScenarioId::CorruptReports => "corrupt_reports",
            ScenarioId::LoadFailure => "load_failure",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::SteadyState => "2x2 machine, all edges at the initial temperature, heat fills the grid",
            ScenarioId::PartialMachine => "3x3 machine with half its nodes degraded, irregular grid still reports",
            ScenarioId::SingleCell => "1x1 machine with one application core, anchor-only grid",
            ScenarioId::BoundarySweep => "East edge to 100, west edge to 0, gradient forms across the grid",
            ScenarioId::StalledCore => "One core never reaches sync0, start barrier times out",
            ScenarioId::CorruptReports => "One node truncates its reports, listener discards them",
            ScenarioId::LoadFailure => "One node rejects its core configs, nothing is started",
        }
    }

    /// True if the scenario passes by the deployment failing.
    pub fn expects_failure(&self) -> bool {
        matches!(self, ScenarioId::StalledCore | ScenarioId::LoadFailure)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "steady_state" | "steadystate" | "hm-001" => Ok(ScenarioId::SteadyState),
            "partial_machine" | "partialmachine" | "hm-002" => Ok(ScenarioId::PartialMachine),
            "single_cell" | "singlecell" | "hm-003" => Ok(ScenarioId::SingleCell),
            "boundary_sweep" | "boundarysweep" | "hm-004" => Ok(ScenarioId::BoundarySweep),
            "stalled_core" | "stalledcore" | "hm-005" => Ok(ScenarioId::StalledCore),
            "corrupt_reports" | "corruptreports" | "hm-006" => Ok(ScenarioId::CorruptReports),
            "load_failure" | "loadfailure" | "hm-007" => Ok(ScenarioId::LoadFailure),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
