//! Synchronization Controller - the two-phase start/finish barrier.
//!
//! ```text
//!   LOADED --(all cores at sync0)--> READY --(start signal)--> RUNNING
//!   RUNNING --(all cores at exit)--> DONE
//! ```
//!
//! Each phase is a single blocking wait on the barrier primitive, bounded by
//! a deployment-configured timeout. A timeout is fatal for the whole run.

use crate::error::DeployError;
use heatmesh_env::{Phase, SyncPrimitive};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Barrier timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Time allowed for every core to reach sync0 after loading
    pub ready_timeout_ms: u64,

    /// Time allowed for every core to reach exit after the start signal
    pub done_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 5_000,
            done_timeout_ms: 60_000,
        }
    }
}

impl SyncConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn done_timeout(&self) -> Duration {
        Duration::from_millis(self.done_timeout_ms)
    }
}

/// Collective state of the active cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Loaded,
    Ready,
    Running,
    Done,
}

/// Drives every active core through the barrier protocol.
pub struct SyncController<S: SyncPrimitive> {
    sync: Arc<S>,
    expected: usize,
    config: SyncConfig,
    state: RunState,
}

impl<S: SyncPrimitive> std::fmt::Debug for SyncController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("expected", &self.expected)
            .field("config", &self.config)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<S: SyncPrimitive> SyncController<S> {
    /// Creates a controller for `expected` loaded cores.
    pub fn new(sync: Arc<S>, expected: usize, config: SyncConfig) -> Self {
        Self {
            sync,
            expected,
            config,
            state: RunState::Loaded,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn expected_cores(&self) -> usize {
        self.expected
    }

    /// Waits for every core to reach sync0, then releases them all at once.
    ///
    /// The start signal is broadcast exactly once; calling `start` again
    /// after a successful start is a no-op.
    pub async fn start(&mut self) -> Result<(), DeployError> {
        if self.state >= RunState::Running {
            return Ok(());
        }

        if self.state == RunState::Loaded {
            info!("Waiting for {} cores to reach {}", self.expected, Phase::Sync0);
            self.wait_phase(Phase::Sync0, self.config.ready_timeout()).await?;
            self.state = RunState::Ready;
        }

        self.sync.broadcast_signal(Phase::Sync0)?;
        self.state = RunState::Running;
        info!("All {} cores ready; start signal sent", self.expected);
        Ok(())
    }

    /// Waits for every running core to reach exit.
    pub async fn wait_done(&mut self) -> Result<(), DeployError> {
        match self.state {
            RunState::Running => {}
            RunState::Done => return Ok(()),
            other => {
                return Err(DeployError::Protocol(format!(
                    "wait_done called in state {:?}",
                    other
                )))
            }
        }

        self.wait_phase(Phase::Exit, self.config.done_timeout()).await?;
        self.state = RunState::Done;
        info!("All {} cores reached {}", self.expected, Phase::Exit);
        Ok(())
    }

    async fn wait_phase(&self, phase: Phase, timeout: Duration) -> Result<(), DeployError> {
        let timed_out = |reached| DeployError::SyncTimeout {
            phase,
            reached,
            expected: self.expected,
            timeout_ms: timeout.as_millis() as u64,
        };

        match tokio::time::timeout(timeout, self.sync.wait_for_phase(phase, self.expected)).await {
            Ok(Ok(reached)) if reached >= self.expected => Ok(()),
            Ok(Ok(reached)) => Err(timed_out(reached)),
            Ok(Err(e)) => Err(DeployError::Transport(e)),
            Err(_) => {
                let reached = self.sync.count_in_phase(phase);
                error!(
                    "Only {}/{} cores reached {} within {:?}",
                    reached, self.expected, phase, timeout
                );
                Err(timed_out(reached))
            }
        }
    }
}
