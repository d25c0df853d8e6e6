//! JSON exporter for heatmap playback.
//!
//! Exports every rendered heatmap frame so a run can be replayed or plotted
//! offline.

use heatmesh_core::{HeatmapRenderer, HeatmapSnapshot};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use tokio::time::Instant;

/// A single rendered frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeatmapFrame {
    /// Virtual time since the session started
    pub time_ms: u64,

    /// Edge temperatures in E, W, N, S order
    pub boundaries: [f64; 4],

    pub width: u32,
    pub height: u32,

    /// Row-major, `null` where no cell is hosted
    pub values: Vec<Option<f64>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean: Option<f64>,
}

impl HeatmapFrame {
    pub fn new(time_ms: u64, snapshot: &HeatmapSnapshot, boundaries: &[f64; 4]) -> Self {
        Self {
            time_ms,
            boundaries: *boundaries,
            width: snapshot.width,
            height: snapshot.height,
            values: snapshot.values.clone(),
            mean: snapshot.mean(),
        }
    }
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    pub scenario: String,
    pub seed: u64,

    /// Time of the last frame
    pub duration_ms: u64,

    /// All frames
    pub frames: Vec<HeatmapFrame>,

    /// Final results
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_ms: 0,
            frames: Vec::new(),
            passed: false,
            failure_reason: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: HeatmapFrame) {
        self.duration_ms = frame.time_ms;
        self.frames.push(frame);
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, failure_reason: Option<String>) {
        self.passed = passed;
        self.failure_reason = failure_reason;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

/// Renderer that records frames into a [`SimExport`].
///
/// Timestamps come from the tokio clock, so paused-clock runs export
/// virtual time.
#[derive(Debug)]
pub struct ExportRenderer {
    export: SimExport,
    started: Instant,
}

impl ExportRenderer {
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            export: SimExport::new(scenario, seed),
            started: Instant::now(),
        }
    }

    pub fn frames(&self) -> &[HeatmapFrame] {
        &self.export.frames
    }

    pub fn into_export(self) -> SimExport {
        self.export
    }
}

impl HeatmapRenderer for ExportRenderer {
    fn render(&mut self, frame: &HeatmapSnapshot, boundaries: &[f64; 4]) {
        let time_ms = self.started.elapsed().as_millis() as u64;
        self.export.add_frame(HeatmapFrame::new(time_ms, frame, boundaries));
    }
}
