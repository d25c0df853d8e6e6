//! HeatMesh TUI Dashboard Module
//! ==============================
//!
//! Terminal heatmap and boundary console for a running simulation.
//! Uses Ratatui for rendering and Crossbeam for frame delivery.
//!
//! Enable with the `dashboard` feature flag.
//!
//! Features:
//! - Live heatmap, one colored block per cell (blue = cold, red = hot)
//! - Frame statistics (min / max / mean)
//! - Boundary panel with the four edge temperatures
//!
//! Keys: `Tab` selects an edge, `Up`/`Down` (or `+`/`-`) change it, `q` quits.

use std::io;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TrySendError};
use crossterm::{
    cursor::Show,
    event::{self, Event, KeyCode},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction as LayoutDirection, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Row, Table},
    Frame, Terminal,
};
use tokio::sync::mpsc;

use crate::telemetry::{clamp_temperature, HeatmapRenderer, HeatmapSnapshot, OperatorInput};
use crate::topology::Direction;

// =============================================================================
// FRAME PACKET (Sent from the controller to the dashboard)
// =============================================================================

/// One rendered frame with the boundary values in force when it was taken.
#[derive(Debug, Clone)]
pub struct DashboardFrame {
    pub snapshot: HeatmapSnapshot,
    pub boundaries: [f64; 4],
}

/// Renderer that forwards frames to the dashboard thread.
///
/// Frames are dropped when the dashboard falls behind.
pub struct ChannelRenderer {
    tx: Sender<DashboardFrame>,
}

impl ChannelRenderer {
    pub fn new(tx: Sender<DashboardFrame>) -> Self {
        Self { tx }
    }
}

impl HeatmapRenderer for ChannelRenderer {
    fn render(&mut self, frame: &HeatmapSnapshot, boundaries: &[f64; 4]) {
        let packet = DashboardFrame {
            snapshot: frame.clone(),
            boundaries: *boundaries,
        };
        if let Err(TrySendError::Full(_)) = self.tx.try_send(packet) {
            tracing::debug!("Dashboard behind, frame dropped");
        }
    }
}

/// Maps a temperature onto a blue-to-red gradient.
pub fn temperature_color(value: f64, max: f64) -> Color {
    let t = if max > 0.0 { (value / max).clamp(0.0, 1.0) } else { 0.0 };
    let r = (255.0 * t) as u8;
    let b = (255.0 * (1.0 - t)) as u8;
    let g = (255.0 * (1.0 - (2.0 * t - 1.0).abs()) * 0.6) as u8;
    Color::Rgb(r, g, b)
}

/// Leaves raw mode and the alternate screen when dropped.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, Show);
    }
}

// =============================================================================
// HEATMAP DASHBOARD
// =============================================================================

/// TUI dashboard for one telemetry session.
pub struct HeatmapDashboard {
    rx: Receiver<DashboardFrame>,
    commands: mpsc::Sender<OperatorInput>,
    max_temperature: f64,
    step: f64,
    selected: Direction,
    latest: Option<DashboardFrame>,

    /// Requested edge values, shown before the controller confirms them
    pending: [f64; 4],

    frame_count: usize,
}

impl HeatmapDashboard {
    /// Create a new dashboard on the frame receiver and command sender.
    pub fn new(
        rx: Receiver<DashboardFrame>,
        commands: mpsc::Sender<OperatorInput>,
        initial_temperature: f64,
        max_temperature: f64,
    ) -> Self {
        Self {
            rx,
            commands,
            max_temperature,
            step: 5.0,
            selected: Direction::East,
            latest: None,
            pending: [initial_temperature; 4],
            frame_count: 0,
        }
    }

    pub fn selected(&self) -> Direction {
        self.selected
    }

    /// Moves the selection to the next edge.
    pub fn select_next(&mut self) {
        let next = (self.selected.index() + 1) % Direction::ALL.len();
        self.selected = Direction::ALL[next];
    }

    /// Changes the selected edge by `delta` and queues the command.
    ///
    /// Returns false once the controller has gone away.
    pub fn adjust(&mut self, delta: f64) -> bool {
        let i = self.selected.index();
        self.pending[i] = clamp_temperature(self.pending[i] + delta, self.max_temperature);
        self.commands
            .blocking_send(OperatorInput::SetBoundary(self.selected, self.pending[i]))
            .is_ok()
    }

    /// Drains every queued frame, keeping the newest.
    pub fn drain_frames(&mut self) {
        while let Ok(frame) = self.rx.try_recv() {
            self.frame_count += 1;
            self.latest = Some(frame);
        }
    }

    /// Run the TUI main loop (blocks until 'q' pressed or the session ends).
    ///
    /// Must run on a thread outside the async runtime.
    pub fn run(&mut self) -> io::Result<()> {
        // Setup terminal; the guard restores it on every exit path
        enable_raw_mode()?;
        let _restore = TerminalGuard;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend)?;

        loop {
            self.drain_frames();
            if self.commands.is_closed() {
                break;
            }

            terminal.draw(|f| self.ui(f))?;

            if event::poll(Duration::from_millis(50))? {
                if let Event::Key(key) = event::read()? {
                    let alive = match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => {
                            let _ = self.commands.blocking_send(OperatorInput::Quit);
                            false
                        }
                        KeyCode::Tab => {
                            self.select_next();
                            true
                        }
                        KeyCode::Up | KeyCode::Char('+') => self.adjust(self.step),
                        KeyCode::Down | KeyCode::Char('-') => self.adjust(-self.step),
                        _ => true,
                    };
                    if !alive {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn heatmap_lines(&self, snapshot: &HeatmapSnapshot) -> Vec<Line<'static>> {
        // North at the top
        (0..snapshot.height)
            .rev()
            .map(|y| {
                let spans: Vec<Span> = (0..snapshot.width)
                    .map(|x| match snapshot.get(x, y) {
                        Some(v) => Span::styled(
                            "██",
                            Style::default().fg(temperature_color(v, self.max_temperature)),
                        ),
                        None => Span::styled("··", Style::default().fg(Color::DarkGray)),
                    })
                    .collect();
                Line::from(spans)
            })
            .collect()
    }

    /// Render the UI
    fn ui(&self, f: &mut Frame) {
        let chunks = Layout::default()
            .direction(LayoutDirection::Vertical)
            .margin(1)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(5),    // Heatmap + boundaries
                Constraint::Length(1), // Footer
            ])
            .split(f.area());

        // === HEADER ===
        let stats = self
            .latest
            .as_ref()
            .map(|frame| {
                format!(
                    "min {:.1}  max {:.1}  mean {:.1}",
                    frame.snapshot.min().unwrap_or(0.0),
                    frame.snapshot.max().unwrap_or(0.0),
                    frame.snapshot.mean().unwrap_or(0.0)
                )
            })
            .unwrap_or_else(|| "waiting for telemetry".to_string());
        let header = Paragraph::new(Line::from(vec![
            Span::styled("HeatMesh", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw("  |  "),
            Span::styled(stats, Style::default().fg(Color::Cyan)),
            Span::raw("  |  "),
            Span::raw(format!("Frame: {}", self.frame_count)),
        ]))
        .block(Block::default().borders(Borders::BOTTOM));
        f.render_widget(header, chunks[0]);

        let body = Layout::default()
            .direction(LayoutDirection::Horizontal)
            .constraints([Constraint::Min(20), Constraint::Length(30)])
            .split(chunks[1]);

        // === HEATMAP ===
        let lines = self
            .latest
            .as_ref()
            .map(|frame| self.heatmap_lines(&frame.snapshot))
            .unwrap_or_default();
        let heatmap = Paragraph::new(lines).block(Block::default().title("Heatmap").borders(Borders::ALL));
        f.render_widget(heatmap, body[0]);

        // === BOUNDARIES ===
        let confirmed = self.latest.as_ref().map(|frame| frame.boundaries).unwrap_or(self.pending);
        let rows: Vec<Row> = Direction::ALL
            .iter()
            .map(|dir| {
                let i = dir.index();
                let style = if *dir == self.selected {
                    Style::default().add_modifier(Modifier::REVERSED)
                } else {
                    Style::default()
                };
                Row::new(vec![
                    Span::raw(dir.name()),
                    Span::styled(
                        format!("{:.1}", confirmed[i]),
                        Style::default().fg(temperature_color(confirmed[i], self.max_temperature)),
                    ),
                    Span::raw(format!("{:.1}", self.pending[i])),
                ])
                .style(style)
            })
            .collect();

        let header = Row::new(["Edge", "Sent", "Req"].map(|h| {
            Span::styled(h, Style::default().add_modifier(Modifier::BOLD))
        }));
        let table = Table::new(
            rows,
            [Constraint::Length(8), Constraint::Length(8), Constraint::Length(8)],
        )
        .header(header)
        .block(Block::default().title("Boundaries").borders(Borders::ALL));
        f.render_widget(table, body[1]);

        // === FOOTER ===
        let footer = Paragraph::new("Tab: edge  Up/Down: +/-5  q: quit")
            .style(Style::default().fg(Color::DarkGray));
        f.render_widget(footer, chunks[2]);
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> HeatmapSnapshot {
        HeatmapSnapshot {
            width: 2,
            height: 1,
            values: vec![Some(10.0), None],
        }
    }

    #[test]
    fn test_temperature_color_extremes() {
        assert_eq!(temperature_color(0.0, 100.0), Color::Rgb(0, 0, 255));
        assert_eq!(temperature_color(100.0, 100.0), Color::Rgb(255, 0, 0));
        assert_eq!(temperature_color(500.0, 100.0), Color::Rgb(255, 0, 0));
    }

    #[test]
    fn test_channel_renderer_drops_when_full() {
        let (tx, rx) = crossbeam::channel::bounded(1);
        let mut renderer = ChannelRenderer::new(tx);

        renderer.render(&snapshot(), &[1.0; 4]);
        renderer.render(&snapshot(), &[2.0; 4]);

        assert_eq!(rx.len(), 1);
        assert_eq!(rx.recv().unwrap().boundaries, [1.0; 4]);
    }

    #[test]
    fn test_adjust_clamps_and_queues() {
        let (_frame_tx, frame_rx) = crossbeam::channel::unbounded();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let mut dashboard = HeatmapDashboard::new(frame_rx, cmd_tx, 50.0, 100.0);

        dashboard.select_next();
        assert_eq!(dashboard.selected(), Direction::West);
        for _ in 0..20 {
            assert!(dashboard.adjust(5.0));
            cmd_rx.try_recv().unwrap();
        }
        assert!(dashboard.adjust(5.0));
        assert_eq!(
            cmd_rx.try_recv().unwrap(),
            OperatorInput::SetBoundary(Direction::West, 100.0)
        );
    }

    #[test]
    fn test_adjust_with_negative_max_stays_at_zero() {
        let (_frame_tx, frame_rx) = crossbeam::channel::unbounded();
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let mut dashboard = HeatmapDashboard::new(frame_rx, cmd_tx, 50.0, -1.0);

        assert!(dashboard.adjust(5.0));
        assert_eq!(
            cmd_rx.try_recv().unwrap(),
            OperatorInput::SetBoundary(Direction::East, 0.0)
        );
    }

    #[test]
    fn test_drain_keeps_newest_frame() {
        let (frame_tx, frame_rx) = crossbeam::channel::unbounded();
        let (cmd_tx, _cmd_rx) = mpsc::channel(1);
        let mut dashboard = HeatmapDashboard::new(frame_rx, cmd_tx, 50.0, 100.0);

        for i in 0..3 {
            frame_tx
                .send(DashboardFrame {
                    snapshot: snapshot(),
                    boundaries: [i as f64; 4],
                })
                .unwrap();
        }
        dashboard.drain_frames();

        assert_eq!(dashboard.frame_count, 3);
        assert_eq!(dashboard.latest.unwrap().boundaries, [2.0; 4]);
    }
}
