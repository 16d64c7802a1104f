//! Display model owned by the rendering context.
//!
//! Nothing outside the rendering context mutates [`PlotModel`]. Other tasks send
//! [`RenderCommand`]s through a [`RenderSink`]; the context applies them in order.
//! Readers (the pipeline worker comparing curves before redrawing) take a shared
//! read lock on the model.

use crate::messages::{Axis, EngineState};
use crate::pipeline::palette::PlotColor;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Which y axis a curve is drawn against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YAxisSide {
    /// Primary axis.
    Left,
    /// Secondary axis (derivative).
    Right,
}

/// One named curve.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSeries {
    /// Curve name, e.g. `Data 0`.
    pub name: String,
    /// X values.
    pub x: Vec<f64>,
    /// Y values, same length as `x`.
    pub y: Vec<f64>,
    /// Line color.
    pub color: PlotColor,
    /// Stacking order, higher on top.
    pub z_order: i32,
    /// Y axis.
    pub axis: YAxisSide,
}

impl PlotSeries {
    /// True when `x` and `y` match this curve elementwise.
    pub fn same_data(&self, x: &[f64], y: &[f64]) -> bool {
        self.x == x && self.y == y
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// True for a curve without points.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Timing shown next to the point counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusTiming {
    /// Seconds between the last two step-scan points.
    LoopTime(f64),
    /// Seconds since a fly scan started.
    Elapsed(f64),
}

/// Scan status line.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScanStatus {
    /// Points recorded so far.
    pub points: usize,
    /// Points expected, when known.
    pub total: Option<usize>,
    /// Loop or elapsed time.
    pub timing: Option<StatusTiming>,
}

/// Everything the viewer draws.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotModel {
    curves: BTreeMap<String, PlotSeries>,
    /// X axis label.
    pub x_label: String,
    /// Y axis label.
    pub y_label: String,
    /// Scan-in-progress indicator.
    pub blink: bool,
    /// Whether the abort button accepts clicks.
    pub abort_enabled: bool,
    /// Controller engine state.
    pub engine: EngineState,
    /// Status line.
    pub status: ScanStatus,
    /// Start of the current fly scan, unix seconds.
    pub fly_start_time: Option<f64>,
    /// Number of commands applied, bumps on every change.
    pub revision: u64,
}

impl Default for PlotModel {
    fn default() -> Self {
        Self {
            curves: BTreeMap::new(),
            x_label: "Energy [eV]".to_string(),
            y_label: String::new(),
            blink: false,
            abort_enabled: true,
            engine: EngineState::Idle,
            status: ScanStatus::default(),
            fly_start_time: None,
            revision: 0,
        }
    }
}

impl PlotModel {
    /// Curve by name.
    pub fn curve(&self, name: &str) -> Option<&PlotSeries> {
        self.curves.get(name)
    }

    /// Names of all curves, sorted.
    pub fn curve_names(&self) -> Vec<String> {
        self.curves.keys().cloned().collect()
    }

    /// True when the right-hand axis has something to show.
    pub fn right_axis_visible(&self) -> bool {
        self.curves.values().any(|c| c.axis == YAxisSide::Right)
    }

    /// Apply one command.
    pub fn apply(&mut self, command: RenderCommand) {
        match command {
            RenderCommand::SetCurve(series) => {
                self.curves.insert(series.name.clone(), series);
            }
            RenderCommand::RemoveCurve(name) => {
                self.curves.remove(&name);
            }
            RenderCommand::RemoveCurves => self.curves.clear(),
            RenderCommand::SetAxisLabel { axis: Axis::X, label } => self.x_label = label,
            RenderCommand::SetAxisLabel { axis: Axis::Y, label } => self.y_label = label,
            RenderCommand::SetBlink(on) => self.blink = on,
            RenderCommand::SetAbortEnabled(enabled) => self.abort_enabled = enabled,
            RenderCommand::SetEngineState(state) => self.engine = state,
            RenderCommand::SetStatus(status) => self.status = status,
            RenderCommand::SetFlyStartTime(time) => self.fly_start_time = Some(time),
            RenderCommand::Flush(done) => {
                let _ = done.send(());
                return;
            }
        }
        self.revision += 1;
    }
}

/// Mutation requests marshalled to the rendering context.
#[derive(Debug)]
pub enum RenderCommand {
    /// Insert or replace a curve.
    SetCurve(PlotSeries),
    /// Remove a curve by name; missing curves are ignored.
    RemoveCurve(String),
    /// Remove every curve.
    RemoveCurves,
    /// Relabel an axis.
    SetAxisLabel {
        /// Axis.
        axis: Axis,
        /// Label text.
        label: String,
    },
    /// Scan indicator.
    SetBlink(bool),
    /// Abort button state.
    SetAbortEnabled(bool),
    /// Controller engine state.
    SetEngineState(EngineState),
    /// Status line.
    SetStatus(ScanStatus),
    /// Fly scan start time.
    SetFlyStartTime(f64),
    /// Acknowledged once every earlier command was applied.
    Flush(oneshot::Sender<()>),
}

/// Shared, read-mostly handle on the display model.
pub type SharedPlot = Arc<RwLock<PlotModel>>;

/// Read the shared model, ignoring poisoning.
pub fn read_plot(plot: &SharedPlot) -> RwLockReadGuard<'_, PlotModel> {
    plot.read().unwrap_or_else(PoisonError::into_inner)
}

/// Clonable sender of [`RenderCommand`]s.
#[derive(Clone, Debug)]
pub struct RenderSink {
    tx: mpsc::UnboundedSender<RenderCommand>,
}

impl RenderSink {
    /// Queue a command; dropped with a debug log once the context is gone.
    pub fn send(&self, command: RenderCommand) {
        if self.tx.send(command).is_err() {
            tracing::debug!("render context closed, command dropped");
        }
    }

    /// Wait until every command queued so far was applied.
    pub async fn flush(&self) {
        let (done, applied) = oneshot::channel();
        self.send(RenderCommand::Flush(done));
        let _ = applied.await;
    }
}

/// The task that owns display-model mutation.
pub struct RenderContext {
    model: SharedPlot,
    task: JoinHandle<()>,
}

impl RenderContext {
    /// Start the context with an empty model.
    pub fn spawn() -> (Self, RenderSink) {
        let model: SharedPlot = Arc::new(RwLock::new(PlotModel::default()));
        let (tx, mut rx) = mpsc::unbounded_channel::<RenderCommand>();
        let target = Arc::clone(&model);
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let mut plot = target.write().unwrap_or_else(PoisonError::into_inner);
                plot.apply(command);
            }
        });
        (Self { model, task }, RenderSink { tx })
    }

    /// Read handle on the model.
    pub fn model(&self) -> SharedPlot {
        Arc::clone(&self.model)
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.task.abort();
    }
}
