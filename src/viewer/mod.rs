//! Viewer half: display settings and the handler for controller messages.

pub mod render;

use crate::bus::{EventHandler, EventSender};
use crate::messages::{Axis, EventMessage, ScanCategory};
use crate::pipeline::analysis::{XAxis, YQuantity};
use crate::pipeline::palette::DERIVATIVE_NAME;
use crate::pipeline::PipelineWake;
use async_trait::async_trait;
use render::{read_plot, RenderCommand, RenderSink, SharedPlot};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Operator-facing plot settings read by the pipeline on every tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewSettings {
    /// Active tab.
    pub category: ScanCategory,
    /// Plotted quantity.
    pub y: YQuantity,
    /// X axis mode.
    pub x: XAxis,
    /// Whether slot 0's derivative is drawn.
    pub derivative: bool,
    /// Number of recent runs overlaid.
    pub history_depth: usize,
    /// Measure-tab choices kept while another tab is active.
    saved: Option<(YQuantity, XAxis)>,
}

impl ViewSettings {
    /// Measure tab, transmittance against relative energy.
    pub fn new(history_depth: usize) -> Self {
        Self {
            category: ScanCategory::Measure,
            y: YQuantity::Transmittance,
            x: XAxis::RelativeEnergy,
            derivative: false,
            history_depth: history_depth.clamp(1, 10),
            saved: None,
        }
    }

    /// Switch tab and reset the per-tab defaults. Switching to the active tab is a no-op.
    ///
    /// Returns false when nothing changed.
    pub fn switch_tab(&mut self, category: ScanCategory) -> bool {
        if category == self.category {
            return false;
        }
        if self.category == ScanCategory::Measure {
            self.saved = Some((self.y, self.x));
        }
        match category {
            ScanCategory::Measure => {
                if let Some((y, x)) = self.saved.take() {
                    self.y = y;
                    self.x = x;
                }
                self.derivative = false;
            }
            ScanCategory::Calibration => {
                self.y = YQuantity::Transmittance;
                if self.x == XAxis::Index {
                    self.x = XAxis::RelativeEnergy;
                }
                self.derivative = true;
            }
            ScanCategory::Align => {
                self.y = YQuantity::I0;
                self.x = XAxis::Index;
                self.derivative = false;
            }
        }
        self.category = category;
        true
    }
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Shared settings handle.
pub type SharedSettings = Arc<RwLock<ViewSettings>>;

/// Viewer-side handler for controller -> viewer messages.
///
/// Every message is applied idempotently: a repeated message leaves the display
/// where the first delivery put it.
pub struct ViewerInbox {
    settings: SharedSettings,
    render: RenderSink,
    plot: SharedPlot,
    wake: PipelineWake,
    to_controller: EventSender,
}

impl ViewerInbox {
    /// Handler updating `settings`, rendering through `render` into `plot` and
    /// waking the pipeline.
    pub fn new(
        settings: SharedSettings,
        render: RenderSink,
        plot: SharedPlot,
        wake: PipelineWake,
        to_controller: EventSender,
    ) -> Self {
        Self {
            settings,
            render,
            plot,
            wake,
            to_controller,
        }
    }

    /// Announce the viewer so the controller re-sends the current tab.
    pub fn announce(&self) {
        self.to_controller.send(&EventMessage::ViewerInitialized);
    }

    /// Operator pressed the viewer's abort button.
    ///
    /// Refused while the controller keeps the button disabled. Returns true when
    /// the request was sent.
    pub fn request_abort(&self) -> bool {
        if !read_plot(&self.plot).abort_enabled {
            warn!("abort button disabled, request ignored");
            return false;
        }
        info!("abort requested from viewer");
        self.to_controller.send(&EventMessage::Abort);
        true
    }

    /// Operator picked a y quantity.
    pub async fn select_y(&self, y: YQuantity) {
        let changed = {
            let mut settings = self.settings.write().await;
            let changed = settings.y != y;
            settings.y = y;
            changed
        };
        if changed {
            self.render.send(RenderCommand::SetAxisLabel {
                axis: Axis::Y,
                label: y.label().to_string(),
            });
            self.wake.wake();
        }
    }

    /// Operator changed the history depth.
    pub async fn set_history_depth(&self, depth: usize) {
        self.settings.write().await.history_depth = depth.clamp(1, 10);
        self.wake.wake();
    }

    async fn tab_changed(&self, category: ScanCategory) {
        let (changed, y, derivative) = {
            let mut settings = self.settings.write().await;
            let changed = settings.switch_tab(category);
            (changed, settings.y, settings.derivative)
        };
        if !changed {
            debug!(%category, "tab unchanged");
            return;
        }
        info!(%category, "tab changed");
        if !derivative {
            self.render
                .send(RenderCommand::RemoveCurve(DERIVATIVE_NAME.to_string()));
        }
        self.render.send(RenderCommand::SetAxisLabel {
            axis: Axis::X,
            label: category.x_label().to_string(),
        });
        self.render.send(RenderCommand::SetAxisLabel {
            axis: Axis::Y,
            label: y.label().to_string(),
        });
        self.wake.wake();
    }
}

#[async_trait]
impl EventHandler for ViewerInbox {
    async fn handle(&self, message: EventMessage) {
        match message {
            EventMessage::TabChanged(category) => self.tab_changed(category).await,
            EventMessage::UpdateViewer => self.wake.wake(),
            EventMessage::SetAxisLabel { axis, label } => {
                self.render.send(RenderCommand::SetAxisLabel { axis, label })
            }
            EventMessage::SetBlink(on) => self.render.send(RenderCommand::SetBlink(on)),
            EventMessage::EngineState(state) => {
                self.render.send(RenderCommand::SetEngineState(state))
            }
            EventMessage::RemoveCurve(name) => self.render.send(RenderCommand::RemoveCurve(name)),
            EventMessage::RemoveCurves => self.render.send(RenderCommand::RemoveCurves),
            EventMessage::FlyStartTime(time) => {
                self.render.send(RenderCommand::SetFlyStartTime(time))
            }
            EventMessage::DisableAbortButton(disabled) => {
                self.render.send(RenderCommand::SetAbortEnabled(!disabled))
            }
            other => debug!(message = %other, "viewer ignores controller-bound message"),
        }
    }
}
