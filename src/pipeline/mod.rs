//! Live data pipeline feeding the viewer.
//!
//! A [`PipelineWorker`] runs on its own task. It sleeps until woken through a
//! [`PipelineWake`], then makes one pass over the most recent runs of the active
//! category: fetch samples, dark-correct, derive the plotted quantity and push
//! changed curves to the rendering context. Wakes that arrive while a pass is
//! running collapse into a single follow-up pass.
//!
//! Failures are isolated per slot: a run with missing fields or no finite samples
//! is skipped for this pass and retried on the next one.

pub mod analysis;
pub mod palette;

use crate::bus::EventSender;
use crate::config::PipelineConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::io::DeviceIo;
use crate::hardware::WaveformChannel;
use crate::messages::{DcmChannel, EventMessage, ScanCategory};
use crate::store::{RunMetadata, RunRecord, RunStore, ScanMode};
use crate::viewer::render::{
    read_plot, PlotSeries, RenderCommand, RenderSink, ScanStatus, SharedPlot, StatusTiming,
    YAxisSide,
};
use crate::viewer::SharedSettings;
use crate::viewer::ViewSettings;
use analysis::{backward_derivative, derivative_peak, derive, round_to, RunSamples, XAxis};
use palette::{slot_name, Palette, SlotStyle, DERIVATIVE_NAME, RUN_SLOTS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Level-triggered "maybe new data" signal.
///
/// At most one wake is remembered while the worker is busy.
#[derive(Debug, Clone, Default)]
pub struct PipelineWake(Arc<Notify>);

impl PipelineWake {
    /// New signal with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a pass.
    pub fn wake(&self) {
        self.0.notify_one();
    }

    async fn wait(&self) {
        self.0.notified().await;
    }
}

/// What one pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Runs considered.
    pub slots: usize,
    /// Curves sent to the rendering context.
    pub redrawn: Vec<String>,
    /// Curves removed because their slot is out of range.
    pub removed: Vec<String>,
    /// Slots skipped this pass.
    pub skipped: Vec<usize>,
}

/// Retrieval, correction and redraw-decision worker.
pub struct PipelineWorker {
    store: Arc<dyn RunStore>,
    live: Option<DeviceIo>,
    settings: SharedSettings,
    plot: SharedPlot,
    render: RenderSink,
    to_controller: EventSender,
    palette: Palette,
    config: PipelineConfig,
    wake: PipelineWake,
    passes: Arc<AtomicU64>,
}

impl PipelineWorker {
    /// Worker reading runs from `store` and drawing into `plot` through `render`.
    pub fn new(
        store: Arc<dyn RunStore>,
        settings: SharedSettings,
        plot: SharedPlot,
        render: RenderSink,
        to_controller: EventSender,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            live: None,
            settings,
            plot,
            render,
            to_controller,
            palette: Palette::standard(),
            config,
            wake: PipelineWake::new(),
            passes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Read in-progress fly scans straight from the hardware waveforms.
    pub fn with_live_source(mut self, io: DeviceIo) -> Self {
        self.live = Some(io);
        self
    }

    /// Handle used to request passes.
    pub fn wake_handle(&self) -> PipelineWake {
        self.wake.clone()
    }

    /// Counter of finished passes.
    pub fn pass_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.passes)
    }

    /// Run passes on wake until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.wake.wait().await;
                let report = self.tick().await;
                self.passes.fetch_add(1, Ordering::SeqCst);
                debug!(?report, "pipeline pass finished");
            }
        })
    }

    /// One pass over the recent runs of the active category.
    pub async fn tick(&self) -> TickReport {
        let settings = self.settings.read().await.clone();
        let depth = match settings.category {
            ScanCategory::Align => 1,
            _ => settings.history_depth.clamp(1, RUN_SLOTS),
        };
        let mut report = TickReport::default();

        let runs = match self.store.recent_runs(settings.category, depth).await {
            Ok(runs) => runs,
            Err(err) => {
                warn!(error = %err, "pipeline could not list runs");
                return report;
            }
        };
        report.slots = runs.len();

        let existing = read_plot(&self.plot).curve_names();
        for index in runs.len()..RUN_SLOTS {
            let name = slot_name(index);
            if existing.contains(&name) {
                self.render.send(RenderCommand::RemoveCurve(name.clone()));
                report.removed.push(name);
            }
        }

        for (index, run) in runs.iter().enumerate() {
            match self.process_slot(index, run, &settings).await {
                Ok(true) => report.redrawn.push(slot_name(index)),
                Ok(false) => {}
                Err(err) => {
                    if err.is_transient() {
                        debug!(slot = index, error = %err, "slot skipped this pass");
                    } else {
                        warn!(slot = index, error = %err, "slot failed");
                    }
                    report.skipped.push(index);
                }
            }
        }
        report
    }

    async fn process_slot(&self, index: usize, run: &RunRecord, settings: &ViewSettings) -> AppResult<bool> {
        let metadata = &run.metadata;
        let live = run.primary.is_empty() && metadata.mode == ScanMode::Fly && !run.is_complete();
        let samples = if live {
            self.live_samples(metadata).await?
        } else {
            RunSamples::from_record(run)?
        };

        let corrected = samples.dark_corrected(&metadata.dark_rates);
        let (x, y) = derive(&corrected, settings.y, settings.x, metadata.e0)?;
        let changed = self.publish(
            slot_name(index),
            &x,
            &y,
            self.palette.run_slot(index),
            YAxisSide::Left,
        );

        if index == 0 {
            self.report_newest(run, samples.len(), &x, &y, settings);
        }
        Ok(changed)
    }

    /// Send the curve unless the display already shows exactly this data.
    fn publish(&self, name: String, x: &[f64], y: &[f64], style: SlotStyle, axis: YAxisSide) -> bool {
        let unchanged = read_plot(&self.plot)
            .curve(&name)
            .map_or(false, |shown| shown.same_data(x, y));
        if unchanged {
            return false;
        }
        self.render.send(RenderCommand::SetCurve(PlotSeries {
            name,
            x: x.to_vec(),
            y: y.to_vec(),
            color: style.color,
            z_order: style.z_order,
            axis,
        }));
        true
    }

    fn report_newest(&self, run: &RunRecord, points: usize, x: &[f64], y: &[f64], settings: &ViewSettings) {
        let metadata = &run.metadata;
        let category = settings.category;

        let times = &run.primary.time;
        let timing = (points > 2).then(|| match metadata.mode {
            ScanMode::Step if times.len() >= 2 => {
                StatusTiming::LoopTime(round_to(times[times.len() - 1] - times[times.len() - 2], 2))
            }
            ScanMode::Step => StatusTiming::LoopTime(0.0),
            ScanMode::Fly => {
                let elapsed = chrono::Utc::now() - metadata.timestamp;
                StatusTiming::Elapsed(round_to(elapsed.num_milliseconds() as f64 / 1000.0, 1))
            }
        });
        self.render.send(RenderCommand::SetStatus(ScanStatus {
            points,
            total: (category != ScanCategory::Align).then_some(metadata.scan_points),
            timing,
        }));

        if category != ScanCategory::Align && metadata.scan_points > 0 {
            let percent = ((points + 1) * 100 / metadata.scan_points).min(100);
            self.to_controller
                .send(&EventMessage::ProgressBar(percent as u8));
        }

        if settings.derivative || category == ScanCategory::Calibration {
            let (dx, dy) = backward_derivative(x, y);
            if settings.derivative && !dx.is_empty() {
                self.publish(
                    DERIVATIVE_NAME.to_string(),
                    &dx,
                    &dy,
                    self.palette.derivative(),
                    YAxisSide::Right,
                );
            }
            if category == ScanCategory::Calibration && x.len() > 2 {
                self.report_calibration(metadata, settings.x, &dx, &dy);
            }
        }

        if category == ScanCategory::Align {
            if let Some(&last) = y.last() {
                self.to_controller.send(&EventMessage::DcmReadback {
                    channel: DcmChannel::I0,
                    value: round_to(last, 2),
                });
                self.to_controller.send(&EventMessage::DcmReadback {
                    channel: DcmChannel::I0Scaled,
                    value: round_to(last * self.config.align_ratio, 2),
                });
            }
        }
    }

    fn report_calibration(&self, metadata: &RunMetadata, x_axis: XAxis, dx: &[f64], dy: &[f64]) {
        let Some(peak) = derivative_peak(dx, dy) else {
            return;
        };
        let absolute = match x_axis {
            XAxis::RelativeEnergy => peak + metadata.e0,
            XAxis::AbsoluteEnergy => peak,
            XAxis::Index => return,
        };
        self.to_controller
            .send(&EventMessage::PeakEnergyLabel(round_to(absolute, 4)));
        self.to_controller.send(&EventMessage::EnergyDifferenceLabel(round_to(
            absolute - metadata.e0,
            4,
        )));
    }

    async fn live_samples(&self, metadata: &RunMetadata) -> AppResult<RunSamples> {
        let io = self.live.as_ref().ok_or_else(|| {
            DaqError::DataUnavailable(format!("fly run {} has no rows yet", metadata.uid))
        })?;
        let geometry = metadata.fly_geometry.ok_or_else(|| {
            DaqError::DataUnavailable(format!("fly run {} has no geometry", metadata.uid))
        })?;

        tokio::time::sleep(Duration::from_millis(self.config.live_read_delay_ms)).await;
        let mut columns: [Vec<f64>; 5] = Default::default();
        for (column, channel) in columns.iter_mut().zip(WaveformChannel::ALL) {
            *column = io.read_waveform(channel).await?.unwrap_or_default();
        }
        Ok(RunSamples::from_waveforms(columns, &geometry.encoder()))
    }
}
