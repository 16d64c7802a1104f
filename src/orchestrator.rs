//! Scan orchestration on the controller side.
//!
//! The [`Orchestrator`] is the only component that issues hardware writes while a
//! scan is running. Step scans are delegated point by point to a [`PlanExecutor`];
//! fly scans go through the [`Flyer`]. Every scan ends with the same cleanup
//! sequence, whether it succeeded, failed or was aborted.
//!
//! A pause request holds a step scan before its next point and stops a fly sweep
//! in place; resuming continues where the scan stopped.

use crate::bus::EventSender;
use crate::config::{FlyerConfig, ScanConfig, XafsConfig};
use crate::error::{AppResult, DaqError};
use crate::flyer::{FlyScanPlan, Flyer, FlyerSession};
use crate::physics::energy_to_angle;
use crate::hardware::io::DeviceIo;
use crate::hardware::ScalarChannel;
use crate::messages::{EngineState, EventMessage, ScanCategory};
use crate::store::{
    ChannelValues, DarkRates, FlyGeometry, RunExit, RunMetadata, RunStore, ScanMode,
    SlitPositions, StepRow,
};
use crate::trajectory::{self, EnergyStepSequence, ScanSegmentSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Generic plan-execution engine for step scans.
///
/// `move_to` returns once the monochromator arrived.
#[async_trait]
pub trait PlanExecutor: Send + Sync {
    /// Move the monochromator to `energy` (absolute, eV) and wait for arrival.
    async fn move_to(&self, energy: f64) -> anyhow::Result<()>;

    /// Counting time used by subsequent triggers.
    async fn set_dwell(&self, seconds: f64) -> anyhow::Result<()>;

    /// Trigger the counters and return their readings.
    async fn trigger_and_read(&self) -> anyhow::Result<ChannelValues>;

    /// Count for `preset` seconds with the beam shutter closed.
    async fn count(&self, preset: f64) -> anyhow::Result<ChannelValues>;
}

/// Fly-scan parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlySettings {
    /// Start energy relative to E0, eV.
    pub start: f64,
    /// Stop energy relative to E0, eV.
    pub stop: f64,
    /// Theta speed during the sweep, degrees per second.
    pub speed: f64,
    /// Encoder counts per sample.
    pub encoder_steps: f64,
    /// Encoder direction relative to theta.
    pub encoder_sign: f64,
    /// Number of sweeps.
    pub repeats: usize,
}

/// What to run.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanKind {
    /// One step scan.
    Step(ScanSegmentSpec),
    /// The same step scan `repeats` times, one run each.
    RepeatedStep {
        /// Trajectory.
        spec: ScanSegmentSpec,
        /// Number of passes.
        repeats: usize,
    },
    /// Continuous sweeps.
    Fly(FlySettings),
}

/// A scan request from the operator.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    /// Tab the scan was started from.
    pub category: ScanCategory,
    /// Edge energy, eV.
    pub e0: f64,
    /// Scan kind and its parameters.
    pub kind: ScanKind,
    /// Operator name recorded with each run.
    pub operator: String,
    /// Amplifier gain exponents.
    pub gains: ChannelValues,
    /// Slit positions, if read.
    pub slits: Option<SlitPositions>,
    /// Ring current, mA.
    pub beam_current: Option<f64>,
}

impl ScanRequest {
    /// Request with empty optional metadata.
    pub fn new(category: ScanCategory, e0: f64, kind: ScanKind) -> Self {
        Self {
            category,
            e0,
            kind,
            operator: String::new(),
            gains: ChannelValues::default(),
            slits: None,
            beam_current: None,
        }
    }

    fn metadata(&self, mode: ScanMode, points: usize, dark_rates: DarkRates) -> RunMetadata {
        let mut metadata = RunMetadata::new(self.category, mode, self.e0, points);
        metadata.dark_rates = dark_rates;
        metadata.gains = self.gains;
        metadata.slits = self.slits;
        metadata.beam_current = self.beam_current;
        metadata.operator = self.operator.clone();
        metadata
    }
}

/// Validated request, ready to touch hardware.
enum Prepared {
    Step {
        sequence: EnergyStepSequence,
        repeats: usize,
    },
    Fly(FlySettings),
}

/// Sequences scans, dark-current measurement and abort.
pub struct Orchestrator {
    executor: Arc<dyn PlanExecutor>,
    io: DeviceIo,
    flyer: Flyer,
    store: Arc<dyn RunStore>,
    events: EventSender,
    config: ScanConfig,
    flyer_config: FlyerConfig,
    dark_rates: RwLock<DarkRates>,
    pause: watch::Sender<bool>,
}

impl Orchestrator {
    /// Orchestrator publishing controller -> viewer messages on `events`.
    pub fn new(
        executor: Arc<dyn PlanExecutor>,
        io: DeviceIo,
        store: Arc<dyn RunStore>,
        events: EventSender,
        config: &XafsConfig,
    ) -> Self {
        Self {
            executor,
            flyer: Flyer::new(io.clone(), config.flyer.clone()),
            io,
            store,
            events,
            config: config.scan.clone(),
            flyer_config: config.flyer.clone(),
            dark_rates: RwLock::new(DarkRates::default()),
            pause: watch::channel(false).0,
        }
    }

    /// Dark-current rates recorded with the next step scans.
    pub async fn dark_rates(&self) -> DarkRates {
        *self.dark_rates.read().await
    }

    /// Count with the shutter closed and keep `counts / preset` as dark rates.
    pub async fn measure_dark_current(&self) -> AppResult<DarkRates> {
        let preset = self.config.dark_preset_s;
        let counts = self
            .executor
            .count(preset)
            .await
            .map_err(|err| DaqError::Device(format!("dark current count: {err:#}")))?;
        let rates = counts.per_second(preset);
        *self.dark_rates.write().await = rates;
        info!(
            i0 = rates.i0,
            it = rates.it,
            i_f = rates.i_f,
            ir = rates.ir,
            "dark current measured"
        );
        Ok(rates)
    }

    /// Request an abort. Only the first request of a scan stops the motor.
    ///
    /// Returns true when this call triggered the abort.
    pub async fn abort(&self) -> bool {
        if !self.io.abort_flag().request() {
            debug!("abort already in progress");
            return false;
        }
        warn!("scan abort requested");
        self.pause.send_replace(false);
        self.events.send(&EventMessage::DisableAbortButton(true));
        self.events
            .send(&EventMessage::EngineState(EngineState::Aborting));
        if let Err(err) = self.io.stop_motion().await {
            warn!(error = %err, "motor stop failed");
        }
        true
    }

    /// Ask the running scan to pause. Returns false when a pause was already pending.
    ///
    /// The fly completion timeout keeps counting while a sweep is paused.
    pub fn pause(&self) -> bool {
        let requested = self.pause.send_if_modified(|paused| !std::mem::replace(paused, true));
        if requested {
            info!("scan pause requested");
        }
        requested
    }

    /// Release a pause. Returns false when the scan was not paused.
    pub fn resume(&self) -> bool {
        let released = self.pause.send_if_modified(|paused| std::mem::replace(paused, false));
        if released {
            info!("scan resume requested");
        }
        released
    }

    /// True while a pause is requested.
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Shift the theta offset so that the edge measured `offset_energy` above `e0`
    /// lands on `e0`, then return to `e0`.
    ///
    /// The axis is moved onto the measured edge and the new offset becomes
    /// `theta(e0) - readback + current offset`. The write is refused once an abort
    /// was requested. Returns the offset written, degrees.
    pub async fn compensate_energy_offset(&self, e0: f64, offset_energy: f64) -> AppResult<f64> {
        self.io.abort_flag().clear();
        let written = self.write_theta_offset(e0, offset_energy).await;
        info!(e0, "returning to edge energy");
        let returned = self.move_to(e0).await;
        let offset = written?;
        returned?;
        Ok(offset)
    }

    /// Zero the theta offset, then derive a new one from an operator-entered
    /// `offset_energy`. The axis stays on the measured edge.
    pub async fn set_energy_offset(&self, e0: f64, offset_energy: f64) -> AppResult<f64> {
        self.io.abort_flag().clear();
        self.io.write(ScalarChannel::ThetaOffset, 0.0).await?;
        self.write_theta_offset(e0, offset_energy).await
    }

    async fn write_theta_offset(&self, e0: f64, offset_energy: f64) -> AppResult<f64> {
        let ideal = energy_to_angle(e0)?;
        self.move_to(e0 + offset_energy).await?;
        let theta = self.io.read(ScalarChannel::MotorPosition).await?;
        let previous = self.io.read(ScalarChannel::ThetaOffset).await?;
        let offset = ideal - theta + previous;
        self.io.write(ScalarChannel::ThetaOffset, offset).await?;
        info!(e0, offset_energy, previous, offset, "theta offset compensated");
        Ok(offset)
    }

    /// Run a scan request and return the ids of the runs it recorded.
    ///
    /// An invalid request fails before any hardware access. Once started, cleanup
    /// always runs; the scan's own error takes precedence over a cleanup error.
    pub async fn run(&self, request: ScanRequest) -> AppResult<Vec<Uuid>> {
        let prepared = match &request.kind {
            ScanKind::Step(spec) => Prepared::Step {
                sequence: trajectory::build(spec)?.to_absolute(request.e0),
                repeats: 1,
            },
            ScanKind::RepeatedStep { spec, repeats } => Prepared::Step {
                sequence: trajectory::build(spec)?.to_absolute(request.e0),
                repeats: *repeats,
            },
            ScanKind::Fly(settings) => {
                if settings.repeats == 0 {
                    return Err(DaqError::Configuration(
                        "fly scan needs at least one repeat".to_string(),
                    ));
                }
                Prepared::Fly(*settings)
            }
        };
        if let Prepared::Step { repeats: 0, .. } = prepared {
            return Err(DaqError::Configuration(
                "step scan needs at least one repeat".to_string(),
            ));
        }

        self.io.abort_flag().clear();
        self.pause.send_replace(false);
        info!(category = %request.category, e0 = request.e0, "scan started");
        self.events.send(&EventMessage::SetBlink(true));
        self.events
            .send(&EventMessage::EngineState(EngineState::Running));

        let mut runs = Vec::new();
        let mut original_speed = None;
        let outcome = match prepared {
            Prepared::Step { sequence, repeats } => {
                self.step_runs(&request, &sequence, repeats, &mut runs).await
            }
            Prepared::Fly(settings) => {
                self.fly_runs(&request, &settings, &mut runs, &mut original_speed)
                    .await
            }
        };
        let cleanup = self.cleanup(request.e0, original_speed).await;

        match (outcome, cleanup) {
            (Ok(()), Ok(())) => {
                info!(runs = runs.len(), "scan finished");
                Ok(runs)
            }
            (Err(err), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(error = %cleanup_err, "cleanup after failed scan also failed");
                }
                match &err {
                    DaqError::Aborted => info!("scan aborted"),
                    other => warn!(error = %other, "scan failed"),
                }
                Err(err)
            }
            (Ok(()), Err(cleanup_err)) => Err(cleanup_err),
        }
    }

    async fn step_runs(
        &self,
        request: &ScanRequest,
        sequence: &EnergyStepSequence,
        repeats: usize,
        runs: &mut Vec<Uuid>,
    ) -> AppResult<()> {
        let dark_rates = self.dark_rates().await;
        for pass in 0..repeats {
            let metadata = request.metadata(ScanMode::Step, sequence.len(), dark_rates);
            let uid = self.store.open_run(metadata).await?;
            runs.push(uid);
            info!(%uid, pass = pass + 1, of = repeats, points = sequence.len(), "step run opened");
            let result = self.step_pass(uid, sequence).await;
            self.finish_run(uid, result).await?;
        }
        Ok(())
    }

    async fn step_pass(&self, uid: Uuid, sequence: &EnergyStepSequence) -> AppResult<()> {
        let Some(first) = sequence.first() else {
            return Ok(());
        };
        self.pre_position(first).await?;

        let post_move = Duration::from_millis(self.config.post_move_delay_ms);
        for (segment, &dwell) in sequence.segments().iter().zip(sequence.dwell_times()) {
            self.executor
                .set_dwell(dwell)
                .await
                .map_err(|err| DaqError::Device(format!("set dwell {dwell} s: {err:#}")))?;
            for &energy in segment {
                self.hold_while_paused().await?;
                self.io.abort_flag().check()?;
                self.move_to(energy).await?;
                if !post_move.is_zero() {
                    sleep(post_move).await;
                }
                let counts = self
                    .executor
                    .trigger_and_read()
                    .await
                    .map_err(|err| DaqError::Device(format!("trigger at {energy} eV: {err:#}")))?;
                let row = StepRow {
                    time: unix_now(),
                    energy,
                    dwell,
                    counts,
                };
                self.store.append_step(uid, row).await?;
                self.events.send(&EventMessage::UpdateViewer);
            }
        }
        Ok(())
    }

    async fn fly_runs(
        &self,
        request: &ScanRequest,
        settings: &FlySettings,
        runs: &mut Vec<Uuid>,
        original_speed: &mut Option<f64>,
    ) -> AppResult<()> {
        let speed = self.io.read(ScalarChannel::MotorSpeed).await?;
        *original_speed = Some(speed);
        if settings.speed > speed {
            self.io.write(ScalarChannel::MotorSpeed, settings.speed).await?;
        }

        let start_energy = request.e0 + settings.start;
        let stop_energy = request.e0 + settings.stop;
        for pass in 0..settings.repeats {
            if pass > 0 && self.config.fly_cooling_ms > 0 {
                info!(seconds = self.config.fly_cooling_ms as f64 / 1000.0, "cooling before next sweep");
                sleep(Duration::from_millis(self.config.fly_cooling_ms)).await;
            }
            self.pre_position(start_energy).await?;

            let start_angle = self.io.read(ScalarChannel::MotorPosition).await?;
            let resolution = self.io.read(ScalarChannel::EncoderResolution).await?;
            let plan = FlyScanPlan::new(
                start_angle,
                stop_energy,
                settings.speed,
                settings.encoder_steps,
                settings.encoder_sign,
                resolution,
            )?;

            let mut metadata =
                request.metadata(ScanMode::Fly, plan.requested_samples, DarkRates::default());
            metadata.fly_geometry = Some(FlyGeometry {
                start_energy: plan.start_energy(),
                stop_energy,
                start_angle: plan.start_angle,
                stop_angle: plan.target_angle,
                encoder_resolution: resolution,
                encoder_steps: settings.encoder_steps,
                encoder_sign: settings.encoder_sign,
                speed: settings.speed,
            });
            let uid = self.store.open_run(metadata).await?;
            runs.push(uid);
            info!(%uid, pass = pass + 1, of = settings.repeats, samples = plan.requested_samples, "fly run opened");

            self.events.send(&EventMessage::FlyStartTime(unix_now()));
            let result = self.fly_pass(uid, plan).await;
            self.finish_run(uid, result).await?;
        }
        Ok(())
    }

    async fn fly_pass(&self, uid: Uuid, plan: FlyScanPlan) -> AppResult<()> {
        self.io.abort_flag().check()?;
        let mut session = FlyerSession::new(plan);
        self.flyer.arm(&mut session).await?;
        self.flyer.start(&mut session).await?;
        self.events.send(&EventMessage::UpdateViewer);

        if let Err(err) = self.follow_sweep(&session).await {
            if !matches!(err, DaqError::Aborted) {
                warn!(error = %err, "fly sweep did not complete, stopping the axis");
                if let Err(stop_err) = self.io.stop_motion().await {
                    warn!(error = %stop_err, "motor stop failed");
                }
            }
            return Err(err);
        }
        let samples = self.flyer.drain(&mut session).await?;
        self.store.append_fly(uid, &samples).await?;
        self.events.send(&EventMessage::UpdateViewer);
        self.io.abort_flag().check()
    }

    /// Wait for the sweep to complete, refreshing the viewer and honouring pause
    /// requests meanwhile.
    ///
    /// Aborting stops the axis, which the watcher reports as completion. An abort
    /// while paused ends the wait with [`DaqError::Aborted`].
    async fn follow_sweep(&self, session: &FlyerSession) -> AppResult<()> {
        let completion = self
            .flyer
            .await_completion(session, self.flyer_config.completion_timeout());
        tokio::pin!(completion);

        let period = self.config.fly_update_interval().max(Duration::from_millis(1));
        let mut updates = interval(period);
        updates.set_missed_tick_behavior(MissedTickBehavior::Delay);
        updates.reset();

        let mut pause = self.pause.subscribe();
        let mut paused = false;
        if *pause.borrow_and_update() {
            paused = self.pause_sweep(session).await?;
        }

        loop {
            tokio::select! {
                done = &mut completion => return done,
                _ = updates.tick() => {
                    self.events.send(&EventMessage::UpdateViewer);
                }
                changed = pause.changed() => {
                    changed.map_err(|_| DaqError::Device("pause channel closed".to_string()))?;
                    let requested = *pause.borrow_and_update();
                    if requested && !paused {
                        paused = self.pause_sweep(session).await?;
                    } else if !requested && paused {
                        self.io.abort_flag().check()?;
                        self.flyer.resume(session).await?;
                        self.events.send(&EventMessage::EngineState(EngineState::Running));
                        paused = false;
                    }
                }
            }
        }
    }

    /// Returns false when the sweep had already finished moving.
    async fn pause_sweep(&self, session: &FlyerSession) -> AppResult<bool> {
        match self.flyer.pause(session).await {
            Ok(()) => {
                self.events.send(&EventMessage::EngineState(EngineState::Paused));
                Ok(true)
            }
            Err(DaqError::ProtocolViolation(reason)) => {
                debug!(%reason, "pause ignored");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Block between step points while a pause is requested.
    async fn hold_while_paused(&self) -> AppResult<()> {
        let mut pause = self.pause.subscribe();
        if !*pause.borrow_and_update() {
            return Ok(());
        }
        info!("scan paused");
        self.events.send(&EventMessage::EngineState(EngineState::Paused));
        pause
            .wait_for(|paused| !*paused)
            .await
            .map(|_| ())
            .map_err(|_| DaqError::Device("pause channel closed".to_string()))?;
        self.io.abort_flag().check()?;
        info!("scan resumed");
        self.events.send(&EventMessage::EngineState(EngineState::Running));
        Ok(())
    }

    async fn pre_position(&self, start: f64) -> AppResult<()> {
        self.io.abort_flag().check()?;
        let offset = start - self.config.pre_position_offset_ev;
        debug!(energy = offset, "pre-positioning");
        self.move_to(offset).await?;
        sleep(Duration::from_millis(self.config.pre_position_settle_ms)).await;

        self.io.abort_flag().check()?;
        self.move_to(start).await?;
        sleep(Duration::from_millis(self.config.start_settle_ms)).await;
        Ok(())
    }

    async fn move_to(&self, energy: f64) -> AppResult<()> {
        self.executor
            .move_to(energy)
            .await
            .map_err(|err| DaqError::Device(format!("move to {energy} eV: {err:#}")))
    }

    /// Close a run with the exit matching `result` and pass the result through.
    async fn finish_run(&self, uid: Uuid, result: AppResult<()>) -> AppResult<()> {
        let exit = match &result {
            Ok(()) => RunExit::Success,
            Err(DaqError::Aborted) => RunExit::Aborted,
            Err(_) => RunExit::Failed,
        };
        let closed = self.store.close_run(uid, exit).await;
        info!(%uid, ?exit, "run closed");
        result.and(closed)
    }

    /// Return the beamline to a safe state. Every step is attempted.
    async fn cleanup(&self, e0: f64, original_speed: Option<f64>) -> AppResult<()> {
        let mut failures = Vec::new();
        self.events.send(&EventMessage::DisableAbortButton(true));

        if let Some(speed) = original_speed {
            if let Err(err) = self.io.force_write(ScalarChannel::MotorSpeed, speed).await {
                warn!(error = %err, "restoring motor speed failed");
                failures.push(err);
            }
        }
        if let Err(err) = self
            .io
            .wait_motion_done(self.flyer_config.poll_interval(), self.flyer_config.completion_timeout())
            .await
        {
            warn!(error = %err, "motion did not stop");
            failures.push(err);
        }
        info!(e0, "returning to edge energy");
        if let Err(err) = self.move_to(e0).await {
            warn!(error = %err, "return to edge energy failed");
            failures.push(err);
        }

        self.events.send(&EventMessage::SetBlink(false));
        self.events.send(&EventMessage::EngineState(EngineState::Idle));
        self.events.send(&EventMessage::DisableAbortButton(false));
        self.io.abort_flag().clear();
        self.pause.send_replace(false);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DaqError::CleanupFailed(failures))
        }
    }
}

fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 * 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HardwareConfig;
    use crate::hardware::io::AbortFlag;
    use crate::hardware::mock::{MockBeamline, MockExecutor};
    use crate::hardware::BeamlineHardware;
    use crate::store::MemoryRunStore;

    fn fast_config() -> XafsConfig {
        let mut config = XafsConfig::default();
        config.scan.pre_position_settle_ms = 0;
        config.scan.start_settle_ms = 0;
        config.scan.dark_preset_s = 2.0;
        config.flyer.poll_interval_ms = 5;
        config.flyer.kickoff_settle_ms = 5;
        config.flyer.reset_settle_ms = 0;
        config
    }

    fn orchestrator(beamline: Arc<MockBeamline>, config: &XafsConfig) -> (Orchestrator, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        let io = DeviceIo::new(beamline.clone(), &HardwareConfig::default(), AbortFlag::new());
        let (events, _rx) = EventSender::detached(64);
        let orchestrator = Orchestrator::new(
            Arc::new(MockExecutor::new(beamline)),
            io,
            store.clone(),
            events,
            config,
        );
        (orchestrator, store)
    }

    #[tokio::test]
    async fn test_dark_current_is_counts_per_second() {
        let beamline = Arc::new(MockBeamline::new());
        let dark_rate = beamline.model().dark_rate;
        let (orchestrator, _store) = orchestrator(beamline, &fast_config());

        let rates = orchestrator.measure_dark_current().await.unwrap();
        assert!((rates.i0 - dark_rate).abs() < 1e-9);
        assert_eq!(orchestrator.dark_rates().await, rates);
    }

    #[tokio::test]
    async fn test_invalid_trajectory_never_touches_hardware() {
        let beamline = Arc::new(MockBeamline::new());
        let (orchestrator, store) = orchestrator(beamline.clone(), &fast_config());
        let spec = ScanSegmentSpec {
            boundaries: vec![-50.0],
            active: vec![],
            modes: vec![],
            step_sizes: vec![],
            dwell_times: vec![],
        };

        let result = orchestrator
            .run(ScanRequest::new(ScanCategory::Measure, 8979.0, ScanKind::Step(spec)))
            .await;
        assert!(matches!(result, Err(DaqError::Configuration(_))));
        assert!(beamline.writes().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_energy_offset_compensation_writes_theta_offset() {
        let beamline = Arc::new(MockBeamline::new());
        let (orchestrator, _store) = orchestrator(beamline.clone(), &fast_config());
        let e0 = 8979.0;
        let ideal = energy_to_angle(e0).unwrap();
        let measured = energy_to_angle(e0 + 2.0).unwrap();

        let offset = orchestrator.compensate_energy_offset(e0, 2.0).await.unwrap();
        assert!((offset - (ideal - measured)).abs() < 1e-9);
        assert!(offset > 0.0);
        assert_eq!(beamline.last_write(ScalarChannel::ThetaOffset), Some(offset));
        assert!((beamline.energy().await - e0).abs() < 1e-3);

        // A second pass builds on the offset already in place.
        let again = orchestrator.compensate_energy_offset(e0, 2.0).await.unwrap();
        assert!((again - 2.0 * offset).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_set_energy_offset_starts_from_zero() {
        let beamline = Arc::new(MockBeamline::new());
        let (orchestrator, _store) = orchestrator(beamline.clone(), &fast_config());
        orchestrator.compensate_energy_offset(8979.0, 2.0).await.unwrap();

        let offset = orchestrator.set_energy_offset(8979.0, -1.0).await.unwrap();
        let expected = energy_to_angle(8979.0).unwrap() - energy_to_angle(8978.0).unwrap();
        assert!((offset - expected).abs() < 1e-9);
        let offsets: Vec<f64> = beamline
            .writes()
            .iter()
            .filter(|(c, _)| *c == ScalarChannel::ThetaOffset)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[1], 0.0);
        assert!((beamline.energy().await - 8978.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_abort_during_compensation_blocks_offset_write() {
        let beamline = Arc::new(MockBeamline::new());
        beamline.write(ScalarChannel::MotorSpeed, 0.005).await.unwrap();
        let (orchestrator, _store) = orchestrator(beamline.clone(), &fast_config());
        let orchestrator = Arc::new(orchestrator);

        let task = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.compensate_energy_offset(8979.0, 2.0).await })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.abort().await);

        assert!(matches!(task.await.unwrap(), Err(DaqError::Aborted)));
        assert_eq!(beamline.write_count(ScalarChannel::ThetaOffset), 0);
    }

    #[tokio::test]
    async fn test_pause_and_resume_report_changes_only() {
        let beamline = Arc::new(MockBeamline::new());
        let (orchestrator, _store) = orchestrator(beamline, &fast_config());

        assert!(orchestrator.pause());
        assert!(!orchestrator.pause());
        assert!(orchestrator.is_paused());
        assert!(orchestrator.resume());
        assert!(!orchestrator.resume());
        assert!(!orchestrator.is_paused());
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let beamline = Arc::new(MockBeamline::new());
        let (orchestrator, _store) = orchestrator(beamline.clone(), &fast_config());

        assert!(orchestrator.abort().await);
        assert!(!orchestrator.abort().await);
        assert_eq!(beamline.write_count(ScalarChannel::MotorStop), 1);
    }
}
