//! Fly-scan protocol: one continuous monochromator sweep with buffered capture.
//!
//! A [`FlyerSession`] moves through `Idle -> Armed -> Running -> Completing ->
//! Drained`. `Drained` is where a session rests after a sweep; arming it again
//! passes back through `Idle`, so one session can run several sweeps. [`Flyer::arm`] resets and enables the counter card, [`Flyer::start`]
//! issues the move and spawns a watcher task that polls the motion-done flag,
//! [`Flyer::await_completion`] waits for the watcher's completion signal and
//! [`Flyer::drain`] copies the waveforms out. Calling an operation from the wrong
//! state is a [`DaqError::ProtocolViolation`].
//!
//! The watcher task belongs to the session: dropping the session aborts it.

use crate::config::FlyerConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::io::DeviceIo;
use crate::hardware::{ScalarChannel, WaveformChannel};
use crate::physics::{angle_to_energy, energy_to_angle, EncoderGeometry};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Lifecycle of one fly sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlyerState {
    /// Created, nothing written to hardware yet.
    Idle,
    /// Counters reset and capture mode on.
    Armed,
    /// Move issued, watcher polling.
    Running,
    /// Watcher saw the axis settle.
    Completing,
    /// Waveforms copied out and capture mode off. Terminal until re-armed.
    Drained,
}

impl fmt::Display for FlyerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Geometry and capture settings of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyScanPlan {
    /// Theta at kickoff, degrees.
    pub start_angle: f64,
    /// Theta the sweep moves to, degrees.
    pub target_angle: f64,
    /// Theta speed during the sweep, degrees per second.
    pub speed: f64,
    /// Encoder counts accumulated into one sample.
    pub encoder_steps: f64,
    /// Encoder calibration anchored at `start_angle`.
    pub geometry: EncoderGeometry,
    /// Upper bound on the number of samples drained.
    pub requested_samples: usize,
}

impl FlyScanPlan {
    /// Plan a sweep from the current theta to `stop_energy`.
    ///
    /// The requested sample count is `|start - stop| / resolution / encoder_steps`.
    pub fn new(
        start_angle: f64,
        stop_energy: f64,
        speed: f64,
        encoder_steps: f64,
        encoder_sign: f64,
        encoder_resolution: f64,
    ) -> AppResult<Self> {
        if !(speed > 0.0) || !(encoder_steps > 0.0) || !(encoder_resolution > 0.0) {
            return Err(DaqError::Configuration(format!(
                "fly speed, encoder steps and resolution must be > 0 \
                 (speed {speed}, steps {encoder_steps}, resolution {encoder_resolution})"
            )));
        }
        let target_angle = energy_to_angle(stop_energy)?;
        let requested =
            ((start_angle - target_angle).abs() / encoder_resolution / encoder_steps).floor();
        Ok(Self {
            start_angle,
            target_angle,
            speed,
            encoder_steps,
            geometry: EncoderGeometry {
                sign: encoder_sign,
                resolution: encoder_resolution,
                start_angle,
            },
            requested_samples: requested as usize,
        })
    }

    /// Energy at kickoff, eV.
    pub fn start_energy(&self) -> f64 {
        angle_to_energy(self.start_angle)
    }

    /// Energy at the end of the sweep, eV.
    pub fn stop_energy(&self) -> f64 {
        angle_to_energy(self.target_angle)
    }
}

/// One drained sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyRecord {
    /// Unix time at which the sample was drained, seconds.
    pub time: f64,
    /// Raw encoder counts since the capture reset.
    pub encoder: f64,
    /// Theta, degrees.
    pub angle: f64,
    /// Photon energy, eV.
    pub energy: f64,
    /// Incident intensity counts.
    pub i0: f64,
    /// Transmitted intensity counts.
    pub it: f64,
    /// Fluorescence counts.
    pub i_f: f64,
    /// Reference counts.
    pub ir: f64,
}

/// State of one sweep, owned by the caller between flyer operations.
pub struct FlyerSession {
    plan: FlyScanPlan,
    state: Arc<watch::Sender<FlyerState>>,
    paused: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl FlyerSession {
    /// New idle session for `plan`.
    pub fn new(plan: FlyScanPlan) -> Self {
        let (state, _) = watch::channel(FlyerState::Idle);
        Self {
            plan,
            state: Arc::new(state),
            paused: Arc::new(AtomicBool::new(false)),
            watcher: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> FlyerState {
        *self.state.borrow()
    }

    /// Sweep geometry.
    pub fn plan(&self) -> &FlyScanPlan {
        &self.plan
    }

    /// Observe state changes, including the completion signal.
    pub fn subscribe(&self) -> watch::Receiver<FlyerState> {
        self.state.subscribe()
    }

    /// True while the sweep is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Abort the watcher task, if any. The state is left untouched.
    pub fn cancel(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }

    fn set_state(&self, next: FlyerState) {
        let previous = self.state.send_replace(next);
        debug!(%previous, %next, "flyer state change");
    }
}

impl Drop for FlyerSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Drives [`FlyerSession`]s against the hardware.
#[derive(Clone)]
pub struct Flyer {
    io: DeviceIo,
    config: FlyerConfig,
}

impl Flyer {
    /// Flyer using `io` with the given timings.
    pub fn new(io: DeviceIo, config: FlyerConfig) -> Self {
        Self { io, config }
    }

    /// Write speed and capture settings, reset the buffers and enable capture.
    ///
    /// Allowed from `Idle`, `Armed` and `Drained`; the session passes through `Idle`
    /// and is left there on failure.
    pub async fn arm(&self, session: &mut FlyerSession) -> AppResult<()> {
        match session.state() {
            FlyerState::Running | FlyerState::Completing => {
                return Err(DaqError::ProtocolViolation(format!(
                    "arm called while {}",
                    session.state()
                )));
            }
            FlyerState::Idle | FlyerState::Armed | FlyerState::Drained => {}
        }
        session.cancel();
        session.set_state(FlyerState::Idle);

        let plan = *session.plan();
        self.io.write(ScalarChannel::MotorSpeed, plan.speed).await?;
        self.io
            .write(ScalarChannel::CaptureStepSize, plan.encoder_steps)
            .await?;
        self.io.write(ScalarChannel::CaptureReset, 1.0).await?;
        self.io.write(ScalarChannel::CapturePreset, 0.0).await?;
        sleep(Duration::from_millis(self.config.reset_settle_ms)).await;
        self.io.write(ScalarChannel::CaptureMode, 1.0).await?;

        session.set_state(FlyerState::Armed);
        info!(
            start_angle = plan.start_angle,
            target_angle = plan.target_angle,
            speed = plan.speed,
            requested = plan.requested_samples,
            "flyer armed"
        );
        Ok(())
    }

    /// Issue the sweep and spawn the motion watcher.
    pub async fn start(&self, session: &mut FlyerSession) -> AppResult<()> {
        match session.state() {
            FlyerState::Armed => {}
            FlyerState::Running | FlyerState::Completing => {
                return Err(DaqError::ProtocolViolation(
                    "start called twice without drain".to_string(),
                ));
            }
            FlyerState::Idle | FlyerState::Drained => {
                return Err(DaqError::ProtocolViolation(
                    "start called on an unarmed session".to_string(),
                ));
            }
        }

        self.io
            .write(ScalarChannel::MotorPosition, session.plan().target_angle)
            .await?;
        session.paused.store(false, Ordering::SeqCst);
        session.set_state(FlyerState::Running);

        let watcher = MotionWatcher {
            io: self.io.clone(),
            state: Arc::clone(&session.state),
            paused: Arc::clone(&session.paused),
            settle: Duration::from_millis(self.config.kickoff_settle_ms),
            poll: self.config.poll_interval(),
            steady_polls: self.config.steady_polls.max(1),
        };
        session.watcher = Some(tokio::spawn(watcher.run()));
        info!("flyer started");
        Ok(())
    }

    /// Wait for the completion signal for at most `limit`.
    ///
    /// A timeout leaves the watcher running; a later call still sees the completion.
    pub async fn await_completion(&self, session: &FlyerSession, limit: Duration) -> AppResult<()> {
        match session.state() {
            FlyerState::Running | FlyerState::Completing => {}
            other => {
                return Err(DaqError::ProtocolViolation(format!(
                    "await_completion called while {other}"
                )));
            }
        }
        let mut completion = session.subscribe();
        let waited = timeout(limit, async move {
            completion
                .wait_for(|s| *s == FlyerState::Completing)
                .await
                .map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DaqError::Device(
                "flyer state channel closed".to_string(),
            )),
            Err(_) => {
                warn!(limit_ms = limit.as_millis() as u64, "fly sweep still running");
                Err(DaqError::timeout("await fly completion", 1))
            }
        }
    }

    /// Switch capture off and copy out the samples. The session ends `Drained`.
    ///
    /// All five waveforms are truncated to `min(requested, shortest)`.
    pub async fn drain(&self, session: &mut FlyerSession) -> AppResult<Vec<FlyRecord>> {
        if session.state() != FlyerState::Completing {
            return Err(DaqError::ProtocolViolation(format!(
                "drain called while {}",
                session.state()
            )));
        }
        session.cancel();
        self.io.force_write(ScalarChannel::CaptureMode, 0.0).await?;

        let reads = WaveformChannel::ALL.map(|channel| self.read_waveform_once_retried(channel));
        let mut columns = Vec::with_capacity(WaveformChannel::ALL.len());
        for result in join_all(reads).await {
            columns.push(result?);
        }

        let plan = session.plan();
        let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
        let count = plan.requested_samples.min(shortest);
        let time = chrono::Utc::now().timestamp_micros() as f64 * 1e-6;

        let records = (0..count)
            .map(|i| {
                let encoder = columns[0][i];
                let angle = plan.geometry.angle(encoder);
                FlyRecord {
                    time,
                    encoder,
                    angle,
                    energy: angle_to_energy(angle),
                    i0: columns[1][i],
                    it: columns[2][i],
                    i_f: columns[3][i],
                    ir: columns[4][i],
                }
            })
            .collect::<Vec<_>>();

        session.set_state(FlyerState::Drained);
        info!(
            samples = records.len(),
            requested = plan.requested_samples,
            shortest,
            "flyer drained"
        );
        Ok(records)
    }

    /// Stop the axis mid-sweep without touching the capture buffer.
    pub async fn pause(&self, session: &FlyerSession) -> AppResult<()> {
        if session.state() != FlyerState::Running {
            return Err(DaqError::ProtocolViolation(format!(
                "pause called while {}",
                session.state()
            )));
        }
        session.paused.store(true, Ordering::SeqCst);
        self.io.stop_motion().await?;
        info!("flyer paused");
        Ok(())
    }

    /// Re-issue the move to the target, keeping the samples captured so far.
    pub async fn resume(&self, session: &FlyerSession) -> AppResult<()> {
        if session.state() != FlyerState::Running || !session.is_paused() {
            return Err(DaqError::ProtocolViolation(
                "resume called on a sweep that is not paused".to_string(),
            ));
        }
        self.io
            .write(ScalarChannel::MotorPosition, session.plan().target_angle)
            .await?;
        session.paused.store(false, Ordering::SeqCst);
        info!("flyer resumed");
        Ok(())
    }

    /// Read a waveform; an empty or missing result is retried exactly once.
    async fn read_waveform_once_retried(&self, channel: WaveformChannel) -> AppResult<Vec<f64>> {
        match self.io.read_waveform(channel).await? {
            Some(values) if !values.is_empty() => return Ok(values),
            _ => warn!(%channel, "empty waveform, retrying once"),
        }
        Ok(self.io.read_waveform(channel).await?.unwrap_or_default())
    }
}

struct MotionWatcher {
    io: DeviceIo,
    state: Arc<watch::Sender<FlyerState>>,
    paused: Arc<AtomicBool>,
    settle: Duration,
    poll: Duration,
    steady_polls: u32,
}

impl MotionWatcher {
    async fn run(self) {
        sleep(self.settle).await;
        let mut streak = 0;
        loop {
            sleep(self.poll).await;
            if self.paused.load(Ordering::SeqCst) {
                streak = 0;
                continue;
            }
            match self.io.read_flag(ScalarChannel::MotionDone).await {
                Ok(true) => streak += 1,
                Ok(false) => streak = 0,
                Err(err) => {
                    warn!(error = %err, "motion watcher read failed");
                    streak = 0;
                }
            }
            if streak >= self.steady_polls {
                let completed = self.state.send_if_modified(|state| {
                    if *state == FlyerState::Running {
                        *state = FlyerState::Completing;
                        true
                    } else {
                        false
                    }
                });
                if completed {
                    info!("fly sweep completed");
                }
                return;
            }
        }
    }
}
