//! Mock Hardware Implementations
//!
//! Provides a simulated beamline for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockBeamline` - Si(111) monochromator theta axis with time-based motion plus a
//!   buffered counter card sampling encoder and four ion chambers across an
//!   absorption edge
//! - `MockExecutor` - step-scan plan executor driving a `MockBeamline`
//!
//! Faults can be injected per channel: stalled writes, stalled reads, waveforms
//! that come back empty once, truncated waveforms and motion that never settles.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration, Instant};

use super::{BeamlineHardware, ScalarChannel, WaveformChannel};
use crate::orchestrator::PlanExecutor;
use crate::physics::{angle_to_energy, energy_to_angle};
use crate::store::ChannelValues;

/// Absorber and beam model used to synthesize counter values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleModel {
    /// Absorption edge, eV.
    pub edge_energy: f64,
    /// Incident flux on I0, counts per second.
    pub flux: f64,
    /// Dark current on every channel, counts per second.
    pub dark_rate: f64,
    /// Relative noise amplitude.
    pub noise: f64,
}

impl Default for SampleModel {
    fn default() -> Self {
        Self {
            edge_energy: 8979.0,
            flux: 1.0e6,
            dark_rate: 50.0,
            noise: 0.002,
        }
    }
}

impl SampleModel {
    fn edge_step(&self, energy: f64) -> f64 {
        1.0 / (1.0 + (-(energy - self.edge_energy) / 2.0).exp())
    }

    /// Noise-free counts over `seconds` at `energy`.
    pub fn ideal_counts(&self, energy: f64, seconds: f64) -> ChannelValues {
        let step = self.edge_step(energy);
        let mu_sample = 0.3 + 1.2 * step;
        let mu_reference = 0.2 + 0.8 * step;
        let i0 = self.flux * seconds;
        let it = i0 * (-mu_sample).exp();
        ChannelValues {
            i0,
            it,
            i_f: i0 * 0.05 * (mu_sample - 0.3),
            ir: it * (-mu_reference).exp(),
        }
    }

    fn counts(&self, energy: f64, seconds: f64, rng: &mut StdRng) -> ChannelValues {
        let ideal = self.ideal_counts(energy, seconds);
        let dark = self.dark_rate * seconds;
        let mut jitter = |value: f64| value * (1.0 + self.noise * rng.gen_range(-1.0..1.0)) + dark;
        ChannelValues {
            i0: jitter(ideal.i0),
            it: jitter(ideal.it),
            i_f: jitter(ideal.i_f),
            ir: jitter(ideal.ir),
        }
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    stalled_writes: HashSet<ScalarChannel>,
    stalled_reads: HashMap<ScalarChannel, u32>,
    dropped_waveforms: HashMap<WaveformChannel, u32>,
    truncated_waveforms: HashMap<WaveformChannel, usize>,
    hold_motion: bool,
}

struct MockState {
    start_angle: f64,
    target_angle: f64,
    speed: f64,
    move_started: Option<Instant>,
    encoder_sign: f64,
    encoder_resolution: f64,
    capture_step: f64,
    capture_preset: f64,
    theta_offset: f64,
    capturing: bool,
    capture_origin: f64,
    samples: Vec<[f64; 5]>,
    rng: StdRng,
}

impl MockState {
    fn angle_at(&self, now: Instant) -> f64 {
        match self.move_started {
            Some(started) => {
                let distance = self.target_angle - self.start_angle;
                let travel = self.speed * now.duration_since(started).as_secs_f64();
                if travel >= distance.abs() {
                    self.target_angle
                } else {
                    self.start_angle + travel * distance.signum()
                }
            }
            None => self.start_angle,
        }
    }

    fn in_motion(&self, now: Instant) -> bool {
        self.move_started.is_some() && self.angle_at(now) != self.target_angle
    }

    /// Re-anchor the motion profile at the current position.
    fn anchor(&mut self, now: Instant) {
        self.start_angle = self.angle_at(now);
        if self.move_started.is_some() {
            self.move_started = Some(now);
        }
    }

    /// Append every capture sample the encoder has crossed since the last call.
    fn advance_capture(&mut self, now: Instant, model: &SampleModel) {
        if !self.capturing || self.capture_step <= 0.0 {
            return;
        }
        let counts = (self.angle_at(now) - self.capture_origin)
            / (self.encoder_sign * self.encoder_resolution);
        let direction = if counts < 0.0 { -1.0 } else { 1.0 };
        let mut crossed = (counts.abs() / self.capture_step).floor() as usize;
        if self.capture_preset > 0.0 {
            crossed = crossed.min(self.capture_preset as usize);
        }
        let seconds_per_sample = self.capture_step * self.encoder_resolution / self.speed.max(1e-9);
        while self.samples.len() < crossed {
            let index = (self.samples.len() + 1) as f64;
            let encoder = direction * index * self.capture_step;
            let angle = self.encoder_sign * encoder * self.encoder_resolution + self.capture_origin;
            let c = model.counts(angle_to_energy(angle), seconds_per_sample, &mut self.rng);
            self.samples.push([encoder, c.i0, c.it, c.i_f, c.ir]);
        }
    }
}

/// Simulated monochromator plus buffered counter card.
///
/// Moves run in wall-clock time at the configured speed; capture samples are
/// synthesized lazily whenever the device is accessed. The theta offset is stored
/// but does not shift the simulated axis.
///
/// # Example
///
/// ```rust,ignore
/// let beamline = MockBeamline::new();
/// beamline.write(ScalarChannel::MotorPosition, 12.0).await?; // returns immediately
/// while beamline.read(ScalarChannel::MotionDone).await? == 0.0 {
///     tokio::time::sleep(Duration::from_millis(10)).await;
/// }
/// ```
pub struct MockBeamline {
    model: SampleModel,
    state: Arc<RwLock<MockState>>,
    faults: Mutex<FaultPlan>,
    writes: Mutex<Vec<(ScalarChannel, f64)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockBeamline {
    /// Beamline parked at the Cu K edge with the default sample model.
    pub fn new() -> Self {
        Self::with_model(SampleModel::default())
    }

    /// Beamline parked at the model's edge energy.
    pub fn with_model(model: SampleModel) -> Self {
        let angle = energy_to_angle(model.edge_energy).unwrap_or(15.0);
        Self {
            model,
            state: Arc::new(RwLock::new(MockState {
                start_angle: angle,
                target_angle: angle,
                speed: 2.0,
                move_started: None,
                encoder_sign: -1.0,
                encoder_resolution: 1e-5,
                capture_step: 10.0,
                capture_preset: 0.0,
                theta_offset: 0.0,
                capturing: false,
                capture_origin: angle,
                samples: Vec::new(),
                rng: StdRng::seed_from_u64(0x5eed),
            })),
            faults: Mutex::new(FaultPlan::default()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Sample model used for synthesized counts.
    pub fn model(&self) -> &SampleModel {
        &self.model
    }

    /// Direction of the simulated encoder relative to theta.
    pub async fn encoder_sign(&self) -> f64 {
        self.state.read().await.encoder_sign
    }

    /// Current monochromator energy, eV.
    pub async fn energy(&self) -> f64 {
        angle_to_energy(self.state.read().await.angle_at(Instant::now()))
    }

    /// Every scalar write issued so far, in order.
    pub fn writes(&self) -> Vec<(ScalarChannel, f64)> {
        lock(&self.writes).clone()
    }

    /// Number of writes to `channel`.
    pub fn write_count(&self, channel: ScalarChannel) -> usize {
        self.writes().iter().filter(|(c, _)| *c == channel).count()
    }

    /// Last value written to `channel`.
    pub fn last_write(&self, channel: ScalarChannel) -> Option<f64> {
        self.writes()
            .iter()
            .rev()
            .find(|(c, _)| *c == channel)
            .map(|(_, v)| *v)
    }

    /// Writes to `channel` never complete.
    pub fn stall_writes(&self, channel: ScalarChannel) {
        lock(&self.faults).stalled_writes.insert(channel);
    }

    /// The next `count` reads of `channel` never complete.
    pub fn stall_reads(&self, channel: ScalarChannel, count: u32) {
        lock(&self.faults).stalled_reads.insert(channel, count);
    }

    /// The next `count` reads of `channel` return no waveform.
    pub fn drop_waveforms(&self, channel: WaveformChannel, count: u32) {
        lock(&self.faults).dropped_waveforms.insert(channel, count);
    }

    /// `channel` returns at most `len` samples.
    pub fn truncate_waveform(&self, channel: WaveformChannel, len: usize) {
        lock(&self.faults).truncated_waveforms.insert(channel, len);
    }

    /// While held, the motion-done flag stays 0 even after the move finished.
    pub fn hold_motion(&self, hold: bool) {
        lock(&self.faults).hold_motion = hold;
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        *lock(&self.faults) = FaultPlan::default();
    }

    /// Synthesized counts at the current energy, used by [`MockExecutor`].
    async fn count_here(&self, seconds: f64, beam: bool) -> ChannelValues {
        let mut state = self.state.write().await;
        if !beam {
            let dark = self.model.dark_rate * seconds;
            return ChannelValues {
                i0: dark,
                it: dark,
                i_f: dark,
                ir: dark,
            };
        }
        let energy = angle_to_energy(state.angle_at(Instant::now()));
        self.model.counts(energy, seconds, &mut state.rng)
    }
}

impl Default for MockBeamline {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BeamlineHardware for MockBeamline {
    async fn read(&self, channel: ScalarChannel) -> Result<f64> {
        let (stalled, hold) = {
            let mut faults = lock(&self.faults);
            let stalled = match faults.stalled_reads.get_mut(&channel) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (stalled, faults.hold_motion)
        };
        if stalled {
            std::future::pending::<()>().await;
        }

        let now = Instant::now();
        let mut state = self.state.write().await;
        state.advance_capture(now, &self.model);
        let value = match channel {
            ScalarChannel::MotorPosition => state.angle_at(now),
            ScalarChannel::MotorSpeed => state.speed,
            ScalarChannel::MotorStop => 0.0,
            ScalarChannel::MotionDone => {
                if hold || state.in_motion(now) {
                    0.0
                } else {
                    1.0
                }
            }
            ScalarChannel::EncoderResolution => state.encoder_resolution,
            ScalarChannel::CaptureMode => f64::from(u8::from(state.capturing)),
            ScalarChannel::CaptureStepSize => state.capture_step,
            ScalarChannel::CaptureReset => 0.0,
            ScalarChannel::CapturePreset => state.capture_preset,
            ScalarChannel::ThetaOffset => state.theta_offset,
        };
        Ok(value)
    }

    async fn write(&self, channel: ScalarChannel, value: f64) -> Result<()> {
        let stalled = lock(&self.faults).stalled_writes.contains(&channel);
        if stalled {
            std::future::pending::<()>().await;
        }

        let now = Instant::now();
        let mut state = self.state.write().await;
        state.advance_capture(now, &self.model);
        lock(&self.writes).push((channel, value));
        match channel {
            ScalarChannel::MotorPosition => {
                state.anchor(now);
                state.target_angle = value;
                state.move_started = Some(now);
                tracing::debug!(
                    from = state.start_angle,
                    to = value,
                    "MockBeamline: theta move issued"
                );
            }
            ScalarChannel::MotorSpeed => {
                if !(value > 0.0) {
                    return Err(anyhow!("MockBeamline: speed must be positive, got {value}"));
                }
                state.anchor(now);
                state.speed = value;
            }
            ScalarChannel::MotorStop => {
                if value != 0.0 {
                    let here = state.angle_at(now);
                    state.start_angle = here;
                    state.target_angle = here;
                    state.move_started = None;
                }
            }
            ScalarChannel::MotionDone => {
                return Err(anyhow!("MockBeamline: MotionDone is read-only"));
            }
            ScalarChannel::EncoderResolution => state.encoder_resolution = value,
            ScalarChannel::CaptureMode => state.capturing = value != 0.0,
            ScalarChannel::CaptureStepSize => state.capture_step = value,
            ScalarChannel::CaptureReset => {
                if value != 0.0 {
                    state.samples.clear();
                    state.capture_origin = state.angle_at(now);
                }
            }
            ScalarChannel::CapturePreset => state.capture_preset = value,
            ScalarChannel::ThetaOffset => state.theta_offset = value,
        }
        Ok(())
    }

    async fn read_waveform(&self, channel: WaveformChannel) -> Result<Option<Vec<f64>>> {
        let (dropped, limit) = {
            let mut faults = lock(&self.faults);
            let dropped = match faults.dropped_waveforms.get_mut(&channel) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };
            (dropped, faults.truncated_waveforms.get(&channel).copied())
        };
        if dropped {
            return Ok(None);
        }

        let column = WaveformChannel::ALL
            .iter()
            .position(|c| *c == channel)
            .unwrap_or(0);
        let mut state = self.state.write().await;
        state.advance_capture(Instant::now(), &self.model);
        let take = limit.unwrap_or(usize::MAX);
        Ok(Some(
            state.samples.iter().take(take).map(|s| s[column]).collect(),
        ))
    }
}

/// Step-scan plan executor over a [`MockBeamline`].
pub struct MockExecutor {
    beamline: Arc<MockBeamline>,
    dwell: RwLock<f64>,
    poll: Duration,
    fail_at_move: RwLock<Option<usize>>,
    moves: RwLock<usize>,
}

impl MockExecutor {
    /// Executor driving `beamline`, with a 1 s dwell until told otherwise.
    pub fn new(beamline: Arc<MockBeamline>) -> Self {
        Self {
            beamline,
            dwell: RwLock::new(1.0),
            poll: Duration::from_millis(2),
            fail_at_move: RwLock::new(None),
            moves: RwLock::new(0),
        }
    }

    /// Make the n-th move (0-based) fail with a driver error.
    pub async fn fail_at_move(&self, index: usize) {
        *self.fail_at_move.write().await = Some(index);
    }

    /// Moves performed so far.
    pub async fn move_count(&self) -> usize {
        *self.moves.read().await
    }

    /// Current dwell time, seconds.
    pub async fn dwell(&self) -> f64 {
        *self.dwell.read().await
    }
}

#[async_trait]
impl PlanExecutor for MockExecutor {
    async fn move_to(&self, energy: f64) -> Result<()> {
        let index = {
            let mut moves = self.moves.write().await;
            *moves += 1;
            *moves - 1
        };
        if *self.fail_at_move.read().await == Some(index) {
            return Err(anyhow!("MockExecutor: injected failure at move {index}"));
        }

        let angle = energy_to_angle(energy)?;
        self.beamline.write(ScalarChannel::MotorPosition, angle).await?;
        while self.beamline.read(ScalarChannel::MotionDone).await? == 0.0 {
            sleep(self.poll).await;
        }
        Ok(())
    }

    async fn set_dwell(&self, seconds: f64) -> Result<()> {
        *self.dwell.write().await = seconds;
        Ok(())
    }

    async fn trigger_and_read(&self) -> Result<ChannelValues> {
        let dwell = *self.dwell.read().await;
        Ok(self.beamline.count_here(dwell, true).await)
    }

    async fn count(&self, preset: f64) -> Result<ChannelValues> {
        Ok(self.beamline.count_here(preset, false).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_done(beamline: &MockBeamline) {
        while beamline.read(ScalarChannel::MotionDone).await.unwrap() == 0.0 {
            sleep(Duration::from_millis(2)).await;
        }
    }

    #[tokio::test]
    async fn test_motion_takes_time_and_arrives() {
        let beamline = MockBeamline::new();
        beamline.write(ScalarChannel::MotorSpeed, 10.0).await.unwrap();
        let start = beamline.read(ScalarChannel::MotorPosition).await.unwrap();
        beamline
            .write(ScalarChannel::MotorPosition, start - 0.5)
            .await
            .unwrap();
        assert_eq!(beamline.read(ScalarChannel::MotionDone).await.unwrap(), 0.0);
        wait_done(&beamline).await;
        let end = beamline.read(ScalarChannel::MotorPosition).await.unwrap();
        assert!((end - (start - 0.5)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_capture_fills_equal_length_waveforms() {
        let beamline = MockBeamline::new();
        beamline.write(ScalarChannel::MotorSpeed, 20.0).await.unwrap();
        beamline.write(ScalarChannel::CaptureStepSize, 100.0).await.unwrap();
        beamline.write(ScalarChannel::CaptureReset, 1.0).await.unwrap();
        beamline.write(ScalarChannel::CaptureMode, 1.0).await.unwrap();
        let start = beamline.read(ScalarChannel::MotorPosition).await.unwrap();
        beamline
            .write(ScalarChannel::MotorPosition, start - 0.1)
            .await
            .unwrap();
        wait_done(&beamline).await;
        beamline.write(ScalarChannel::CaptureMode, 0.0).await.unwrap();

        let mut lengths = Vec::new();
        for channel in WaveformChannel::ALL {
            lengths.push(beamline.read_waveform(channel).await.unwrap().unwrap().len());
        }
        // 0.1 deg / 1e-5 deg per count / 100 counts per sample
        assert!(lengths.iter().all(|&len| len == lengths[0]));
        assert!((99..=100).contains(&lengths[0]));
        let encoder = beamline
            .read_waveform(WaveformChannel::Encoder)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(encoder[0], 100.0);
    }

    #[tokio::test]
    async fn test_injected_waveform_faults() {
        let beamline = MockBeamline::new();
        beamline.drop_waveforms(WaveformChannel::I0, 1);
        assert!(beamline.read_waveform(WaveformChannel::I0).await.unwrap().is_none());
        assert!(beamline.read_waveform(WaveformChannel::I0).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stop_freezes_position() {
        let beamline = MockBeamline::new();
        beamline.write(ScalarChannel::MotorSpeed, 0.5).await.unwrap();
        let start = beamline.read(ScalarChannel::MotorPosition).await.unwrap();
        beamline
            .write(ScalarChannel::MotorPosition, start - 5.0)
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;
        beamline.write(ScalarChannel::MotorStop, 1.0).await.unwrap();
        assert_eq!(beamline.read(ScalarChannel::MotionDone).await.unwrap(), 1.0);
        let stopped = beamline.read(ScalarChannel::MotorPosition).await.unwrap();
        assert!(stopped < start && stopped > start - 5.0);
    }

    #[tokio::test]
    async fn test_executor_counts_with_and_without_beam() {
        let beamline = Arc::new(MockBeamline::new());
        beamline.write(ScalarChannel::MotorSpeed, 50.0).await.unwrap();
        let executor = MockExecutor::new(beamline.clone());

        executor.move_to(9100.0).await.unwrap();
        assert!((beamline.energy().await - 9100.0).abs() < 1e-6);

        executor.set_dwell(2.0).await.unwrap();
        let bright = executor.trigger_and_read().await.unwrap();
        assert!(bright.i0 > 1.0e6);

        let dark = executor.count(10.0).await.unwrap();
        assert_eq!(dark.i0, 500.0);
    }
}
