//! Persisted run records.
//!
//! A run is a `metadata.start` document ([`RunMetadata`]) plus a columnar `primary`
//! stream ([`PrimaryStream`]). The orchestrator writes runs through [`RunStore`];
//! the live pipeline reads the most recent runs of a category back.

use crate::error::{AppResult, DaqError};
use crate::flyer::FlyRecord;
use crate::messages::ScanCategory;
use crate::physics::EncoderGeometry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

/// One value per ion chamber.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelValues {
    /// Incident intensity.
    pub i0: f64,
    /// Transmitted intensity.
    pub it: f64,
    /// Fluorescence.
    pub i_f: f64,
    /// Reference.
    pub ir: f64,
}

impl ChannelValues {
    /// Divide every channel by `seconds`.
    pub fn per_second(&self, seconds: f64) -> Self {
        Self {
            i0: self.i0 / seconds,
            it: self.it / seconds,
            i_f: self.i_f / seconds,
            ir: self.ir / seconds,
        }
    }
}

/// Dark-current rates in counts per second.
pub type DarkRates = ChannelValues;

/// Step scan or fly scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Move, settle, count at each point.
    Step,
    /// Continuous sweep with buffered capture.
    Fly,
}

/// Fly-scan geometry recorded at scan start.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlyGeometry {
    /// Start energy, eV.
    pub start_energy: f64,
    /// Stop energy, eV.
    pub stop_energy: f64,
    /// Start theta, degrees.
    pub start_angle: f64,
    /// Stop theta, degrees.
    pub stop_angle: f64,
    /// Degrees per encoder count.
    pub encoder_resolution: f64,
    /// Encoder counts per sample.
    pub encoder_steps: f64,
    /// Encoder direction relative to theta.
    pub encoder_sign: f64,
    /// Theta speed, degrees per second.
    pub speed: f64,
}

impl FlyGeometry {
    /// Encoder calibration anchored at the start angle.
    pub fn encoder(&self) -> EncoderGeometry {
        EncoderGeometry {
            sign: self.encoder_sign,
            resolution: self.encoder_resolution,
            start_angle: self.start_angle,
        }
    }
}

/// Slit blade positions, mm.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SlitPositions {
    /// Top blade.
    pub top: f64,
    /// Bottom blade.
    pub bottom: f64,
    /// Left blade.
    pub left: f64,
    /// Right blade.
    pub right: f64,
}

/// `metadata.start` document of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Run identifier.
    pub uid: Uuid,
    /// Tab the run was started from.
    pub category: ScanCategory,
    /// Step or fly.
    pub mode: ScanMode,
    /// Edge energy, eV.
    pub e0: f64,
    /// Dark-current rates captured before the scan.
    pub dark_rates: DarkRates,
    /// Amplifier gain exponent per channel.
    pub gains: ChannelValues,
    /// Present for fly scans.
    pub fly_geometry: Option<FlyGeometry>,
    /// Slit positions, if known.
    pub slits: Option<SlitPositions>,
    /// Storage ring current, mA.
    pub beam_current: Option<f64>,
    /// Scan start.
    pub timestamp: DateTime<Utc>,
    /// Operator name.
    pub operator: String,
    /// Expected number of points or samples.
    pub scan_points: usize,
}

impl RunMetadata {
    /// Metadata with a fresh uid, the current time and empty optional fields.
    pub fn new(category: ScanCategory, mode: ScanMode, e0: f64, scan_points: usize) -> Self {
        Self {
            uid: Uuid::new_v4(),
            category,
            mode,
            e0,
            dark_rates: DarkRates::default(),
            gains: ChannelValues::default(),
            fly_geometry: None,
            slits: None,
            beam_current: None,
            timestamp: Utc::now(),
            operator: String::new(),
            scan_points,
        }
    }
}

/// One step-scan reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    /// Unix time of the reading, seconds.
    pub time: f64,
    /// Monochromator energy, eV.
    pub energy: f64,
    /// Counting time, seconds.
    pub dwell: f64,
    /// Raw counts.
    pub counts: ChannelValues,
}

/// Columnar `primary` stream.
///
/// Step scans fill `energy` and `dwell`; fly scans fill `encoder`. The four
/// counter columns and `time` always have one entry per row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrimaryStream {
    /// Unix time per row.
    pub time: Vec<f64>,
    /// Energy per row (step scans).
    pub energy: Vec<f64>,
    /// Dwell per row (step scans).
    pub dwell: Vec<f64>,
    /// Encoder counts per row (fly scans).
    pub encoder: Vec<f64>,
    /// Incident intensity.
    pub i0: Vec<f64>,
    /// Transmitted intensity.
    pub it: Vec<f64>,
    /// Fluorescence.
    pub i_f: Vec<f64>,
    /// Reference.
    pub ir: Vec<f64>,
}

impl PrimaryStream {
    /// Number of rows.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// True when no row was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    fn push_counts(&mut self, time: f64, counts: ChannelValues) {
        self.time.push(time);
        self.i0.push(counts.i0);
        self.it.push(counts.it);
        self.i_f.push(counts.i_f);
        self.ir.push(counts.ir);
    }

    /// Append a step-scan row.
    pub fn push_step(&mut self, row: &StepRow) {
        self.push_counts(row.time, row.counts);
        self.energy.push(row.energy);
        self.dwell.push(row.dwell);
    }

    /// Append drained fly-scan samples.
    pub fn extend_fly(&mut self, samples: &[FlyRecord]) {
        for sample in samples {
            self.push_counts(
                sample.time,
                ChannelValues {
                    i0: sample.i0,
                    it: sample.it,
                    i_f: sample.i_f,
                    ir: sample.ir,
                },
            );
            self.encoder.push(sample.encoder);
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunExit {
    /// All points recorded.
    Success,
    /// Stopped by the operator.
    Aborted,
    /// Stopped by an error.
    Failed,
}

/// A run as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// `metadata.start`.
    pub metadata: RunMetadata,
    /// `primary` stream.
    pub primary: PrimaryStream,
    /// Set once the run was closed.
    pub exit: Option<RunExit>,
}

impl RunRecord {
    /// True once the run was closed.
    pub fn is_complete(&self) -> bool {
        self.exit.is_some()
    }
}

/// Run persistence seam.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Register a new run.
    async fn open_run(&self, metadata: RunMetadata) -> AppResult<Uuid>;

    /// Append one step-scan row.
    async fn append_step(&self, uid: Uuid, row: StepRow) -> AppResult<()>;

    /// Append drained fly-scan samples.
    async fn append_fly(&self, uid: Uuid, samples: &[FlyRecord]) -> AppResult<()>;

    /// Mark a run finished.
    async fn close_run(&self, uid: Uuid, exit: RunExit) -> AppResult<()>;

    /// Up to `limit` runs of `category`, newest first.
    async fn recent_runs(&self, category: ScanCategory, limit: usize) -> AppResult<Vec<RunRecord>>;
}

/// Runs kept by [`MemoryRunStore::new`].
pub const DEFAULT_RETAINED_RUNS: usize = 100;

/// In-memory [`RunStore`] shared by the controller and viewer halves of one process.
///
/// At most `retention` runs are kept. Opening a run past the cap evicts the oldest
/// closed runs; runs still being written are never evicted.
pub struct MemoryRunStore {
    runs: RwLock<Vec<RunRecord>>,
    retention: usize,
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_RUNS)
    }
}

impl MemoryRunStore {
    /// Empty store keeping [`DEFAULT_RETAINED_RUNS`] runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store keeping at most `max_runs` runs (at least one).
    pub fn with_retention(max_runs: usize) -> Self {
        Self {
            runs: RwLock::new(Vec::new()),
            retention: max_runs.max(1),
        }
    }

    /// Maximum number of runs kept.
    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Number of runs stored.
    pub async fn len(&self) -> usize {
        self.runs.read().await.len()
    }

    /// True when no run was stored.
    pub async fn is_empty(&self) -> bool {
        self.runs.read().await.is_empty()
    }

    /// Copy of one run.
    pub async fn get(&self, uid: Uuid) -> Option<RunRecord> {
        self.runs
            .read()
            .await
            .iter()
            .find(|r| r.metadata.uid == uid)
            .cloned()
    }

    async fn with_run<T>(&self, uid: Uuid, f: impl FnOnce(&mut RunRecord) -> T) -> AppResult<T> {
        let mut runs = self.runs.write().await;
        let run = runs
            .iter_mut()
            .find(|r| r.metadata.uid == uid)
            .ok_or_else(|| DaqError::DataUnavailable(format!("no run {uid}")))?;
        Ok(f(run))
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn open_run(&self, metadata: RunMetadata) -> AppResult<Uuid> {
        let uid = metadata.uid;
        tracing::info!(%uid, category = %metadata.category, mode = ?metadata.mode, "run opened");
        let mut runs = self.runs.write().await;
        runs.push(RunRecord {
            metadata,
            primary: PrimaryStream::default(),
            exit: None,
        });
        while runs.len() > self.retention {
            let Some(oldest) = runs.iter().position(RunRecord::is_complete) else {
                tracing::warn!(open = runs.len(), retention = self.retention, "every stored run is still open");
                break;
            };
            let evicted = runs.remove(oldest);
            tracing::debug!(uid = %evicted.metadata.uid, "run evicted");
        }
        Ok(uid)
    }

    async fn append_step(&self, uid: Uuid, row: StepRow) -> AppResult<()> {
        self.with_run(uid, |run| run.primary.push_step(&row)).await
    }

    async fn append_fly(&self, uid: Uuid, samples: &[FlyRecord]) -> AppResult<()> {
        self.with_run(uid, |run| run.primary.extend_fly(samples)).await
    }

    async fn close_run(&self, uid: Uuid, exit: RunExit) -> AppResult<()> {
        let rows = self
            .with_run(uid, |run| {
                run.exit = Some(exit);
                run.primary.len()
            })
            .await?;
        tracing::info!(%uid, ?exit, rows, "run closed");
        Ok(())
    }

    async fn recent_runs(&self, category: ScanCategory, limit: usize) -> AppResult<Vec<RunRecord>> {
        Ok(self
            .runs
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.metadata.category == category)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(energy: f64) -> StepRow {
        StepRow {
            time: 0.0,
            energy,
            dwell: 1.0,
            counts: ChannelValues {
                i0: 100.0,
                it: 50.0,
                i_f: 5.0,
                ir: 25.0,
            },
        }
    }

    #[tokio::test]
    async fn test_recent_runs_newest_first_per_category() {
        let store = MemoryRunStore::new();
        let first = store
            .open_run(RunMetadata::new(ScanCategory::Measure, ScanMode::Step, 8979.0, 2))
            .await
            .unwrap();
        store
            .open_run(RunMetadata::new(ScanCategory::Align, ScanMode::Step, 8979.0, 2))
            .await
            .unwrap();
        let second = store
            .open_run(RunMetadata::new(ScanCategory::Measure, ScanMode::Step, 8979.0, 2))
            .await
            .unwrap();

        let runs = store.recent_runs(ScanCategory::Measure, 10).await.unwrap();
        let uids: Vec<Uuid> = runs.iter().map(|r| r.metadata.uid).collect();
        assert_eq!(uids, vec![second, first]);

        let limited = store.recent_runs(ScanCategory::Measure, 1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_rows_and_close() {
        let store = MemoryRunStore::new();
        let uid = store
            .open_run(RunMetadata::new(ScanCategory::Measure, ScanMode::Step, 8979.0, 2))
            .await
            .unwrap();
        store.append_step(uid, row(8970.0)).await.unwrap();
        store.append_step(uid, row(8971.0)).await.unwrap();
        store.close_run(uid, RunExit::Success).await.unwrap();

        let run = store.get(uid).await.unwrap();
        assert!(run.is_complete());
        assert_eq!(run.primary.len(), 2);
        assert_eq!(run.primary.energy, vec![8970.0, 8971.0]);
        assert!(run.primary.encoder.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_run_is_data_unavailable() {
        let store = MemoryRunStore::new();
        assert!(matches!(
            store.append_step(Uuid::new_v4(), row(1.0)).await,
            Err(DaqError::DataUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_closed_runs() {
        let store = MemoryRunStore::with_retention(2);
        let open = store
            .open_run(RunMetadata::new(ScanCategory::Measure, ScanMode::Step, 8979.0, 1))
            .await
            .unwrap();
        let mut closed = Vec::new();
        for _ in 0..3 {
            let uid = store
                .open_run(RunMetadata::new(ScanCategory::Measure, ScanMode::Step, 8979.0, 1))
                .await
                .unwrap();
            store.close_run(uid, RunExit::Success).await.unwrap();
            closed.push(uid);
        }

        // The open run survives; only the newest closed run fits beside it.
        assert_eq!(store.len().await, 2);
        assert!(store.get(open).await.is_some());
        assert!(store.get(closed[0]).await.is_none());
        assert!(store.get(closed[1]).await.is_none());
        assert!(store.get(closed[2]).await.is_some());
        store.append_step(open, row(8970.0)).await.unwrap();
    }

    #[test]
    fn test_metadata_serializes() {
        let metadata = RunMetadata::new(ScanCategory::Calibration, ScanMode::Fly, 8979.0, 400);
        let json = serde_json::to_string(&metadata).unwrap();
        let back: RunMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
