//! Live pipeline passes over stored runs.

use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;
use xafs_daq::bus::EventSender;
use xafs_daq::config::{FlyerConfig, HardwareConfig, PipelineConfig};
use xafs_daq::error::AppResult;
use xafs_daq::flyer::{FlyRecord, FlyScanPlan, Flyer, FlyerSession};
use xafs_daq::hardware::io::{AbortFlag, DeviceIo};
use xafs_daq::hardware::mock::MockBeamline;
use xafs_daq::hardware::{ScalarChannel, WaveformChannel};
use xafs_daq::messages::{DcmChannel, EventMessage, ScanCategory};
use xafs_daq::pipeline::PipelineWorker;
use xafs_daq::store::{
    ChannelValues, FlyGeometry, MemoryRunStore, RunExit, RunMetadata, RunRecord, RunStore,
    ScanMode, StepRow,
};
use xafs_daq::viewer::render::{read_plot, RenderContext, RenderSink};
use xafs_daq::viewer::{SharedSettings, ViewSettings};

struct Harness {
    store: Arc<MemoryRunStore>,
    settings: SharedSettings,
    render: RenderContext,
    sink: RenderSink,
    worker: PipelineWorker,
    to_controller: broadcast::Receiver<Arc<str>>,
}

fn harness_with(store: Arc<dyn RunStore>, memory: Arc<MemoryRunStore>, settings: ViewSettings) -> Harness {
    let settings = Arc::new(RwLock::new(settings));
    let (render, sink) = RenderContext::spawn();
    let (sender, to_controller) = EventSender::detached(64);
    let worker = PipelineWorker::new(
        store,
        settings.clone(),
        render.model(),
        sink.clone(),
        sender,
        PipelineConfig::default(),
    );
    Harness {
        store: memory,
        settings,
        render,
        sink,
        worker,
        to_controller,
    }
}

fn harness(settings: ViewSettings) -> Harness {
    let store = Arc::new(MemoryRunStore::new());
    harness_with(store.clone(), store, settings)
}

fn counts(i0: f64, it: f64) -> ChannelValues {
    ChannelValues {
        i0,
        it,
        i_f: it / 10.0,
        ir: it / 2.0,
    }
}

async fn step_run(store: &MemoryRunStore, category: ScanCategory, e0: f64, rows: &[(f64, ChannelValues)]) -> Uuid {
    let uid = store
        .open_run(RunMetadata::new(category, ScanMode::Step, e0, rows.len()))
        .await
        .unwrap();
    for (i, &(energy, counts)) in rows.iter().enumerate() {
        store
            .append_step(
                uid,
                StepRow {
                    time: i as f64,
                    energy,
                    dwell: 1.0,
                    counts,
                },
            )
            .await
            .unwrap();
    }
    store.close_run(uid, RunExit::Success).await.unwrap();
    uid
}

fn linear_rows(points: usize, offset: f64) -> Vec<(f64, ChannelValues)> {
    (0..points)
        .map(|i| (8970.0 + i as f64, counts(1000.0, 400.0 + offset + i as f64)))
        .collect()
}

fn drain_messages(rx: &mut broadcast::Receiver<Arc<str>>) -> Vec<EventMessage> {
    let mut messages = Vec::new();
    while let Ok(line) = rx.try_recv() {
        if let Ok(Some(message)) = EventMessage::from_wire(&line) {
            messages.push(message);
        }
    }
    messages
}

#[tokio::test]
async fn test_history_depth_draws_and_removes_slots() {
    let h = harness(ViewSettings::new(3));
    for offset in [0.0, 10.0, 20.0] {
        step_run(&h.store, ScanCategory::Measure, 8979.0, &linear_rows(5, offset)).await;
    }

    let report = h.worker.tick().await;
    h.sink.flush().await;
    assert_eq!(report.slots, 3);
    assert_eq!(report.redrawn, vec!["Data 0", "Data 1", "Data 2"]);

    h.settings.write().await.history_depth = 1;
    let report = h.worker.tick().await;
    h.sink.flush().await;
    assert_eq!(report.removed, vec!["Data 1", "Data 2"]);
    assert!(report.redrawn.is_empty());
    let model = h.render.model();
    assert_eq!(read_plot(&model).curve_names(), vec!["Data 0"]);
}

#[tokio::test]
async fn test_unchanged_data_is_not_redrawn() {
    let h = harness(ViewSettings::default());
    let uid = step_run(&h.store, ScanCategory::Measure, 8979.0, &linear_rows(4, 0.0)).await;

    assert_eq!(h.worker.tick().await.redrawn, vec!["Data 0"]);
    h.sink.flush().await;
    assert!(h.worker.tick().await.redrawn.is_empty());

    let run = h.store.get(uid).await.unwrap();
    let model = h.render.model();
    let plot = read_plot(&model);
    let curve = plot.curve("Data 0").unwrap();
    assert_eq!(curve.len(), run.primary.len());
    assert_eq!(curve.x[0], -9.0);
}

#[tokio::test]
async fn test_step_run_without_readings_draws_empty_curve() {
    let h = harness(ViewSettings::default());
    step_run(&h.store, ScanCategory::Measure, 8979.0, &[]).await;

    let report = h.worker.tick().await;
    h.sink.flush().await;
    assert!(report.skipped.is_empty());
    let model = h.render.model();
    let plot = read_plot(&model);
    assert!(plot.curve("Data 0").unwrap().is_empty());
}

#[tokio::test]
async fn test_broken_slot_does_not_block_others() {
    let h = harness(ViewSettings::new(2));
    step_run(&h.store, ScanCategory::Measure, 8979.0, &linear_rows(4, 0.0)).await;

    // Fly run recorded without geometry: its encoder counts cannot be converted.
    let uid = h
        .store
        .open_run(RunMetadata::new(ScanCategory::Measure, ScanMode::Fly, 8979.0, 2))
        .await
        .unwrap();
    let samples: Vec<FlyRecord> = (0..2)
        .map(|i| FlyRecord {
            time: 0.0,
            encoder: f64::from(i),
            angle: 0.0,
            energy: 0.0,
            i0: 1000.0,
            it: 400.0,
            i_f: 40.0,
            ir: 200.0,
        })
        .collect();
    h.store.append_fly(uid, &samples).await.unwrap();
    h.store.close_run(uid, RunExit::Success).await.unwrap();

    let report = h.worker.tick().await;
    assert_eq!(report.skipped, vec![0]);
    assert_eq!(report.redrawn, vec!["Data 1"]);
}

#[tokio::test]
async fn test_open_fly_run_is_drawn_from_live_waveforms() {
    let beamline = Arc::new(MockBeamline::new());
    let io = DeviceIo::new(beamline.clone(), &HardwareConfig::default(), AbortFlag::new());
    let start = io.read(ScalarChannel::MotorPosition).await.unwrap();
    let resolution = io.read(ScalarChannel::EncoderResolution).await.unwrap();
    let sign = beamline.encoder_sign().await;
    let plan = FlyScanPlan::new(start, 8989.0, 0.5, 10.0, sign, resolution).unwrap();

    // Sweep finished but not drained: the samples only exist on the counter card.
    let flyer = Flyer::new(
        io.clone(),
        FlyerConfig {
            poll_interval_ms: 5,
            reset_settle_ms: 0,
            kickoff_settle_ms: 5,
            ..FlyerConfig::default()
        },
    );
    let mut session = FlyerSession::new(plan);
    flyer.arm(&mut session).await.unwrap();
    flyer.start(&mut session).await.unwrap();
    flyer
        .await_completion(&session, Duration::from_secs(5))
        .await
        .unwrap();

    let mut h = harness(ViewSettings::default());
    h.worker = h.worker.with_live_source(io.clone());
    let geometry = FlyGeometry {
        start_energy: plan.start_energy(),
        stop_energy: plan.stop_energy(),
        start_angle: plan.start_angle,
        stop_angle: plan.target_angle,
        encoder_resolution: resolution,
        encoder_steps: 10.0,
        encoder_sign: sign,
        speed: 0.5,
    };
    let mut metadata =
        RunMetadata::new(ScanCategory::Measure, ScanMode::Fly, 8979.0, plan.requested_samples);
    metadata.fly_geometry = Some(geometry);
    let uid = h.store.open_run(metadata).await.unwrap();

    let report = h.worker.tick().await;
    h.sink.flush().await;
    assert_eq!(report.redrawn, vec!["Data 0"]);
    assert!(h.store.get(uid).await.unwrap().primary.is_empty());

    let encoder = io
        .read_waveform(WaveformChannel::Encoder)
        .await
        .unwrap()
        .unwrap();
    assert!(encoder.len() > 100);
    let model = h.render.model();
    let plot = read_plot(&model);
    let curve = plot.curve("Data 0").unwrap();
    assert_eq!(curve.len(), encoder.len());
    let calibration = geometry.encoder();
    for (x, &counts) in curve.x.iter().zip(&encoder) {
        assert!((x - (calibration.energy(counts) - 8979.0)).abs() < 1e-9);
    }
}

#[tokio::test]
async fn test_calibration_reports_peak_and_difference() {
    let mut settings = ViewSettings::default();
    settings.switch_tab(ScanCategory::Calibration);
    let mut h = harness(settings);

    // Absorption edge centred at 8980.3 eV: the steepest backward step ends at 8981.
    let rows: Vec<(f64, ChannelValues)> = (0..21)
        .map(|i| {
            let energy = 8970.0 + f64::from(i);
            let mu = (energy - 8980.3).atan() + 2.0;
            (energy, counts(1000.0, 1000.0 * (-mu).exp()))
        })
        .collect();
    step_run(&h.store, ScanCategory::Calibration, 8979.0, &rows).await;

    h.worker.tick().await;
    h.sink.flush().await;
    let messages = drain_messages(&mut h.to_controller);
    assert!(messages.contains(&EventMessage::PeakEnergyLabel(8981.0)));
    assert!(messages.contains(&EventMessage::EnergyDifferenceLabel(2.0)));
    assert!(messages.contains(&EventMessage::ProgressBar(100)));

    let model = h.render.model();
    let plot = read_plot(&model);
    assert!(plot.right_axis_visible());
    assert!(plot.curve("derivative").is_some());
}

#[tokio::test]
async fn test_align_reports_dcm_readbacks() {
    let mut settings = ViewSettings::default();
    settings.switch_tab(ScanCategory::Align);
    let mut h = harness(settings);
    let rows = vec![
        (8979.0, counts(1000.0, 400.0)),
        (8979.0, counts(1234.567, 400.0)),
    ];
    step_run(&h.store, ScanCategory::Align, 8979.0, &rows).await;

    h.worker.tick().await;
    let messages = drain_messages(&mut h.to_controller);
    assert!(messages.contains(&EventMessage::DcmReadback {
        channel: DcmChannel::I0,
        value: 1234.57,
    }));
    assert!(messages.contains(&EventMessage::DcmReadback {
        channel: DcmChannel::I0Scaled,
        value: 864.2,
    }));
    assert!(!messages
        .iter()
        .any(|m| matches!(m, EventMessage::ProgressBar(_))));
}

/// Store whose listing takes a while, so wakes pile up during a pass.
struct SlowStore {
    inner: Arc<MemoryRunStore>,
    delay: Duration,
}

#[async_trait]
impl RunStore for SlowStore {
    async fn open_run(&self, metadata: RunMetadata) -> AppResult<Uuid> {
        self.inner.open_run(metadata).await
    }

    async fn append_step(&self, uid: Uuid, row: StepRow) -> AppResult<()> {
        self.inner.append_step(uid, row).await
    }

    async fn append_fly(&self, uid: Uuid, samples: &[FlyRecord]) -> AppResult<()> {
        self.inner.append_fly(uid, samples).await
    }

    async fn close_run(&self, uid: Uuid, exit: RunExit) -> AppResult<()> {
        self.inner.close_run(uid, exit).await
    }

    async fn recent_runs(&self, category: ScanCategory, limit: usize) -> AppResult<Vec<RunRecord>> {
        tokio::time::sleep(self.delay).await;
        self.inner.recent_runs(category, limit).await
    }
}

#[tokio::test]
async fn test_wakes_during_a_pass_collapse_into_one() {
    let memory = Arc::new(MemoryRunStore::new());
    let slow = Arc::new(SlowStore {
        inner: memory.clone(),
        delay: Duration::from_millis(150),
    });
    let h = harness_with(slow, memory, ViewSettings::default());
    step_run(&h.store, ScanCategory::Measure, 8979.0, &linear_rows(4, 0.0)).await;

    let wake = h.worker.wake_handle();
    let passes = h.worker.pass_counter();
    let task = h.worker.spawn();

    wake.wake();
    tokio::time::sleep(Duration::from_millis(30)).await;
    for _ in 0..5 {
        wake.wake();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(passes.load(Ordering::SeqCst), 2);

    wake.wake();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(passes.load(Ordering::SeqCst), 3);
    task.abort();
}
