//! `xafs_daq` command line.
//!
//! `simulate` runs the controller and the viewer halves in one process against the
//! simulated beamline, talking over real bus sockets.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xafs_daq::bus::{EventListener, EventPublisher};
use xafs_daq::config::XafsConfig;
use xafs_daq::controller::ControllerInbox;
use xafs_daq::hardware::io::{AbortFlag, DeviceIo};
use xafs_daq::hardware::mock::{MockBeamline, MockExecutor};
use xafs_daq::messages::ScanCategory;
use xafs_daq::orchestrator::{FlySettings, Orchestrator, ScanKind, ScanRequest};
use xafs_daq::pipeline::PipelineWorker;
use xafs_daq::store::{MemoryRunStore, RunStore};
use xafs_daq::trajectory::{self, ScanSegmentSpec, SegmentMode};
use xafs_daq::viewer::render::{read_plot, RenderContext};
use xafs_daq::viewer::{ViewSettings, ViewerInbox};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "xafs_daq", version, about = "XAFS beamline acquisition core")]
struct Cli {
    /// Configuration file (defaults to config/xafs_daq.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the energy steps of a segmented scan.
    Trajectory(SegmentArgs),
    /// Run a scan against the simulated beamline.
    Simulate {
        #[command(flatten)]
        segments: SegmentArgs,
        /// Fly scan instead of a step scan.
        #[arg(long)]
        fly: bool,
        /// Number of passes.
        #[arg(long, default_value_t = 1)]
        repeats: usize,
        /// Skip settle delays.
        #[arg(long)]
        fast: bool,
    },
    /// Print the effective configuration.
    Config,
}

#[derive(clap::Args, Debug)]
struct SegmentArgs {
    /// Edge energy, eV.
    #[arg(long, default_value_t = 8979.0)]
    e0: f64,
    /// Segment boundaries relative to E0, eV.
    #[arg(long, value_delimiter = ',', allow_negative_numbers = true, default_values_t = [-200.0, -50.0, 40.0, 400.0])]
    boundaries: Vec<f64>,
    /// Spacing of each segment.
    #[arg(long, value_enum, value_delimiter = ',', default_values_t = [ModeArg::E, ModeArg::E, ModeArg::K])]
    modes: Vec<ModeArg>,
    /// Step of each segment, eV or inverse angstrom.
    #[arg(long, value_delimiter = ',', default_values_t = [10.0, 1.0, 0.05])]
    steps: Vec<f64>,
    /// Dwell time of each segment, seconds.
    #[arg(long, value_delimiter = ',', default_values_t = [1.0, 1.0, 2.0])]
    dwell: Vec<f64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeArg {
    /// Linear in energy.
    E,
    /// Linear in photoelectron wavenumber.
    K,
}

impl SegmentArgs {
    fn spec(&self) -> ScanSegmentSpec {
        ScanSegmentSpec {
            boundaries: self.boundaries.clone(),
            active: vec![true; self.boundaries.len().saturating_sub(1)],
            modes: self
                .modes
                .iter()
                .map(|m| match m {
                    ModeArg::E => SegmentMode::Energy,
                    ModeArg::K => SegmentMode::Momentum,
                })
                .collect(),
            step_sizes: self.steps.clone(),
            dwell_times: self.dwell.clone(),
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => XafsConfig::load_from(path),
        None => XafsConfig::load(),
    }
    .context("failed to load configuration")?;
    init_tracing(&config.application.log_level, cli.json_logs);

    match cli.command {
        Command::Trajectory(args) => print_trajectory(&args),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Simulate {
            segments,
            fly,
            repeats,
            fast,
        } => {
            if fast {
                config.scan.pre_position_settle_ms = 0;
                config.scan.start_settle_ms = 0;
                config.scan.fly_cooling_ms = 0;
                config.flyer.reset_settle_ms = 0;
                config.flyer.kickoff_settle_ms = 0;
            }
            simulate(config, &segments, fly, repeats).await
        }
    }
}

fn print_trajectory(args: &SegmentArgs) -> Result<()> {
    let sequence = trajectory::build(&args.spec())?.to_absolute(args.e0);
    for (index, (segment, dwell)) in sequence
        .segments()
        .iter()
        .zip(sequence.dwell_times())
        .enumerate()
    {
        for energy in segment {
            println!("{index}\t{energy:.5}\t{dwell}");
        }
    }
    eprintln!("{} points", sequence.len());
    Ok(())
}

async fn simulate(config: XafsConfig, segments: &SegmentArgs, fly: bool, repeats: usize) -> Result<()> {
    info!(name = %config.application.name, "starting simulation");
    let beamline = Arc::new(MockBeamline::new());
    let io = DeviceIo::new(beamline.clone(), &config.hardware, AbortFlag::new());
    let store = Arc::new(MemoryRunStore::with_retention(config.store.retained_runs));
    let reconnect = config.bus.reconnect_delay();

    // Controller half.
    let to_viewer = EventPublisher::bind(&config.bus.controller_addr(), config.bus.queue_capacity).await?;
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(MockExecutor::new(beamline.clone())),
        io.clone(),
        store.clone(),
        to_viewer.sender(),
        &config,
    ));
    let controller = Arc::new(ControllerInbox::new(orchestrator.clone(), to_viewer.sender()));
    let _controller_listener =
        EventListener::spawn(config.bus.viewer_addr(), reconnect, controller.clone());

    // Viewer half.
    let to_controller = EventPublisher::bind(&config.bus.viewer_addr(), config.bus.queue_capacity).await?;
    let (render, sink) = RenderContext::spawn();
    let settings = Arc::new(RwLock::new(ViewSettings::new(config.pipeline.history_depth)));
    let worker = PipelineWorker::new(
        store.clone(),
        settings.clone(),
        render.model(),
        sink.clone(),
        to_controller.sender(),
        config.pipeline.clone(),
    )
    .with_live_source(io.clone());
    let wake = worker.wake_handle();
    let worker_task = worker.spawn();
    let viewer = Arc::new(ViewerInbox::new(
        settings,
        sink.clone(),
        render.model(),
        wake.clone(),
        to_controller.sender(),
    ));
    let _viewer_listener = EventListener::spawn(config.bus.controller_addr(), reconnect, viewer.clone());

    tokio::time::sleep(reconnect * 2).await;
    viewer.announce();
    controller.set_tab(ScanCategory::Measure).await;

    orchestrator.measure_dark_current().await?;
    let kind = if fly {
        let boundaries = &segments.boundaries;
        ScanKind::Fly(FlySettings {
            start: boundaries.first().copied().unwrap_or(-200.0),
            stop: boundaries.last().copied().unwrap_or(400.0),
            speed: 0.05,
            encoder_steps: 10.0,
            encoder_sign: beamline.encoder_sign().await,
            repeats,
        })
    } else if repeats > 1 {
        ScanKind::RepeatedStep {
            spec: segments.spec(),
            repeats,
        }
    } else {
        ScanKind::Step(segments.spec())
    };
    let mut request = ScanRequest::new(ScanCategory::Measure, segments.e0, kind);
    request.operator = "simulation".to_string();
    let runs = orchestrator.run(request).await?;

    wake.wake();
    tokio::time::sleep(Duration::from_millis(config.pipeline.live_read_delay_ms + 200)).await;
    sink.flush().await;

    let status = controller.status().await;
    {
        let model = render.model();
        let plot = read_plot(&model);
        info!(
            curves = ?plot.curve_names(),
            points = plot.status.points,
            progress = status.progress,
            "simulation finished"
        );
    }
    for record in store.recent_runs(ScanCategory::Measure, runs.len()).await? {
        println!("{}", serde_json::to_string(&record.metadata)?);
    }
    worker_task.abort();
    Ok(())
}
