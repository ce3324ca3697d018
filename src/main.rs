use clap::{Args, Parser, Subcommand};
use crossbeam::channel::{self, RecvTimeoutError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::collections::BTreeMap;
use traffic_vsl::dataset::{load_base_limits, load_samples, save_rows};
use traffic_vsl::metrics::rank;
use traffic_vsl::predictor::{ModelArtifact, PersistenceModel};
use traffic_vsl::sample::split_by_segment;
use traffic_vsl::synthetic::SyntheticSegment;
use traffic_vsl::{
    calibrate, Config, DensityPredictor, DualSimulator, Error, Forecaster, Inference, LiveFeed,
    Result, RunSummary, SensorSample,
};

/// Variable speed limit engine for an urban highway segment.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file. Missing settings keep their defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate one segment and write the output dataset.
    Run(RunArgs),
    /// Simulate every segment and rank them by improvement.
    Analyze(AnalyzeArgs),
    /// Simulate a synthetic segment while printing live metrics.
    Demo(DemoArgs),
    /// Print the effective configuration.
    Config,
}

#[derive(Args, Debug)]
struct InputArgs {
    /// JSON model artifact. Without one, the last observed density is used as forecast.
    #[arg(short, long)]
    model: Option<PathBuf>,
    /// CSV of per-segment base speed limits (`segment_id, base_limit`). Segments not
    /// listed use `policy.normal_limit`.
    #[arg(short, long)]
    limits: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Sensor export to read.
    data: PathBuf,
    /// Segment to simulate. Defaults to the first segment in the data.
    #[arg(short, long)]
    segment: Option<String>,
    /// Where to write `timestamp, segment_id, observed_speed, optimal_speed` rows.
    #[arg(short, long, default_value = "optimal_speed.csv")]
    output: PathBuf,
    /// Also write every frame as a line of JSON.
    #[arg(long)]
    frames: Option<PathBuf>,
    /// Fail on the first rejected record instead of skipping it.
    #[arg(long)]
    strict: bool,
    #[command(flatten)]
    inputs: InputArgs,
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    /// Sensor export to read.
    data: PathBuf,
    /// Segments with fewer samples are skipped.
    #[arg(long, default_value_t = 100)]
    min_samples: usize,
    /// Segments restricted for a smaller share of the time (in percent) are not ranked.
    #[arg(long, default_value_t = 0.1)]
    min_pct_restricted: f64,
    /// How many segments to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
    /// Where to write one report row per segment.
    #[arg(short, long, default_value = "analysis_improvements.csv")]
    output: PathBuf,
    #[command(flatten)]
    inputs: InputArgs,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Number of synthetic days.
    #[arg(long, default_value_t = 1)]
    days: usize,
    /// Seed of the synthetic data.
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
    /// Wall-clock time per tick, in ms.
    #[arg(long, default_value_t = 50)]
    tick_ms: u64,
    /// How often the live view is printed, in ms.
    #[arg(long, default_value_t = 1000)]
    refresh_ms: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        log::error!("{}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => Config::default(),
    };
    match cli.command {
        Command::Run(args) => run_segment(&config, args),
        Command::Analyze(args) => analyze(&config, args),
        Command::Demo(args) => demo(&config, args),
        Command::Config => {
            print!("{}", config.dump()?);
            Ok(())
        }
    }
}

fn load_model(args: &InputArgs) -> Result<Option<ModelArtifact>> {
    args.model
        .as_deref()
        .map(ModelArtifact::load_file)
        .transpose()
}

fn load_limits(args: &InputArgs) -> Result<BTreeMap<String, f64>> {
    match &args.limits {
        Some(path) => load_base_limits(path),
        None => Ok(BTreeMap::new()),
    }
}

/// The configuration of one segment, with its base limit if it has one.
fn segment_config(config: &Config, limits: &BTreeMap<String, f64>, segment_id: &str) -> Config {
    match limits.get(segment_id) {
        Some(&base_limit) => Config {
            policy: config.policy.with_base_limit(base_limit),
            ..config.clone()
        },
        None => config.clone(),
    }
}

fn simulator(
    config: &Config,
    samples: Vec<SensorSample>,
    model: Option<&ModelArtifact>,
) -> Result<DualSimulator> {
    let calibration = calibrate(config, &samples);
    let max_density = samples.iter().map(|s| s.density).fold(0.0, f64::max);
    let forecaster: Box<dyn Forecaster> = match model {
        Some(model) => model.clone().into_forecaster(),
        None => Box::new(PersistenceModel {
            window: config.predictor.window,
        }),
    };
    let mut predictor = DensityPredictor::new(&config.predictor, max_density);
    predictor.load(forecaster)?;
    let inference = Inference::new(
        predictor,
        config.predictor.offload,
        Duration::from_millis(config.predictor.deadline_ms),
    );
    DualSimulator::new(config, samples, calibration, inference)
}

fn run_segment(config: &Config, args: RunArgs) -> Result<()> {
    let cleaned = load_samples(&args.data, &config.cleaning)?;
    let samples = if args.strict {
        cleaned.strict()?
    } else {
        cleaned.samples
    };
    let mut segments = split_by_segment(&samples);
    let (segment_id, samples) = match &args.segment {
        Some(id) => segments.remove_entry(id),
        None => segments.into_iter().next(),
    }
    .ok_or(Error::EmptyDataset)?;

    let model = load_model(&args.inputs)?;
    let limits = load_limits(&args.inputs)?;
    let config = segment_config(config, &limits, &segment_id);
    let mut sim = simulator(&config, samples, model.as_ref())?;
    let summary = sim.run()?;
    print_summary(&summary);

    save_rows(&args.output, sim.outputs(), b',')?;
    if let Some(path) = &args.frames {
        write_frames(path, &sim)?;
    }
    Ok(())
}

fn write_frames(path: &Path, sim: &DualSimulator) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for frame in sim.frames() {
        serde_json::to_writer(&mut file, frame)?;
        writeln!(file)?;
    }
    file.flush()?;
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    let improvement = &summary.improvement;
    println!(
        "segment {}: {} ticks, restricted below {:.0} km/h {:.1}% of the time (critical density {:.1} veh/km, {:?})",
        improvement.segment_id,
        summary.ticks,
        improvement.base_limit,
        improvement.pct_restricted,
        summary.critical_density.value,
        summary.critical_density.source
    );
    for metrics in summary.real.iter().chain(&summary.optimized) {
        println!(
            "  {:>9}: mean speed {:5.1} km/h, mean travel time {:5.2} min, throughput {:6.0} veh/h",
            metrics.scenario, metrics.mean_speed, metrics.mean_travel_time, metrics.throughput
        );
    }
    if improvement.active_intervals > 0 {
        println!(
            "  while restricted: {:.1} -> {:.1} km/h ({:+.1}%)",
            improvement.observed_speed, improvement.simulated_speed, improvement.pct_speed_gain
        );
    }
    if summary.prediction_failures > 0 {
        println!(
            "  {} prediction failures ({} deadline misses)",
            summary.prediction_failures, summary.deadline_misses
        );
    }
}

fn analyze(config: &Config, args: AnalyzeArgs) -> Result<()> {
    let cleaned = load_samples(&args.data, &config.cleaning)?;
    let model = load_model(&args.inputs)?;
    let limits = load_limits(&args.inputs)?;

    let mut reports = vec![];
    for (segment_id, samples) in split_by_segment(&cleaned.samples) {
        if samples.len() < args.min_samples {
            log::debug!("Skipping segment {} with {} samples", segment_id, samples.len());
            continue;
        }
        let config = segment_config(config, &limits, &segment_id);
        let summary = simulator(&config, samples, model.as_ref())?.run()?;
        reports.push(summary.improvement);
    }
    if reports.is_empty() {
        return Err(Error::EmptyDataset);
    }

    println!("Top segments by speed gain while restricted:");
    for report in rank(&reports, args.min_pct_restricted).into_iter().take(args.top) {
        println!(
            "  {:>10}  base {:3.0} km/h  kc {:5.1}  restricted {:5.1}%  {:+5.1} km/h  {:+5.1}%",
            report.segment_id,
            report.base_limit,
            report.critical_density,
            report.pct_restricted,
            report.speed_gain,
            report.pct_speed_gain
        );
    }
    reports.sort_by(|a, b| b.pct_speed_gain.total_cmp(&a.pct_speed_gain));
    save_rows(&args.output, &reports, b',')
}

fn demo(config: &Config, args: DemoArgs) -> Result<()> {
    let segment = SyntheticSegment {
        interval_minutes: config.simulation.interval_minutes,
        seed: args.seed,
        ..Default::default()
    };
    let feed = LiveFeed::new();
    let mut sim = simulator(config, segment.days(args.days), None)?.with_feed(feed.clone());

    let (done_tx, done_rx) = channel::bounded::<()>(0);
    let refresh = Duration::from_millis(args.refresh_ms);
    let renderer = std::thread::spawn(move || loop {
        match done_rx.recv_timeout(refresh) {
            Err(RecvTimeoutError::Timeout) => {}
            _ => break,
        }
        if let Some(view) = feed.latest() {
            println!(
                "{}  {:?}  real {:5.1} km/h {:5.2} min  |  optimized {:5.1} km/h {:5.2} min",
                view.frame.timestamp,
                view.frame.action,
                view.real.current_speed,
                view.real.current_travel_time,
                view.optimized.current_speed,
                view.optimized.current_travel_time
            );
        }
    });

    let result = drive(&mut sim, Duration::from_millis(args.tick_ms));
    drop(done_tx);
    if renderer.join().is_err() {
        log::error!("Renderer thread panicked");
    }
    print_summary(&result?);
    Ok(())
}

/// Ticks in wall-clock time until the simulation ends.
fn drive(sim: &mut DualSimulator, tick: Duration) -> Result<RunSummary> {
    while sim.tick()?.is_some() {
        std::thread::sleep(tick);
    }
    Ok(sim.summary())
}
