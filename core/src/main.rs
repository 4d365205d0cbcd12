use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use log::{info, warn};

use vesselnav::events::LogSink;
use vesselnav::filter::{FilterConfig, InjectorType, MeasurementType};
use vesselnav::sim::{
    EstimateRecord, ImpedanceNormalizer, TrajectoryRecord, evaluate, normalize_map, run_post_hoc,
};
use vesselnav::{VesselMap, VesselNavigator};

const LONG_ABOUT: &str = "VESSELNAV: post-hoc catheter localization in branching vessel trees.

The program replays a recorded catheter trajectory through a particle filter and writes one position estimate per time step. Each step fuses a relative displacement reading with an impedance reading, compared against the reference signal stored for every vessel segment of the map.

Inputs:
* Map JSON: {\"vessels\": [[{\"centerline_position\": .., \"reference_signal\": ..}, ..], ..], \"mappings\": [[parent, child], ..]}
* Trajectory CSV: columns displacement, impedance and an optional ground_truth

The output CSV lists the primary and secondary particle clusters, the cluster and noise counts and the population's mean alpha for every step. When ground truth is present, accuracy metrics are logged at the end of the run.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about, long_about = LONG_ABOUT)]
struct Cli {
    /// Vessel map JSON file
    #[arg(short, long, value_parser)]
    map: PathBuf,
    /// Input trajectory CSV file
    #[arg(short, long, value_parser)]
    input: PathBuf,
    /// Output estimate CSV file
    #[arg(short, long, value_parser)]
    output: PathBuf,
    #[command(flatten)]
    filter: FilterArgs,
    #[command(flatten)]
    logging: LoggingArgs,
}

/// Overrides applied on top of the configuration file (or the defaults)
#[derive(Args, Clone, Debug)]
struct FilterArgs {
    /// Filter configuration file (json|yaml|yml|toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of particles
    #[arg(long)]
    particles: Option<usize>,
    /// Impedance weighting strategy
    #[arg(long, value_enum)]
    measurement: Option<MeasurementType>,
    /// Diversity injection strategy
    #[arg(long, value_enum)]
    injector: Option<InjectorType>,
    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,
    /// Normalize the impedance stream by its first ten readings and the map by its root segment
    #[arg(long, default_value_t = false)]
    normalize_impedance: bool,
}

#[derive(Args, Clone, Debug)]
struct LoggingArgs {
    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Append log output to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Initialize the logger with a timestamped format.
///
/// # Arguments
/// * `log_level` - Log level string (off, error, warn, info, debug, trace)
/// * `log_file` - Optional path to log file (logs to stderr if None)
fn init_logger(log_level: &str, log_file: Option<&PathBuf>) -> Result<()> {
    use std::io::Write;

    let level = log_level.parse::<log::LevelFilter>().unwrap_or_else(|_| {
        eprintln!("Invalid log level '{}', defaulting to 'info'", log_level);
        log::LevelFilter::Info
    });
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level);
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] - {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.args()
        )
    });
    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let target = Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .with_context(|| format!("opening log file {}", log_path.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.try_init()?;
    Ok(())
}

fn build_config(args: &FilterArgs) -> Result<FilterConfig> {
    let mut config = match &args.config {
        Some(path) => FilterConfig::from_file(path)
            .with_context(|| format!("reading configuration {}", path.display()))?,
        None => FilterConfig::default(),
    };
    if let Some(particles) = args.particles {
        config.num_particles = particles;
    }
    if let Some(measurement) = args.measurement {
        config.measurement_type = measurement;
    }
    if let Some(injector) = args.injector {
        config.injector_type = injector;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli.logging.log_level, cli.logging.log_file.as_ref())?;

    let config = build_config(&cli.filter)?;
    let mut map = VesselMap::from_json(&cli.map)
        .with_context(|| format!("loading map {}", cli.map.display()))?;
    let mut records = TrajectoryRecord::from_csv(&cli.input)
        .with_context(|| format!("loading trajectory {}", cli.input.display()))?;
    info!(
        "Loaded {} vessels and {} trajectory steps",
        map.number_of_vessels(),
        records.len()
    );
    if cli.filter.normalize_impedance {
        map = normalize_map(&map)?;
        let mut normalizer = ImpedanceNormalizer::new();
        for record in records.iter_mut() {
            record.impedance = normalizer.normalize(record.impedance);
        }
    }

    let mut navigator = VesselNavigator::new(Rc::new(map), config)?;
    let estimates = run_post_hoc(&mut navigator, &records, &mut LogSink)?;
    EstimateRecord::to_csv(&estimates, &cli.output)
        .with_context(|| format!("writing estimates {}", cli.output.display()))?;
    info!(
        "Wrote {} estimates to {}",
        estimates.len(),
        cli.output.display()
    );

    match evaluate(&estimates) {
        Some(summary) => {
            info!(
                "RMS error {:.3}, final difference {:.3}, mean absolute deviation {:.3} ± {:.3}, mean dispersion {:.3}",
                summary.rms_error,
                summary.final_difference,
                summary.mean_absolute_deviation,
                summary.mean_absolute_deviation_sem,
                summary.mean_dispersion
            );
            if let Some(baseline) = summary.displacement_rms {
                info!("RMS error of the raw cumulative displacement {baseline:.3}");
            }
        }
        None => warn!("No ground truth in the input; skipping evaluation"),
    }
    Ok(())
}
