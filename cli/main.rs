#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use psix::progress::{TurboBuildObserver, TurboBuildStage};
use psix::turbo::{OBSERVED_BINS, REFERENCE_BINS};
use psix::{ModelParameters, ScoringConfig, TurboTable};

#[derive(Args)]
pub struct BuildTurboArgs {
    /// Directory that receives one turbo_mrna_<k>.tsv file per molecule count and turbo.toml
    #[arg(long, value_name = "DIR")]
    pub out: PathBuf,

    /// Largest captured-molecule count to tabulate
    #[arg(long, value_name = "N")]
    pub max_molecules: u32,

    /// Capture efficiency; overrides the value from --config
    #[arg(long, value_name = "C")]
    pub capture_efficiency: Option<f64>,

    /// Probability floor applied to every table entry; overrides the value from --config
    #[arg(long, value_name = "P")]
    pub min_probability: Option<f64>,

    /// Scoring configuration (.toml) supplying defaults for the model parameters
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Parser)]
#[command(
    name = "psix",
    about = "Capture-noise aware splicing scores for single-cell data",
    long_about = "Tools around the psix score: precompute and validate the turbo lookup \
                  tables used to accelerate scoring, and manage scoring configuration."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Precompute noise-model tables for fast scoring
    #[command(about = "Build turbo lookup tables (outputs: turbo_mrna_<k>.tsv, turbo.toml)")]
    BuildTurbo(BuildTurboArgs),

    /// Load a table directory and report what it holds
    #[command(about = "Validate a directory of turbo lookup tables")]
    CheckTurbo {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Print or write the default scoring configuration
    #[command(about = "Emit the default scoring configuration as TOML")]
    Config {
        /// Write to this file instead of standard output
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::BuildTurbo(args)) => run_build_turbo(args),
        Some(Commands::CheckTurbo { dir }) => run_check_turbo(dir),
        Some(Commands::Config { out }) => run_config(out),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run_build_turbo(args: BuildTurboArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ScoringConfig::load(path)?,
        None => ScoringConfig::default(),
    };
    if let Some(capture_efficiency) = args.capture_efficiency {
        config.capture_efficiency = capture_efficiency;
    }
    if let Some(min_probability) = args.min_probability {
        config.min_probability = min_probability;
    }
    let params: ModelParameters = config.validate()?;

    println!(
        "Building turbo tables for 1..={} molecules (capture efficiency {}, floor {})",
        args.max_molecules,
        params.capture_efficiency(),
        params.min_probability()
    );

    let progress = BarProgress::default();
    let turbo = TurboTable::build(&params, args.max_molecules, &progress)?;
    turbo.save(&args.out, &progress)?;

    println!(
        "Wrote {} tables to {}",
        turbo.max_molecules(),
        args.out.display()
    );
    Ok(())
}

fn run_check_turbo(dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let turbo = TurboTable::load(&dir)?;
    let mut smallest = f64::INFINITY;
    let mut largest = f64::NEG_INFINITY;
    for molecules in 1..=turbo.max_molecules() {
        if let Some(table) = turbo.table(molecules) {
            for &value in table {
                smallest = smallest.min(value);
                largest = largest.max(value);
            }
        }
    }

    let mut low = ryu::Buffer::new();
    let mut high = ryu::Buffer::new();
    println!("Directory: {}", dir.display());
    println!(
        "Tables: {} (molecule counts 1..={})",
        turbo.max_molecules(),
        turbo.max_molecules()
    );
    println!(
        "Model: capture efficiency {}, floor {}",
        turbo.params().capture_efficiency(),
        turbo.params().min_probability()
    );
    println!("Grid: {OBSERVED_BINS} observed x {REFERENCE_BINS} reference bins");
    println!(
        "Entry range: [{}, {}]",
        low.format(smallest),
        high.format(largest)
    );
    Ok(())
}

fn run_config(out: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = ScoringConfig::default();
    match out {
        Some(path) => {
            config.save(&path)?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("PSIX_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("psix {version}");

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}

fn format_duration_ago(seconds: u64) -> String {
    match seconds {
        0..=59 => format!("{seconds} seconds ago"),
        60..=3599 => format!("{} minutes ago", seconds / 60),
        3600..=86_399 => format!("{} hours ago", seconds / 3600),
        _ => format!("{} days ago", seconds / 86_400),
    }
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

/// Drives one progress bar per build stage.
#[derive(Default)]
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl TurboBuildObserver for BarProgress {
    fn on_stage_start(&self, stage: TurboBuildStage, total_tables: usize) {
        if let Ok(mut slot) = self.bar.lock() {
            *slot = Some(create_progress_bar(total_tables as u64, stage.describe()));
        }
    }

    fn on_table_finished(&self, stage: TurboBuildStage, molecules: u32) {
        let _ = (stage, molecules);
        if let Ok(slot) = self.bar.lock()
            && let Some(bar) = slot.as_ref()
        {
            bar.inc(1);
        }
    }

    fn on_stage_finish(&self, stage: TurboBuildStage) {
        if let Ok(mut slot) = self.bar.lock()
            && let Some(bar) = slot.take()
        {
            bar.finish_with_message(format!("{stage} complete"));
        }
    }
}
