//! Command-line entry point for the spectra workflow.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use spectra::{load_config, RechunkOutcome, RunOptions, Stage, Workflow};

#[derive(Parser, Debug)]
#[command(name = "spectra")]
#[command(about = "Rechunk a climate variable and summarise its power spectrum by frequency band")]
struct Args {
    /// Workflow configuration file
    #[arg(short, long, env = "SPECTRA_CONFIG", default_value = "config/spectra.yaml")]
    config: PathBuf,

    /// Log level, overriding the config file (RUST_LOG takes precedence)
    #[arg(long)]
    log_level: Option<String>,

    /// Print the rechunk plan without touching storage
    #[arg(long)]
    dry_run: bool,

    /// Erase an incomplete target store before rewriting it
    #[arg(long)]
    clear_target: bool,

    /// Stages to run
    #[arg(long, value_enum, default_value = "all")]
    stage: Stage,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args.config)?;

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    info!(
        config = %args.config.display(),
        dataset = %config.catalog.dataset,
        variable = %config.catalog.variable,
        stage = ?args.stage,
        dry_run = args.dry_run,
        "Starting spectra workflow"
    );

    let workflow = Workflow::prepare(config).await?;
    let options = RunOptions {
        stage: args.stage,
        dry_run: args.dry_run,
        clear_target: args.clear_target,
    };
    let outcome = workflow.run(&options).await?;

    if let Some(RechunkOutcome::DryRun { summary }) = &outcome.rechunk {
        println!("{}", summary);
    }

    if let Some(report) = &outcome.spectrum {
        for region in &report.regions {
            for band in &region.bands {
                info!(
                    region = %region.name,
                    band = %band.label,
                    mean = ?band.mean,
                    valid_cells = band.valid_cells,
                    "Band mean"
                );
            }
        }
        info!(
            bands = %report.bands_path,
            report = %workflow.paths().report_key(),
            "Spectrum outputs written"
        );
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = fmt().with_env_filter(filter).with_target(true).with_level(true);

    match format {
        "pretty" => builder.pretty().init(),
        _ => builder.json().init(),
    }
}
