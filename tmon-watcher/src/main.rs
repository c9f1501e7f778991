//! tmon-watcher - atmospheric transparency monitor
//!
//! Runs the job watcher by default; the other subcommands expose single steps for
//! operations and commissioning.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tmon_common::config::{load_toml_config, resolve_config_path, resolve_database_path, CONFIG_ENV_VAR};
use tmon_common::db::{init_database, ColumnMap};
use tmon_common::logging::init_tracing;
use tmon_watcher::catalogue::ArtifactPaths;
use tmon_watcher::detector::{CachedDetector, ImcoreDetector};
use tmon_watcher::frame::FitsFrameReader;
use tmon_watcher::{queue, supervisor, Orchestrator, WatcherConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tmon-watcher")]
#[command(about = "Atmospheric transparency monitor")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// SQLite database (overrides database_path in the configuration)
    #[arg(short, long, global = true, env = "TMON_DATABASE")]
    database: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the job queue and process transmission jobs (default)
    Watch,

    /// Build the reference catalogue of one reference frame
    BuildCatalogue {
        refimage: PathBuf,
        #[arg(long)]
        npix: Option<u32>,
        #[arg(long)]
        threshold: Option<f64>,
        #[arg(long)]
        fwhmfilt: Option<f64>,
        #[arg(long)]
        isolation_radius: Option<f64>,
        #[arg(long)]
        aperture_radius: Option<f64>,
        /// Write a DS9 region file of kept (green) and detected (red) sources
        #[arg(long)]
        region: Option<PathBuf>,
        /// Archive the catalogue as a FITS table
        #[arg(long)]
        fits_out: Option<PathBuf>,
    },

    /// Measure one science frame against its reference catalogue and record it
    Measure {
        filename: PathBuf,
        #[arg(long)]
        radius_inner: Option<f64>,
        #[arg(long)]
        radius_outer: Option<f64>,
    },

    /// Create or update the database schema
    InitDb,

    /// Queue a transmission job for a frame
    Submit { file: PathBuf },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref(), CONFIG_ENV_VAR);
    let mut config: WatcherConfig = load_toml_config(config_path.as_deref())?;

    init_tracing(&config.base.logging, cli.verbose)?;

    info!(
        "Starting tmon-watcher v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let columns = ColumnMap::resolve(config.base.schema_path.as_deref())
        .context("Failed to load column map")?;
    let db_path = resolve_database_path(cli.database.as_deref(), &config.base);
    info!("Database: {}", db_path.display());
    let pool = init_database(&db_path, &columns).await?;

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => {
            let detector = CachedDetector::new(ImcoreDetector::new(&config.detection.detector_binary));
            let orchestrator = Orchestrator::new(pool, config.clone(), &columns, detector, FitsFrameReader)?;
            let supervisor = supervisor::from_config(&config.supervisor, orchestrator.instance_id())?;
            let orchestrator = orchestrator.with_supervisor(supervisor);

            tokio::select! {
                result = orchestrator.run() => result?,
                _ = tokio::signal::ctrl_c() => info!("Interrupted, stopping"),
            }
        }
        Command::BuildCatalogue {
            refimage,
            npix,
            threshold,
            fwhmfilt,
            isolation_radius,
            aperture_radius,
            region,
            fits_out,
        } => {
            let detection = &mut config.detection;
            detection.n_pixels = npix.unwrap_or(detection.n_pixels);
            detection.threshold = threshold.unwrap_or(detection.threshold);
            detection.fwhm_filter = fwhmfilt.unwrap_or(detection.fwhm_filter);
            detection.isolation_radius = isolation_radius.unwrap_or(detection.isolation_radius);
            detection.aperture_radius = aperture_radius.unwrap_or(detection.aperture_radius);

            let detector = ImcoreDetector::new(&config.detection.detector_binary);
            let orchestrator = Orchestrator::new(pool, config, &columns, detector, FitsFrameReader)?;
            let entries = orchestrator
                .build_catalogue_file(
                    &refimage,
                    ArtifactPaths {
                        region: region.as_deref(),
                        fits: fits_out.as_deref(),
                    },
                )
                .await?;
            info!(sources = entries.len(), "Reference catalogue stored");
        }
        Command::Measure {
            filename,
            radius_inner,
            radius_outer,
        } => {
            let photometry = &mut config.photometry;
            photometry.sky_radius_inner = radius_inner.unwrap_or(photometry.sky_radius_inner);
            photometry.sky_radius_outer = radius_outer.unwrap_or(photometry.sky_radius_outer);

            let detector = ImcoreDetector::new(&config.detection.detector_binary);
            let orchestrator = Orchestrator::new(pool, config, &columns, detector, FitsFrameReader)?;
            let entry = orchestrator.measure_file(&filename).await?;
            info!(
                image_id = entry.image_id,
                median_flux_ratio = entry.median_flux_ratio,
                flux_ratio_err = entry.flux_ratio_err,
                "Transmission recorded"
            );
        }
        Command::InitDb => {
            info!("Schema is up to date");
        }
        Command::Submit { file } => {
            let job_id = queue::enqueue_job(
                &pool,
                &config.queue.job_type,
                &file.display().to_string(),
                config.queue.job_lifetime_secs,
            )
            .await?;
            info!(job_id, file = %file.display(), "Job queued");
        }
    }

    Ok(())
}
