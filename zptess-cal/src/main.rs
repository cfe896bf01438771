//! Photometer calibration tool (zptess-cal) - Main entry point
//!
//! Operator commands for calibration batches and sessions. Sensor transport
//! is not part of this binary; `calibrate` drives simulated photometers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use zptess_cal::calibration::SessionOrchestrator;
use zptess_cal::persistence::{BatchLifecycle, SqliteBatchLifecycle, SqliteGateway};
use zptess_cal::source::{SimulatedPhotometer, SimulationParams};
use zptess_common::config::{
    default_database_path, load_toml, resolve_config_path, CalibrationConfig,
    CalibrationOverrides,
};
use zptess_common::db::{init_database, Channel, Photometer, PhotometerInfo};
use zptess_common::events::{CalibrationEvent, EventBus};

/// Command-line arguments for zptess-cal
#[derive(Parser, Debug)]
#[command(name = "zptess-cal")]
#[command(about = "Zero point calibration for TESS photometers")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(short, long, global = true, env = "ZPTESS_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Calibration batch management
    Batch {
        #[command(subcommand)]
        action: BatchAction,
    },
    /// Calibrate a test photometer against the reference
    Calibrate(CalibrateArgs),
    /// Set or clear the operator note on a stored summary
    Annotate {
        summary_id: i64,
        /// Note text; omit to clear
        text: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum BatchAction {
    /// Open a new batch
    Begin {
        #[arg(long)]
        comment: Option<String>,
    },
    /// Close the open batch
    End,
    /// Delete closed batches without converged calibrations
    Purge,
    /// List summaries not attached to any batch
    Orphan,
    /// List batches
    View,
}

#[derive(Args, Debug)]
struct CalibrateArgs {
    /// Test photometer name
    #[arg(long)]
    test_name: String,
    #[arg(long, default_value = "00:00:00:00:00:01")]
    test_mac: String,
    #[arg(long, default_value = "TESS-W")]
    test_model: String,
    /// Test dark frequency (Hz)
    #[arg(long, default_value_t = 0.0)]
    test_offset: f64,

    /// Reference photometer name
    #[arg(long, default_value = "stars3")]
    ref_name: String,
    #[arg(long, default_value = "18:FE:34:CF:E9:A3")]
    ref_mac: String,
    #[arg(long, default_value = "TESS-W")]
    ref_model: String,
    /// Reference dark frequency (Hz)
    #[arg(long, default_value_t = 0.0)]
    ref_offset: f64,

    /// Simulated reference frequency (Hz)
    #[arg(long, default_value_t = 10.0)]
    ref_freq: f64,
    /// Simulated test frequency (Hz)
    #[arg(long, default_value_t = 9.5)]
    test_freq: f64,
    /// Simulated relative noise
    #[arg(long, default_value_t = 0.005)]
    noise: f64,
    /// Simulated reading period (ms)
    #[arg(long, default_value_t = 200)]
    period_ms: u64,
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Register photometers and stop
    #[arg(long)]
    dry_run: bool,

    #[command(flatten)]
    overrides: OverrideArgs,
}

/// Per-run overrides of the calibration settings
#[derive(Args, Debug)]
struct OverrideArgs {
    /// Accepted rounds per session
    #[arg(short = 'R', long)]
    rounds: Option<usize>,
    /// Samples per channel per round
    #[arg(short = 'P', long)]
    samples_per_round: Option<usize>,
    /// Round window timeout (seconds)
    #[arg(long)]
    window_timeout: Option<f64>,
    #[arg(long)]
    stability_threshold: Option<f64>,
    #[arg(long)]
    max_round_retries: Option<u32>,
    #[arg(long)]
    retention: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    zp_offset: Option<f64>,
    #[arg(long)]
    zp_fict: Option<f64>,
    #[arg(long, env = "ZPTESS_AUTHOR")]
    author: Option<String>,
}

impl From<&OverrideArgs> for CalibrationOverrides {
    fn from(args: &OverrideArgs) -> Self {
        CalibrationOverrides {
            rounds: args.rounds,
            samples_per_round: args.samples_per_round,
            window_timeout_secs: args.window_timeout,
            stability_threshold: args.stability_threshold,
            max_round_retries: args.max_round_retries,
            outlier_retention_fraction: args.retention,
            zp_offset: args.zp_offset,
            zp_fict: args.zp_fict,
            author: args.author.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());
    let toml_config = load_toml(config_path.as_deref()).context("Failed to load configuration")?;

    // Initialize tracing
    let default_filter = format!("zptess_cal={0},zptess_common={0}", toml_config.logging.level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Some(path) = &config_path {
        info!("Configuration file: {}", path.display());
    }

    let db_path = cli
        .database
        .clone()
        .or_else(|| toml_config.database_path.clone())
        .unwrap_or_else(default_database_path);
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let gateway = SqliteGateway::new(pool.clone());
    let lifecycle = SqliteBatchLifecycle::new(pool.clone());

    match cli.command {
        Command::Batch { action } => run_batch(&lifecycle, action).await,
        Command::Annotate { summary_id, text } => {
            gateway
                .annotate_summary(summary_id, text.as_deref())
                .await
                .context("Failed to annotate summary")?;
            Ok(())
        }
        Command::Calibrate(args) => {
            let mut config = CalibrationConfig::load_settings(&pool)
                .await
                .context("Failed to load calibration settings")?;
            let cli_overrides = CalibrationOverrides::from(&args.overrides);
            config.apply(&cli_overrides.or(toml_config.calibration.clone()));
            run_calibration(gateway, lifecycle, config, args).await
        }
    }
}

async fn run_batch(lifecycle: &SqliteBatchLifecycle, action: BatchAction) -> Result<()> {
    match action {
        BatchAction::Begin { comment } => {
            let batch = lifecycle
                .begin(comment.as_deref())
                .await
                .context("Failed to open batch")?;
            info!("Batch {} opened at {}", batch.id, batch.opened_at);
        }
        BatchAction::End => {
            let batch = lifecycle.end().await.context("Failed to close batch")?;
            info!(
                "Batch {} closed with {} calibrations",
                batch.id, batch.calibration_count
            );
        }
        BatchAction::Purge => {
            let removed = lifecycle.purge().await.context("Failed to purge batches")?;
            info!("Removed {} empty batches", removed);
        }
        BatchAction::Orphan => {
            for s in lifecycle.orphans().await.context("Failed to list orphans")? {
                println!(
                    "{:>6}  {}  photometer {:>4}  ZP {}  converged {}",
                    s.id.unwrap_or_default(),
                    s.session_id.format("%Y-%m-%dT%H:%M:%S"),
                    s.photometer_id,
                    fmt_mag(s.final_zero_point),
                    s.convergence_flag
                );
            }
        }
        BatchAction::View => {
            for b in lifecycle.view().await.context("Failed to list batches")? {
                println!(
                    "{:>4}  {:<6}  {}  {}  {:>4}  {}",
                    b.id,
                    b.status.as_str(),
                    b.opened_at.format("%Y-%m-%dT%H:%M:%S"),
                    b.closed_at
                        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".repeat(19)),
                    b.calibration_count,
                    b.comment.as_deref().unwrap_or("")
                );
            }
        }
    }
    Ok(())
}

async fn run_calibration(
    gateway: SqliteGateway,
    lifecycle: SqliteBatchLifecycle,
    config: CalibrationConfig,
    args: CalibrateArgs,
) -> Result<()> {
    let reference = gateway
        .register_photometer(&PhotometerInfo {
            name: args.ref_name.clone(),
            mac: args.ref_mac.clone(),
            model: args.ref_model.clone(),
            freq_offset: args.ref_offset,
        })
        .await
        .context("Failed to register reference photometer")?;
    let test = gateway
        .register_photometer(&PhotometerInfo {
            name: args.test_name.clone(),
            mac: args.test_mac.clone(),
            model: args.test_model.clone(),
            freq_offset: args.test_offset,
        })
        .await
        .context("Failed to register test photometer")?;

    log_photometer("REF.", &reference);
    log_photometer("TEST", &test);

    if args.dry_run {
        info!("Dry run. Will stop here ...");
        return Ok(());
    }

    let batch = lifecycle
        .current_open_batch()
        .await?
        .context("No open batch, run `zptess-cal batch begin` first")?;

    let period = Duration::from_millis(args.period_ms);
    let ref_source = SimulatedPhotometer::new(
        Channel::Reference,
        SimulationParams {
            base_frequency: args.ref_freq,
            freq_offset: reference.freq_offset,
            noise: args.noise,
            period,
            zp_fict: config.zp_fict,
            seed: args.seed,
        },
    );
    let test_source = SimulatedPhotometer::new(
        Channel::Test,
        SimulationParams {
            base_frequency: args.test_freq,
            freq_offset: test.freq_offset,
            noise: args.noise,
            period,
            zp_fict: config.zp_fict,
            seed: args.seed.wrapping_add(1),
        },
    );

    let events = Arc::new(EventBus::default());
    let reporter = tokio::spawn(report(
        events.subscribe(),
        reference.name.clone(),
        test.name.clone(),
    ));

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, aborting session");
            token.cancel();
        }
    });

    let orchestrator = SessionOrchestrator::new(gateway, lifecycle, events);
    let result = orchestrator
        .run_session(
            &batch,
            &test,
            &reference,
            &config,
            ref_source,
            test_source,
            cancel,
        )
        .await;

    // Closing the bus ends the reporter if no terminal event was sent
    drop(orchestrator);
    finish_reporter(reporter).await;

    let record = result.context("Calibration session failed")?;
    info!(
        "Summary {} stored in batch {}",
        record.summary.id.unwrap_or_default(),
        batch.id
    );
    Ok(())
}

fn log_photometer(tag: &str, p: &Photometer) {
    info!(
        "[{}] {:<8} MAC {} model {} freq. offset {:.3} Hz",
        tag, p.name, p.mac, p.model, p.freq_offset
    );
}

fn fmt_mag(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

/// Wait for the reporter; a panic there is logged, never fatal
async fn finish_reporter(reporter: tokio::task::JoinHandle<()>) -> bool {
    match reporter.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Progress reporter stopped abnormally: {}", e);
            false
        }
    }
}

/// Render round and summary blocks from the event stream
async fn report(
    mut rx: tokio::sync::broadcast::Receiver<CalibrationEvent>,
    ref_name: String,
    test_name: String,
) {
    use tokio::sync::broadcast::error::RecvError;

    let mut zero_points: Vec<f64> = Vec::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Report lagged, {} events skipped", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        match event {
            CalibrationEvent::RoundAccepted {
                index,
                total,
                round_zero_point,
                ref_stats,
                test_stats,
                window_start,
                window_end,
            } => {
                zero_points.push(round_zero_point);
                info!("{}", "=".repeat(72));
                info!(
                    "{:<10} {:02}/{:02}: New ZP = {:.2} ({}-{})",
                    "ROUND",
                    index + 1,
                    total,
                    round_zero_point,
                    window_start.format("%H:%M:%S"),
                    window_end.format("%H:%M:%S")
                );
                for (tag, name, stats) in [("REF.", &ref_name, ref_stats), ("TEST", &test_name, test_stats)] {
                    info!(
                        "[{}] {:<8} [{:03}] f = {:.3} Hz, m = {:.2}, \u{03c3} = {:.3}",
                        tag, name, stats.n, stats.frequency, stats.mean, stats.stddev
                    );
                }
            }
            CalibrationEvent::RoundRetry {
                index,
                attempt,
                reason,
            } => {
                warn!("Round {} attempt {} failed: {}", index + 1, attempt, reason);
            }
            CalibrationEvent::SessionFinalized { summary } => {
                info!("{}", "#".repeat(72));
                info!("Session = {}", summary.session_id.format("%Y-%m-%dT%H:%M:%S"));
                info!("Round ZP list is {:?}", zero_points);
                info!(
                    "Final ZP = {}, \u{03c3} = {}, Best ZP = {}",
                    fmt_mag(summary.final_zero_point),
                    fmt_mag(summary.final_stddev),
                    fmt_mag(summary.best_zero_point)
                );
                info!(
                    "Published TEST ZP ({}) = Best ZP ({}) + ZP offset ({:.2})",
                    fmt_mag(summary.published_zero_point),
                    fmt_mag(summary.best_zero_point),
                    summary.zp_offset
                );
                if summary.convergence_flag {
                    info!("Converged");
                } else {
                    warn!("Did NOT converge, review before publishing");
                }
                info!("{}", "#".repeat(72));
                break;
            }
            CalibrationEvent::SessionFailed { reason, .. } => {
                warn!("Session failed: {}", reason);
                break;
            }
            CalibrationEvent::SessionStarted { .. } | CalibrationEvent::SampleRejected { .. } => {}
        }
    }
}
