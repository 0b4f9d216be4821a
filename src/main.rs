//! ChurnWatch CLI
//!
//! Entry point for labeling, feature building, rolling backtests, PSI drift
//! reports and label certification.
//!
//! # Usage
//!
//! ```bash
//! churnwatch --transactions data/transactions.csv --user-logs data/user_logs.csv \
//!   backtest --windows 2017-01:2017-02,2017-02:2017-03 --out eval
//!
//! churnwatch label --expiry-month 2017-03 --reference-labels data/train_v2.csv
//! churnwatch psi --out eval
//! ```
//!
//! # Exit Codes
//!
//! - 0: Success
//! - 1: Label accuracy gate failed (or nothing comparable to gate on)
//! - 2: Configuration or usage error
//! - 3: Runtime error (missing input, I/O, no window processed)
//! - 4: Leakage violation

use anyhow::{Context, Result};
use churnwatch_backend::churn::artifacts::{write_feature_table, write_label_table};
use churnwatch_backend::churn::dates::parse_cli_date;
use churnwatch_backend::churn::event_store::load_generated_labels;
use churnwatch_backend::churn::{
    ArtifactLayout, BacktestOrchestrator, ChurnLabel, Cutoff, LabelTarget, PipelineContext,
    PipelineError, WindowOutcome, WindowSpec, YearMonth, EXIT_RUNTIME_ERROR,
};
use churnwatch_backend::config::PipelineConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================

/// Churn labeling, leak-safe features and rolling backtests
#[derive(Parser, Debug)]
#[command(name = "churnwatch", version)]
#[command(about = "Leak-safe churn labels, features, backtests and drift reports")]
struct Cli {
    /// TOML config file (else $CHURNWATCH_CONFIG, else ./churnwatch.toml)
    #[arg(long, global = true, env = "CHURNWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Transactions table (overrides [sources].transactions)
    #[arg(long, global = true)]
    transactions: Option<PathBuf>,

    /// Usage-log table (overrides [sources].user_logs)
    #[arg(long, global = true)]
    user_logs: Option<PathBuf>,

    /// Member profile table
    #[arg(long, global = true)]
    members: Option<PathBuf>,

    /// `{msno}` table naming the target population
    #[arg(long, global = true)]
    population: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Derive churn labels for one expiry month
    Label {
        /// Month whose expirations are labelled (YYYY-MM)
        #[arg(long)]
        expiry_month: YearMonth,

        /// Only transactions dated before this day may qualify
        #[arg(long)]
        cutoff: Option<String>,

        /// Reference labels to certify against before writing
        #[arg(long)]
        reference_labels: Option<PathBuf>,

        #[arg(long)]
        min_accuracy: Option<f64>,

        /// Output directory
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Build the point-in-time feature table for one cutoff
    BuildFeatures {
        /// Cutoff day (YYYY-MM-DD or YYYYMMDD) or month (YYYY-MM, last day)
        #[arg(long)]
        cutoff: String,

        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run the rolling-window backtest
    Backtest {
        /// Comma-separated CUTOFF:EXPIRY month pairs
        #[arg(long)]
        windows: Option<String>,

        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        threads: Option<usize>,

        /// SQLite ledger of completed windows
        #[arg(long)]
        ledger: Option<PathBuf>,
    },

    /// PSI of persisted windows against a reference window
    Psi {
        /// Reference window (tag or CUTOFF:EXPIRY); default earliest cutoff
        #[arg(long)]
        reference: Option<String>,

        /// Directory holding the backtest artifacts
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Certify generated labels against a reference set
    Validate {
        /// Persisted label table; computed from sources when absent
        #[arg(long)]
        generated: Option<PathBuf>,

        /// Month to label when no table is given
        #[arg(long)]
        expiry_month: Option<YearMonth>,

        #[arg(long)]
        reference_labels: Option<PathBuf>,

        #[arg(long)]
        min_accuracy: Option<f64>,

        #[arg(long)]
        out: Option<PathBuf>,
    },
}

// =============================================================================
// MAIN
// =============================================================================

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "churnwatch_backend=info,churnwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let _ = dotenv::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(err) => {
            let code = err
                .downcast_ref::<PipelineError>()
                .map_or(EXIT_RUNTIME_ERROR, PipelineError::exit_code);
            error!(exit_code = code, "{:#}", err);
            eprintln!("error: {:#}", err);
            code
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::resolve(cli.config.as_deref())?;
    if let Some(path) = cli.transactions {
        config.sources.transactions = path;
    }
    if let Some(path) = cli.user_logs {
        config.sources.user_logs = path;
    }
    if cli.members.is_some() {
        config.sources.members = cli.members;
    }
    if cli.population.is_some() {
        config.sources.population = cli.population;
    }

    match cli.command {
        Commands::Label {
            expiry_month,
            cutoff,
            reference_labels,
            min_accuracy,
            out,
        } => {
            apply_validation(&mut config, reference_labels, min_accuracy, out);
            let cutoff = cutoff.as_deref().map(parse_cutoff).transpose()?;
            cmd_label(config, expiry_month, cutoff)
        }
        Commands::BuildFeatures { cutoff, out } => {
            if let Some(out) = out {
                config.backtest.output_dir = out;
            }
            cmd_build_features(config, parse_cutoff(&cutoff)?)
        }
        Commands::Backtest {
            windows,
            out,
            threads,
            ledger,
        } => {
            if let Some(raw) = windows {
                config.backtest.windows = WindowSpec::parse_list(&raw)?;
            }
            if let Some(out) = out {
                config.backtest.output_dir = out;
            }
            if let Some(threads) = threads {
                config.backtest.threads = threads;
            }
            if ledger.is_some() {
                config.backtest.ledger_path = ledger;
            }
            cmd_backtest(config)
        }
        Commands::Psi {
            reference,
            out,
            threshold,
        } => {
            if let Some(out) = out {
                config.backtest.output_dir = out;
            }
            if let Some(threshold) = threshold {
                config.drift.high_drift_threshold = threshold;
            }
            cmd_psi(config, reference.as_deref())
        }
        Commands::Validate {
            generated,
            expiry_month,
            reference_labels,
            min_accuracy,
            out,
        } => {
            apply_validation(&mut config, reference_labels, min_accuracy, out);
            cmd_validate(config, generated, expiry_month)
        }
    }
}

fn apply_validation(
    config: &mut PipelineConfig,
    reference_labels: Option<PathBuf>,
    min_accuracy: Option<f64>,
    out: Option<PathBuf>,
) {
    if reference_labels.is_some() {
        config.validation.reference_labels = reference_labels;
    }
    if let Some(min) = min_accuracy {
        config.validation.min_accuracy = min;
    }
    if let Some(out) = out {
        config.backtest.output_dir = out;
    }
}

/// Day forms name the cutoff directly; a month means its last day.
fn parse_cutoff(raw: &str) -> Result<Cutoff, PipelineError> {
    if let Some(date) = parse_cli_date(raw) {
        return Ok(Cutoff::new(date));
    }
    raw.parse::<YearMonth>()
        .map(|m| Cutoff::new(m.last_day()))
        .map_err(|_| {
            PipelineError::Config(format!(
                "cutoff must be YYYY-MM-DD, YYYYMMDD or YYYY-MM, got '{}'",
                raw
            ))
        })
}

// =============================================================================
// COMMANDS
// =============================================================================

fn cmd_label(
    config: PipelineConfig,
    expiry_month: YearMonth,
    cutoff: Option<Cutoff>,
) -> Result<()> {
    let ctx = PipelineContext::new(config)?;
    let config = ctx.config();
    let cutoff_month = cutoff.map_or(expiry_month.prev(), |c| YearMonth::of(c.date()));
    let store = ctx.store_for(&config.sources.resolve_for(cutoff_month, expiry_month))?;

    let mut target = LabelTarget::month(expiry_month);
    if let Some(cutoff) = cutoff {
        target = target.before(cutoff.date());
    }
    let labels = config.labeler().label_window(&store, &target);

    if let Some(reference) = ctx.reference_labels() {
        let audit = ctx.layout().mismatches();
        let report = config
            .validation_harness()
            .certify(labels.iter().map(|d| &d.label), reference, Some(audit.as_path()))
            .with_context(|| format!("label gate for expiry month {}", expiry_month))?;
        println!(
            "label accuracy {:.4} over {} comparable entities ({} mismatches, audit {})",
            report.accuracy,
            report.comparable,
            report.mismatches.len(),
            audit.display()
        );
    }

    let path = ctx.layout().labels_for_month(expiry_month);
    write_label_table(&path, &labels)?;
    println!(
        "labelled {} entities for {} ({} churned) -> {}",
        labels.len(),
        expiry_month,
        labels.churn_count(),
        path.display()
    );
    Ok(())
}

fn cmd_build_features(config: PipelineConfig, cutoff: Cutoff) -> Result<()> {
    let ctx = PipelineContext::new(config)?;
    let config = ctx.config();
    let month = YearMonth::of(cutoff.date());
    let store = ctx.store_for(&config.sources.resolve_for(month, month.next()))?;

    let tag = cutoff.date().format("%Y-%m-%d").to_string();
    let table = config
        .feature_builder()
        .build(&store, &store.population(), cutoff, &tag)
        .with_context(|| format!("feature build for cutoff {}", cutoff))?;

    let path = ctx.layout().features_for_cutoff(cutoff);
    write_feature_table(&path, &table)?;
    println!(
        "built {} feature rows x {} columns for cutoff {} -> {}",
        table.len(),
        table.schema.len(),
        cutoff,
        path.display()
    );
    Ok(())
}

fn cmd_backtest(config: PipelineConfig) -> Result<()> {
    let windows = config.backtest.windows.clone();
    let ctx = PipelineContext::new(config)?;
    let summary = BacktestOrchestrator::new(&ctx).run(&windows)?;

    for outcome in &summary.outcomes {
        match outcome {
            WindowOutcome::Completed(report) => {
                for row in &report.evaluations {
                    println!(
                        "{}  {:<16} n={:<7} logloss={:.4} auc={} brier={:.4} ece={:.4}",
                        row.window,
                        row.model,
                        row.n,
                        row.logloss,
                        row.auc.map_or_else(|| "n/a".to_string(), |a| format!("{:.4}", a)),
                        row.brier,
                        row.ece
                    );
                }
            }
            WindowOutcome::Skipped { window, reason } => {
                println!("{}  skipped: {}", window.tag(), reason);
            }
        }
    }
    println!(
        "run {}: {} completed, {} skipped -> {}",
        summary.run_id,
        summary.completed().count(),
        summary.skipped().count(),
        ctx.layout().backtests().display()
    );
    Ok(())
}

fn cmd_psi(config: PipelineConfig, reference: Option<&str>) -> Result<()> {
    let monitor = config.drift_monitor();
    let layout = ArtifactLayout::new(&config.backtest.output_dir);
    let report = monitor.run(&layout, reference)?;

    for row in report.high_drift() {
        println!(
            "HIGH DRIFT  {} vs {}  {:?}:{}  psi={:.4}",
            row.window, row.reference, row.kind, row.dimension, row.psi
        );
    }
    println!(
        "reference {}: {} rows, {} high drift -> {}",
        report.reference,
        report.rows.len(),
        report.high_drift().count(),
        layout.psi().display()
    );
    Ok(())
}

fn cmd_validate(
    config: PipelineConfig,
    generated: Option<PathBuf>,
    expiry_month: Option<YearMonth>,
) -> Result<()> {
    if config.validation.reference_labels.is_none() {
        return Err(PipelineError::Config(
            "validate needs --reference-labels or [validation].reference_labels".to_string(),
        )
        .into());
    }
    let ctx = PipelineContext::new(config)?;
    let config = ctx.config();
    let reference = ctx
        .reference_labels()
        .context("reference labels not loaded")?;

    let labels: Vec<ChurnLabel> = match (generated, expiry_month) {
        (Some(path), _) => {
            let (labels, ingest) = load_generated_labels(&path)?;
            info!(
                path = %path.display(),
                rows = labels.len(),
                dropped = ingest.rows_dropped(),
                "loaded generated labels"
            );
            labels
        }
        (None, Some(month)) => {
            let store = ctx.store_for(&config.sources.resolve_for(month.prev(), month))?;
            config
                .labeler()
                .label_window(&store, &LabelTarget::month(month))
                .iter()
                .map(|d| d.label.clone())
                .collect()
        }
        (None, None) => {
            return Err(PipelineError::Config(
                "validate needs --generated or --expiry-month".to_string(),
            )
            .into())
        }
    };

    let audit = ctx.layout().mismatches();
    let report = config
        .validation_harness()
        .certify(&labels, reference, Some(audit.as_path()))?;
    println!(
        "label accuracy {:.4} over {} comparable entities ({} mismatches, audit {})",
        report.accuracy,
        report.comparable,
        report.mismatches.len(),
        audit.display()
    );
    Ok(())
}
