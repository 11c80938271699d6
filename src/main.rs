use std::path::PathBuf;

use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

mod admission;
mod config;
mod models;
mod report;
mod stats;
mod store;

use crate::admission::ResetMarker;
use crate::config::EvalConfig;
use crate::models::Submission;
use crate::store::{LocalStore, PgStore, RecordStore};

#[derive(Parser)]
#[command(name = "eval360")]
#[command(about = "KSI 360-degree peer evaluation pipeline", long_about = None)]
struct Cli {
    /// JSON file overriding the built-in roster, metrics and accounts
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use a local JSON-file store at this path instead of DATABASE_URL
    #[arg(long, global = true)]
    local: Option<PathBuf>,

    /// Directory for client-local state (the reset marker)
    #[arg(long, global = true, default_value = ".eval360")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store schema (or the local store's directory)
    InitDb,
    /// Load sample evaluations for demos and manual testing
    Seed,
    /// Submit one evaluation read from a JSON file (upserts per pair)
    Submit {
        #[arg(long)]
        json: PathBuf,
    },
    /// Check an evaluator's credentials and admission status
    Login {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Show the aggregated results for one roster member
    Stats {
        #[arg(long)]
        target: String,
        #[arg(long)]
        admin_password: String,
    },
    /// List stored evaluations in store order
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        admin_password: String,
    },
    /// Export every record as CSV
    ExportCsv {
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        admin_password: String,
    },
    /// Export one PDF page per roster member with data
    ExportPdf {
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        admin_password: String,
    },
    /// Delete every record and stamp the reset marker
    Clear {
        /// Confirm the wipe; refused without it
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        admin_password: String,
    },
}

async fn open_store(cli: &Cli) -> anyhow::Result<Box<dyn RecordStore>> {
    if let Some(path) = &cli.local {
        return Ok(Box::new(LocalStore::new(path.clone())));
    }

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set, or pass --local <path> for the file store")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(Box::new(PgStore::new(pool)))
}

fn check_admin(config: &EvalConfig, password: &str) -> anyhow::Result<()> {
    if password != config.admin_password {
        bail!("wrong admin password");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EvalConfig::from_file(path)?,
        None => config::builtin(),
    };
    let store = open_store(&cli).await?;
    let marker = ResetMarker::new(&cli.state_dir);

    match cli.command {
        Commands::InitDb => {
            store.init().await?;
            println!("Store ready.");
        }
        Commands::Seed => {
            let inserted = store::seed(store.as_ref(), &config).await?;
            println!("Seeded {inserted} evaluations.");
        }
        Commands::Submit { json } => {
            let raw = std::fs::read_to_string(&json)
                .with_context(|| format!("failed to read {}", json.display()))?;
            let submission: Submission = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", json.display()))?;
            let record = store::save_evaluation(store.as_ref(), &config, submission).await?;
            println!(
                "Saved evaluation of {} by {} ({}).",
                record.target, record.evaluator, record.id
            );
        }
        Commands::Login { username, password } => {
            let Some(account) = config.find_account(&username, &password) else {
                bail!("unknown username or wrong password");
            };
            let records = store.list_ordered().await?;
            let last_reset = marker.read()?;
            if admission::is_admitted(&config, &account.name, &records, last_reset) {
                let done = records
                    .iter()
                    .filter(|r| r.evaluator == account.name)
                    .count();
                let total = config.targets_for(&account.name).len();
                println!("{} admitted ({done}/{total} evaluations submitted).", account.name);
            } else {
                println!(
                    "{} has already evaluated every other roster member; \
                     blocked until the next admin reset.",
                    account.name
                );
            }
        }
        Commands::Stats {
            target,
            admin_password,
        } => {
            check_admin(&config, &admin_password)?;
            if !config.is_member(&target) {
                bail!("{target:?} is not on the roster");
            }
            let records = store.query_by_target(&target).await?;
            match stats::aggregate(&config, &target, &records) {
                None => println!("No evaluations for {target} yet."),
                Some(aggregate) => print_stats(&config, &aggregate),
            }
        }
        Commands::List {
            limit,
            admin_password,
        } => {
            check_admin(&config, &admin_password)?;
            let records = store.list_ordered().await?;
            println!("{} evaluations stored.", records.len());
            for record in records.iter().take(limit) {
                println!(
                    "- {}  {} -> {}  ({})",
                    record.timestamp.to_rfc3339(),
                    record.evaluator,
                    record.target,
                    record.id
                );
            }
        }
        Commands::ExportCsv {
            out,
            admin_password,
        } => {
            check_admin(&config, &admin_password)?;
            let out =
                out.unwrap_or_else(|| PathBuf::from(report::csv_filename(Utc::now().date_naive())));
            let records = store.list_ordered().await?;
            match report::csv_bytes(&config, &records)? {
                None => println!("No evaluations to export."),
                Some(bytes) => {
                    std::fs::write(&out, bytes)
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    println!("CSV with {} rows written to {}.", records.len(), out.display());
                }
            }
        }
        Commands::ExportPdf {
            out,
            admin_password,
        } => {
            check_admin(&config, &admin_password)?;
            let Some(_guard) = report::ExportGuard::try_acquire() else {
                println!("An export is already running; ignoring this request.");
                return Ok(());
            };
            let out =
                out.unwrap_or_else(|| PathBuf::from(report::pdf_filename(Utc::now().date_naive())));
            let pages = report::export_pdf(store.as_ref(), &config, &out).await?;
            println!("PDF with {pages} pages written to {}.", out.display());
        }
        Commands::Clear {
            yes,
            admin_password,
        } => {
            check_admin(&config, &admin_password)?;
            if !yes {
                bail!("this wipes every evaluation; pass --yes to confirm");
            }
            let removed = store::clear_all(store.as_ref()).await?;
            println!("Removed {removed} evaluations.");
            // Second, explicit step: the marker re-admits evaluators who had
            // already finished. Best-effort convenience next to the wipe.
            marker.stamp(Utc::now())?;
            println!("Reset marker stamped; completed evaluators are re-admitted.");
        }
    }

    Ok(())
}

fn print_stats(config: &EvalConfig, aggregate: &crate::models::AggregatedData) {
    println!("{}: {} evaluations", aggregate.target, aggregate.count);

    println!("Positive metrics:");
    for metric in &config.positive_metrics {
        let avg = aggregate.avg_pos.get(&metric.title).copied().unwrap_or(0.0);
        println!("  {}  {avg}", metric.title);
    }
    println!("Negative metrics:");
    for metric in &config.negative_metrics {
        let avg = aggregate.avg_neg.get(&metric.title).copied().unwrap_or(0.0);
        match &metric.score_label {
            Some(label) => println!("  {} {label}  {avg}", metric.title),
            None => println!("  {}  {avg}", metric.title),
        }
    }

    for (title, comments) in [
        ("Start", &aggregate.comments_start),
        ("Stop", &aggregate.comments_stop),
        ("Continue", &aggregate.comments_continue),
    ] {
        println!("{title}:");
        if comments.is_empty() {
            println!("  (no suggestions)");
        } else {
            for comment in comments {
                println!("  {}: {}", comment.evaluator, comment.text);
            }
        }
    }
}
