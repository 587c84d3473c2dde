//! Command-line interface for ritual.
//!
//! One-shot commands restore the latest snapshot, apply their change, run
//! queued work until idle and write a new snapshot. `serve` keeps running.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::config::{self, ProviderConfig};
use crate::core::adapter::EventSubmission;
use crate::core::orchestrator::TaskSummary;
use crate::core::runtime::Runtime;
use crate::domain::{RitualKind, SignatureSubmission};
use crate::ingest::trigger_ritual;

/// ritual - Event-driven task orchestrator
#[derive(Parser, Debug)]
#[command(name = "ritual")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit an event and run the resulting tasks
    SubmitEvent {
        /// JSON submission file (reads stdin if piped and no --type is given)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Event type (e.g. artifact_created)
        #[arg(short = 't', long = "type")]
        event_type: Option<String>,

        /// Human-readable details
        #[arg(short, long, default_value = "")]
        details: String,

        /// Metadata entries as key=value (value parsed as JSON when possible)
        #[arg(short, long = "meta")]
        meta: Vec<String>,

        /// Only queue the tasks, do not run them
        #[arg(long)]
        no_run: bool,
    },

    /// Show queued, in-flight and failed tasks
    QueueStatus {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Cancel a queued task
    Cancel {
        /// Task ID (UUID)
        task_id: String,
    },

    /// List signature requests awaiting a signature
    PendingSignatures {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Trigger a maintenance ritual now
    TriggerRitual {
        #[arg(value_enum)]
        ritual: RitualArg,
    },

    /// Submit a signature for a pending request
    SubmitSignature {
        /// Request ID (sig-...)
        #[arg(short, long)]
        request: String,

        /// Signer address (0x...)
        #[arg(short, long)]
        signer: String,

        /// Signature (0x...)
        #[arg(long)]
        signature: String,
    },

    /// Archive old events, drop old tasks and expire stale signatures
    Sweep,

    /// Run as a service (watcher, scheduler and dispatch loop)
    Serve,

    /// Show resolved configuration (debug)
    Config,
}

/// Ritual names for the CLI (maps to RitualKind)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RitualArg {
    /// Re-check unverified uploads
    Reconcile,

    /// Pin verified uploads
    Pin,

    /// Expire stale signature requests
    ExpireSignatures,

    /// Archive old events
    ArchiveEvents,
}

impl From<RitualArg> for RitualKind {
    fn from(r: RitualArg) -> Self {
        match r {
            RitualArg::Reconcile => RitualKind::Reconcile,
            RitualArg::Pin => RitualKind::Pin,
            RitualArg::ExpireSignatures => RitualKind::ExpireSignatures,
            RitualArg::ArchiveEvents => RitualKind::ArchiveEvents,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::SubmitEvent {
                input,
                event_type,
                details,
                meta,
                no_run,
            } => submit_event(input, event_type, details, meta, no_run).await,
            Commands::QueueStatus { json } => queue_status(json).await,
            Commands::Cancel { task_id } => cancel_task(&task_id).await,
            Commands::PendingSignatures { json } => pending_signatures(json).await,
            Commands::TriggerRitual { ritual } => run_ritual(ritual.into()).await,
            Commands::SubmitSignature {
                request,
                signer,
                signature,
            } => submit_signature(request, signer, signature).await,
            Commands::Sweep => sweep().await,
            Commands::Serve => serve().await,
            Commands::Config => show_config().await,
        }
    }
}

/// Build a runtime from config and restore the latest snapshot
async fn open_runtime() -> Result<Runtime> {
    let cfg = config::config()?.clone();
    let mut runtime = Runtime::from_config(cfg)?;
    let requeued = runtime.restore().await?;
    if requeued > 0 {
        eprintln!("[{} interrupted tasks re-queued]", requeued);
    }
    Ok(runtime)
}

/// Parse `key=value`; the value is JSON when it parses, a string otherwise
fn parse_meta(entry: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = entry
        .split_once('=')
        .with_context(|| format!("Invalid metadata entry (expected key=value): {}", entry))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

fn read_submission(input: Option<PathBuf>, event_type: Option<String>, details: String, meta: Vec<String>) -> Result<EventSubmission> {
    if let Some(event_type) = event_type {
        let mut submission = EventSubmission {
            event_type: Some(event_type),
            details,
            ..Default::default()
        };
        for entry in &meta {
            let (key, value) = parse_meta(entry)?;
            submission = submission.with_metadata(key, value);
        }
        return Ok(submission);
    }

    let body = if let Some(path) = input {
        std::fs::read_to_string(&path).with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No event provided. Use --type, --input <file> or pipe JSON to stdin");
    };

    Ok(EventSubmission::from_json(&body)?)
}

async fn submit_event(
    input: Option<PathBuf>,
    event_type: Option<String>,
    details: String,
    meta: Vec<String>,
    no_run: bool,
) -> Result<()> {
    let submission = read_submission(input, event_type, details, meta)?;
    let mut runtime = open_runtime().await?;

    let accepted = runtime.submit(submission).await?;
    println!("Accepted event {} ({})", accepted.event.id, accepted.event.event_type);
    if !accepted.logged {
        eprintln!("[warning: event log unavailable, event was not logged]");
    }

    if no_run {
        runtime.snapshot().await?;
        println!("Queued {} tasks", runtime.status().queued.len());
        return Ok(());
    }

    let report = runtime.run_until_idle().await?;
    println!(
        "Dispatched {}, completed {}, failed {}",
        report.dispatched, report.completed, report.failed
    );
    Ok(())
}

fn print_tasks(title: &str, tasks: &[TaskSummary]) {
    println!("{} ({})", title, tasks.len());
    if tasks.is_empty() {
        return;
    }
    println!("  {:<38} {:<18} {:>4} {:>4}  {}", "TASK ID", "TYPE", "PRI", "ATT", "EVENT");
    for t in tasks {
        println!(
            "  {:<38} {:<18} {:>4} {:>4}  {}",
            t.id,
            t.task_type.as_str(),
            t.priority,
            t.attempts,
            t.event_ref
        );
        if let Some(ref error) = t.error {
            println!("  {:<38} error: {}", "", error);
        }
    }
}

async fn queue_status(json: bool) -> Result<()> {
    let runtime = open_runtime().await?;
    let status = runtime.status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_tasks("Queued", &status.queued);
    print_tasks("In flight", &status.in_flight);
    println!("Completed: {}", status.completed);
    print_tasks("Failed", &status.failures);
    Ok(())
}

async fn cancel_task(task_id: &str) -> Result<()> {
    let id = Uuid::parse_str(task_id).with_context(|| format!("Invalid task ID: {}", task_id))?;
    let mut runtime = open_runtime().await?;
    let task = runtime.cancel(id).await?;
    println!("Cancelled {} task {}", task.task_type, task.id);
    Ok(())
}

async fn pending_signatures(json: bool) -> Result<()> {
    let runtime = open_runtime().await?;
    let pending = runtime.pending_signatures().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if pending.is_empty() {
        println!("No pending signature requests");
        return Ok(());
    }

    println!("{:<42} {:<44} {:<25}", "REQUEST ID", "SIGNER", "EXPIRES");
    println!("{}", "-".repeat(111));
    for request in pending {
        println!(
            "{:<42} {:<44} {:<25}",
            request.id,
            request.required_signer.as_deref().unwrap_or("(any)"),
            request.expires_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn run_ritual(kind: RitualKind) -> Result<()> {
    let mut runtime = open_runtime().await?;
    let accepted = trigger_ritual(&runtime.adapter(), kind).await?;
    let report = runtime.run_until_idle().await?;
    println!(
        "Ritual {} ({}): dispatched {}, completed {}, failed {}",
        kind, accepted.event.id, report.dispatched, report.completed, report.failed
    );
    Ok(())
}

async fn submit_signature(request_id: String, signer: String, signature: String) -> Result<()> {
    let runtime = open_runtime().await?;
    let receipt = runtime
        .submit_signature(&SignatureSubmission {
            signature_request_id: request_id,
            signature,
            signer_address: signer,
        })
        .await?;
    println!("Request {}: {}", receipt.request.id, receipt.status.as_str());
    Ok(())
}

async fn sweep() -> Result<()> {
    let mut runtime = open_runtime().await?;
    let summary = runtime.sweep().await?;
    println!(
        "Archived {} events ({} retained), removed {} tasks, expired {} signature requests",
        summary.archive.archived,
        summary.archive.retained,
        summary.removed_tasks,
        summary.signatures.total()
    );
    Ok(())
}

async fn serve() -> Result<()> {
    let runtime = open_runtime().await?;
    eprintln!("[serving from {}, ctrl-c to stop]", runtime.config().home.display());
    runtime.serve().await
}

fn describe_provider(provider: &ProviderConfig) -> String {
    match provider {
        ProviderConfig::Http { name, upload_url, token, .. } => format!(
            "{} (http {}{})",
            name,
            upload_url,
            if token.is_some() { ", token set" } else { "" }
        ),
        ProviderConfig::Local { name, root } => format!("{} (local {})", name, root),
    }
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Artifacts:           {}", cfg.artifacts_dir.display());
    println!("  Events:              {}", cfg.events_dir().display());
    println!("  State ({:?}):     {}", cfg.state_store, cfg.state_path().display());
    println!();
    println!("Orchestrator:");
    println!("  Max in flight:  {}", cfg.orchestrator.max_in_flight);
    println!("  Task attempts:  {}", cfg.orchestrator.retry.max_attempts);
    println!("  Priority decay: {}", cfg.orchestrator.priority_decay);
    println!("  Retention:      {}h", cfg.orchestrator.retention_hours);
    println!();
    println!("Storage:");
    println!("  Primary:   {}", describe_provider(&cfg.storage.primary));
    println!("  Secondary: {}", cfg.storage.secondary.as_ref().map(describe_provider).unwrap_or_else(|| "(none)".to_string()));
    println!("  Attempts:  {} (backoff {}ms..{}ms)", cfg.storage.retry.max_attempts, cfg.storage.retry.initial_delay_ms, cfg.storage.retry.max_delay_ms);
    println!();
    println!("Signatures:");
    println!("  Single expiry: {}h", cfg.signatures.single_expiry_hours);
    println!("  Multi expiry:  {}h", cfg.signatures.multi_expiry_hours);
    println!();
    println!("Registry: {}", cfg.registry.endpoint.clone().unwrap_or_else(|| format!("{} (local)", cfg.completions_path().display())));
    println!("Watcher:  {}", if cfg.watcher.enabled { cfg.watcher.patterns.join(", ") } else { "disabled".to_string() });
    println!("Rituals:");
    for schedule in &cfg.rituals {
        println!("  {:<18} every {}s", schedule.ritual.as_str(), schedule.every_secs);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta() {
        assert_eq!(parse_meta("artifact=build.tar").unwrap(), ("artifact".into(), serde_json::json!("build.tar")));
        assert_eq!(parse_meta("priority=9").unwrap(), ("priority".into(), serde_json::json!(9)));
        assert_eq!(
            parse_meta(r#"signers=["0xab"]"#).unwrap().1,
            serde_json::json!(["0xab"])
        );
        assert!(parse_meta("novalue").is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from(["ritual", "trigger-ritual", "expire-signatures"]).unwrap();
        assert!(matches!(cli.command, Commands::TriggerRitual { ritual: RitualArg::ExpireSignatures }));

        let cli = Cli::try_parse_from([
            "ritual", "submit-event", "--type", "artifact_created", "--meta", "artifact=a.tar",
        ])
        .unwrap();
        match cli.command {
            Commands::SubmitEvent { event_type, meta, .. } => {
                assert_eq!(event_type.as_deref(), Some("artifact_created"));
                assert_eq!(meta, vec!["artifact=a.tar"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_submission_from_flags() {
        let submission = read_submission(
            None,
            Some("notice".into()),
            "hello".into(),
            vec!["source=cli".into()],
        )
        .unwrap();
        assert_eq!(submission.event_type.as_deref(), Some("notice"));
        assert_eq!(submission.metadata.unwrap()["source"], "cli");
    }
}
