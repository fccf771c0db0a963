//! Administrative command surface of the ingestion core.
//!
//! Per-gene failures never fail the process; only fatal orchestration
//! errors (bad config, unknown source, store unavailable) exit non-zero.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::cache::CacheService;
use crate::config::Config;
use crate::entities::{SourceName, StagingStatus};
use crate::error::IngestError;
use crate::pipeline::{GeneSelection, Orchestrator};
use crate::sources::uploads::{UploadKind, UploadMode, UploadSource};
use crate::store::{MemoryStore, ProgressStore, StagingStore, Store};

#[derive(Debug, Parser)]
#[command(
    name = "nephro-ingest",
    about = "Kidney genetics evidence ingestion and annotation core",
    version
)]
pub struct Cli {
    /// Optional JSON config overriding per-source defaults.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline for all scheduled sources or a selection.
    /// Ctrl-C pauses cooperatively and writes checkpoints.
    Run {
        /// Source names to run (repeatable); defaults to the full schedule.
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Resume paused sources from their checkpoints.
    Resume {
        #[arg(long = "source")]
        sources: Vec<String>,
    },
    /// Show per-source run state.
    Status,
    /// Re-annotate genes whose annotation is missing or expired.
    RetryFailed {
        #[arg(long)]
        source: String,
    },
    /// Annotate only genes with no annotation for the source.
    FillMissing {
        #[arg(long)]
        source: String,
    },
    /// Rebuild the materialized per-gene summary projection.
    RefreshSummary,
    /// Ingest an uploaded tabular artifact (CSV/TSV/XLSX).
    Upload {
        /// "diagnostic-panels" or "literature".
        #[arg(long)]
        kind: String,
        #[arg(long)]
        file: PathBuf,
        /// "merge" or "replace".
        #[arg(long, default_value = "merge")]
        mode: String,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Review the staging queue.
    #[command(subcommand)]
    Stage(StageCommands),
    /// Per-namespace statistics for the annotation cache.
    CacheStats,
    /// Show the effective configuration.
    ConfigShow,
}

#[derive(Debug, Subcommand)]
pub enum StageCommands {
    /// List pending staging records.
    List,
    /// Approve a record: creates or links the canonical gene.
    Approve {
        id: u64,
        #[arg(long)]
        reviewer: String,
    },
    /// Reject a record with a reason.
    Reject {
        id: u64,
        #[arg(long)]
        reason: String,
    },
}

fn parse_sources(raw: &[String]) -> Result<Option<Vec<SourceName>>, IngestError> {
    if raw.is_empty() {
        return Ok(None);
    }
    raw.iter()
        .map(|name| SourceName::from_str(name))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

fn build_orchestrator(config_path: Option<&PathBuf>) -> Result<Orchestrator, IngestError> {
    let config = Config::load(config_path.map(PathBuf::as_path))?;
    let cache = CacheService::open_default()?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Orchestrator::new(store, cache, config)
}

/// Wires Ctrl-C to the cooperative pause flag: the current gene or chunk
/// completes, a checkpoint is written, and the process exits cleanly.
fn spawn_pause_on_ctrl_c(orchestrator: &Orchestrator) {
    let pause = orchestrator.pause_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; pausing at the next checkpoint boundary");
            pause.cancel();
        }
    });
}

pub async fn run(cli: Cli) -> anyhow::Result<String> {
    match cli.command {
        Commands::Run { sources } | Commands::Resume { sources } => {
            let selected = parse_sources(&sources)?;
            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            orchestrator.set_progress_callback(Box::new(|record| {
                tracing::info!(
                    source = record.source.as_str(),
                    status = ?record.status,
                    processed = record.items_processed,
                    total = record.items_total,
                    "progress"
                );
            }));
            spawn_pause_on_ctrl_c(&orchestrator);

            let outcome = orchestrator.run(selected).await?;
            let mut out = serde_json::json!({
                "paused": outcome.paused,
                "summaries": outcome.summaries,
            });
            if outcome.paused {
                out["note"] = serde_json::json!(
                    "run paused; `nephro-ingest resume` continues from the checkpoints"
                );
            }
            Ok(serde_json::to_string_pretty(&out)?)
        }
        Commands::Status => {
            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            let progress = orchestrator.store().all_progress().await?;
            Ok(serde_json::to_string_pretty(&progress)?)
        }
        Commands::RetryFailed { source } => {
            let source = SourceName::from_str(&source)?;
            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            spawn_pause_on_ctrl_c(&orchestrator);
            let summary = orchestrator
                .run_annotation(source, GeneSelection::MissingOrExpired)
                .await;
            Ok(serde_json::to_string_pretty(&summary)?)
        }
        Commands::FillMissing { source } => {
            let source = SourceName::from_str(&source)?;
            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            spawn_pause_on_ctrl_c(&orchestrator);
            let summary = orchestrator
                .run_annotation(source, GeneSelection::MissingOnly)
                .await;
            Ok(serde_json::to_string_pretty(&summary)?)
        }
        Commands::RefreshSummary => {
            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            let count = orchestrator.refresh_summary().await?;
            Ok(format!("Summary refreshed for {count} genes"))
        }
        Commands::Upload {
            kind,
            file,
            mode,
            provider,
        } => {
            let kind = match kind.trim().to_ascii_lowercase().replace('_', "-").as_str() {
                "diagnostic-panels" => UploadKind::DiagnosticPanels,
                "literature" => UploadKind::Literature,
                other => {
                    return Err(IngestError::InvalidArgument(format!(
                        "upload kind must be 'diagnostic-panels' or 'literature', got '{other}'"
                    ))
                    .into());
                }
            };
            let mode = UploadMode::from_str(&mode)?;
            let bytes = tokio::fs::read(&file).await?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "upload".to_string());
            let upload_id = format!(
                "upload-{}",
                time::OffsetDateTime::now_utc().unix_timestamp()
            );

            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            let upload = UploadSource::new(kind, file_name, bytes, mode, provider, upload_id);
            let summary = orchestrator.run_upload(upload).await;
            Ok(serde_json::to_string_pretty(&summary)?)
        }
        Commands::Stage(stage) => {
            let orchestrator = build_orchestrator(cli.config.as_ref())?;
            match stage {
                StageCommands::List => {
                    let pending = orchestrator.store().pending_staging().await?;
                    Ok(serde_json::to_string_pretty(&pending)?)
                }
                StageCommands::Approve { id, reviewer } => {
                    let gene = orchestrator
                        .normalizer()
                        .approve_staging(orchestrator.store().as_ref(), id, &reviewer)
                        .await?;
                    Ok(format!(
                        "Approved staging record {id}: linked to {} ({})",
                        gene.approved_symbol, gene.hgnc_id
                    ))
                }
                StageCommands::Reject { id, reason } => {
                    orchestrator
                        .store()
                        .resolve_staging(id, StagingStatus::Rejected, None, Some(reason))
                        .await?;
                    Ok(format!("Rejected staging record {id}"))
                }
            }
        }
        Commands::CacheStats => {
            let cache = CacheService::open_default()?;
            let mut stats = Vec::new();
            for namespace in cache.namespaces().await? {
                stats.push(cache.stats(&namespace).await?);
            }
            Ok(serde_json::to_string_pretty(&stats)?)
        }
        Commands::ConfigShow => {
            let config = Config::load(cli.config.as_deref())?;
            let mut lines = vec![format!(
                "annotation_parallelism = {}\npause_check_interval = {}",
                config.annotation_parallelism, config.pause_check_interval
            )];
            for source in SourceName::ALL {
                let entry = config.source(source);
                lines.push(format!(
                    "[{source}] {}: rps={} retries={} ttl_days={} threshold={} (enabled={}) breaker={}x/{}s",
                    source.display_name(),
                    entry.requests_per_second,
                    entry.max_retries,
                    entry.cache_ttl_days,
                    entry.min_threshold,
                    entry.min_threshold_enabled,
                    entry.circuit_breaker_threshold,
                    entry.circuit_recovery_secs,
                ));
            }
            Ok(lines.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_run_with_sources() {
        let cli = Cli::try_parse_from([
            "nephro-ingest",
            "run",
            "--source",
            "pubtator",
            "--source",
            "gencc",
        ])
        .expect("parse");
        let Commands::Run { sources } = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(sources, vec!["pubtator".to_string(), "gencc".to_string()]);
    }

    #[test]
    fn cli_parses_upload_with_mode() {
        let cli = Cli::try_parse_from([
            "nephro-ingest",
            "upload",
            "--kind",
            "literature",
            "--file",
            "/tmp/lit.csv",
            "--mode",
            "replace",
            "--provider",
            "lab-x",
        ])
        .expect("parse");
        let Commands::Upload { kind, mode, .. } = cli.command else {
            panic!("expected upload command");
        };
        assert_eq!(kind, "literature");
        assert_eq!(mode, "replace");
    }

    #[test]
    fn cli_parses_stage_subcommands() {
        let cli = Cli::try_parse_from([
            "nephro-ingest",
            "stage",
            "approve",
            "12",
            "--reviewer",
            "curator@nephro",
        ])
        .expect("parse");
        let Commands::Stage(StageCommands::Approve { id, reviewer }) = cli.command else {
            panic!("expected stage approve");
        };
        assert_eq!(id, 12);
        assert_eq!(reviewer, "curator@nephro");
    }

    #[test]
    fn parse_sources_rejects_unknown_names() {
        let err = parse_sources(&["omim".to_string()]).expect_err("unknown source");
        assert!(err.to_string().contains("Unknown source name"));
        assert!(parse_sources(&[]).expect("empty").is_none());
    }
}
