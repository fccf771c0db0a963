//! Pipeline orchestration: dependency-ordered source runs with bounded
//! parallelism, cooperative pause, checkpointed resume, and a single
//! summary refresh per run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::annotate::{AnnotationOutcome, AnnotationSource, update_gene};
use crate::cache::CacheService;
use crate::config::Config;
use crate::entities::{Gene, GeneId, RunStatus, RunSummary, SourceName};
use crate::error::IngestError;
use crate::normalize::GeneNormalizer;
use crate::sources::ingest::{DataSource, IngestContext, IngestRun};
use crate::store::{AnnotationStore, GeneStore, ProgressStore, Store};

pub(crate) mod checkpoint;
pub(crate) mod progress;
pub(crate) mod summary;

use checkpoint::AnnotationCheckpoint;
use progress::ProgressTracker;

const FAILED_RETRY_ROUNDS: u32 = 2;
const FAILED_RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const SAMPLE_FAILED_LIMIT: usize = 10;

#[derive(Debug)]
pub(crate) struct RunOutcome {
    pub summaries: Vec<RunSummary>,
    pub paused: bool,
}

/// Gene selection for an annotation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GeneSelection {
    /// Every active gene; unexpired annotations are skipped (idempotent
    /// re-runs write nothing).
    All,
    /// Only genes with no annotation for the source.
    MissingOnly,
    /// Genes with a missing or expired annotation.
    MissingOrExpired,
}

pub(crate) struct Orchestrator {
    store: Arc<dyn Store>,
    cache: CacheService,
    config: Config,
    normalizer: GeneNormalizer,
    tracker: ProgressTracker,
    pause: CancellationToken,
}

impl Orchestrator {
    pub(crate) fn new(
        store: Arc<dyn Store>,
        cache: CacheService,
        config: Config,
    ) -> Result<Self, IngestError> {
        let normalizer = GeneNormalizer::new(&config)?;
        let tracker = ProgressTracker::new(store.clone());
        Ok(Self {
            store,
            cache,
            config,
            normalizer,
            tracker,
            pause: CancellationToken::new(),
        })
    }

    /// Cancelling this token pauses every running source at its next
    /// checkpoint boundary.
    pub(crate) fn pause_token(&self) -> CancellationToken {
        self.pause.clone()
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub(crate) fn normalizer(&self) -> &GeneNormalizer {
        &self.normalizer
    }

    pub(crate) fn set_progress_callback(&self, callback: progress::ProgressCallback) {
        self.tracker.set_callback(callback);
    }

    /// Runs the selected sources (or the full schedule), honoring the
    /// HGNC-before-Ensembl-consumers dependency, then refreshes the
    /// summary projection exactly once.
    pub(crate) async fn run(
        &self,
        selected: Option<Vec<SourceName>>,
    ) -> Result<RunOutcome, IngestError> {
        let sources = match selected {
            Some(list) => list,
            None => SourceName::ALL
                .iter()
                .copied()
                .filter(|s| !matches!(s, SourceName::DiagnosticPanels | SourceName::Literature))
                .collect(),
        };

        let ingestion: Vec<SourceName> =
            sources.iter().copied().filter(|s| s.is_ingestion()).collect();
        let annotation: Vec<SourceName> =
            sources.iter().copied().filter(|s| s.is_annotation()).collect();

        let mut summaries = Vec::new();
        let semaphore = Arc::new(Semaphore::new(self.config.annotation_parallelism));

        // Phase 1: evidence ingestion.
        let ingest_futures = ingestion.iter().map(|source| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                self.run_ingestion(*source).await
            }
        });
        summaries.extend(futures::future::join_all(ingest_futures).await);

        // Phase 2: HGNC must complete before the Ensembl consumers start.
        let mut hgnc_failed = false;
        if annotation.contains(&SourceName::Hgnc) {
            let summary = self
                .run_annotation(SourceName::Hgnc, GeneSelection::All)
                .await;
            hgnc_failed = summary.error.is_some();
            summaries.push(summary);
        }

        // Phase 3: remaining annotation sources under the semaphore.
        let rest: Vec<SourceName> = annotation
            .iter()
            .copied()
            .filter(|s| *s != SourceName::Hgnc)
            .collect();
        let annotation_futures = rest.iter().map(|source| {
            let semaphore = semaphore.clone();
            let hgnc_failed = hgnc_failed;
            async move {
                if source.requires_hgnc_xrefs() && hgnc_failed {
                    warn!(
                        source = source.as_str(),
                        "Skipping: HGNC dependency did not complete"
                    );
                    return RunSummary {
                        skipped_reason: Some(format!(
                            "dependency unmet: {} did not complete",
                            SourceName::Hgnc
                        )),
                        ..RunSummary::empty(*source)
                    };
                }
                let _permit = semaphore.acquire().await;
                self.run_annotation(*source, GeneSelection::All).await
            }
        });
        summaries.extend(futures::future::join_all(annotation_futures).await);

        let paused = self.pause.is_cancelled();
        if paused {
            info!("Run paused; summary refresh deferred to the resuming run");
        } else {
            summary::refresh_summary(self.store.as_ref()).await?;
        }

        Ok(RunOutcome { summaries, paused })
    }

    pub(crate) async fn refresh_summary(&self) -> Result<usize, IngestError> {
        summary::refresh_summary(self.store.as_ref()).await
    }

    fn ingester_for(&self, source: SourceName) -> Result<Box<dyn DataSource>, IngestError> {
        use crate::sources::{gencc, panelapp, pubtator};
        let config = self.config.source(source);
        Ok(match source {
            SourceName::Pubtator => Box::new(pubtator::PubTatorSource::new(config)?),
            SourceName::Gencc => Box::new(gencc::GenccSource::new(config)?),
            SourceName::PanelappUk => Box::new(panelapp::PanelAppSource::new(
                panelapp::PanelAppRegion::Uk,
                config,
            )?),
            SourceName::PanelappAu => Box::new(panelapp::PanelAppSource::new(
                panelapp::PanelAppRegion::Australia,
                config,
            )?),
            SourceName::DiagnosticPanels | SourceName::Literature => {
                return Err(IngestError::InvalidArgument(format!(
                    "{source} is upload-backed; run it through the upload command"
                )));
            }
            other => {
                return Err(IngestError::InvalidArgument(format!(
                    "{other} is not an ingestion source"
                )));
            }
        })
    }

    fn annotator_for(&self, source: SourceName) -> Result<Box<dyn AnnotationSource>, IngestError> {
        use crate::annotate::{clinvar, descartes, gnomad, gtex, hgnc, hpo, mgi, string_db};
        let config = self.config.source(source);
        Ok(match source {
            SourceName::Hgnc => Box::new(hgnc::HgncAnnotator::new(config)?),
            SourceName::Gnomad => Box::new(gnomad::GnomadAnnotator::new(config)?),
            SourceName::Clinvar => Box::new(clinvar::ClinvarAnnotator::new(config)?),
            SourceName::Hpo => Box::new(hpo::HpoAnnotator::new(config, self.cache.clone())?),
            SourceName::Mgi => Box::new(mgi::MgiAnnotator::new(config)?),
            SourceName::StringDb => Box::new(string_db::StringDbAnnotator::new(config)?),
            SourceName::Gtex => Box::new(gtex::GtexAnnotator::new(config)?),
            SourceName::Descartes => Box::new(descartes::DescartesAnnotator::new(config)?),
            other => {
                return Err(IngestError::InvalidArgument(format!(
                    "{other} is not an annotation source"
                )));
            }
        })
    }

    async fn run_ingestion(&self, source: SourceName) -> RunSummary {
        let ingester = match self.ingester_for(source) {
            Ok(ingester) => ingester,
            Err(err) => {
                return RunSummary {
                    error: Some(err.to_string()),
                    ..RunSummary::empty(source)
                };
            }
        };
        self.drive_ingester(ingester.as_ref()).await
    }

    /// Upload-backed ingestion entry point (diagnostic panels, literature).
    pub(crate) async fn run_upload(
        &self,
        upload: crate::sources::uploads::UploadSource,
    ) -> RunSummary {
        self.drive_ingester(&upload).await
    }

    async fn drive_ingester(&self, ingester: &dyn DataSource) -> RunSummary {
        let source = ingester.source_name();
        let started = Instant::now();
        let mut summary = RunSummary::empty(source);

        if let Err(err) = self.store.begin_run(source).await {
            summary.error = Some(err.to_string());
            return summary;
        }

        let ctx = IngestContext {
            store: self.store.as_ref(),
            normalizer: &self.normalizer,
            config: self.config.source(source),
            pause: self.pause.clone(),
        };

        match ingester.ingest(&ctx).await {
            Ok(IngestRun::Completed(report)) => {
                summary.successful = report.evidence_written;
                summary.failed = report.genes_rejected;
                summary.skipped = report.genes_staged;
                summary.filtering = report.filtering;
                self.finish_progress(source, RunStatus::Succeeded, None).await;
            }
            Ok(IngestRun::Paused(report)) => {
                summary.successful = report.evidence_written;
                summary.failed = report.genes_rejected;
                summary.skipped = report.genes_staged;
                summary.filtering = report.filtering;
                // The ingester already wrote the paused progress record.
            }
            Err(err) => {
                warn!(source = source.as_str(), error = %err, "Source run failed");
                self.finish_progress(source, RunStatus::Failed, Some(err.to_string()))
                    .await;
                summary.error = Some(err.to_string());
            }
        }

        summary.duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        info!(
            source = source.as_str(),
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            success_rate = summary.success_rate(),
            "Ingestion finished"
        );
        summary
    }

    pub(crate) async fn run_annotation(
        &self,
        source: SourceName,
        selection: GeneSelection,
    ) -> RunSummary {
        let annotator = match self.annotator_for(source) {
            Ok(annotator) => annotator,
            Err(err) => {
                return RunSummary {
                    error: Some(err.to_string()),
                    ..RunSummary::empty(source)
                };
            }
        };
        self.annotate_with(annotator.as_ref(), selection).await
    }

    /// The per-gene annotation loop. Gene-level failures never abort the
    /// source; a circuit-open aborts the remaining batch; pause is checked
    /// every `pause_check_interval` genes and checkpoints.
    pub(crate) async fn annotate_with(
        &self,
        annotator: &dyn AnnotationSource,
        selection: GeneSelection,
    ) -> RunSummary {
        let source = annotator.source_name();
        let started = Instant::now();
        let mut summary = RunSummary::empty(source);

        let progress_record = match self.store.begin_run(source).await {
            Ok(record) => record,
            Err(err) => {
                summary.error = Some(err.to_string());
                return summary;
            }
        };

        let genes = match self.select_genes(source, selection).await {
            Ok(genes) => genes,
            Err(err) => {
                self.finish_progress(source, RunStatus::Failed, Some(err.to_string()))
                    .await;
                summary.error = Some(err.to_string());
                return summary;
            }
        };

        // Resume support: skip genes the paused run already processed.
        let mut processed: HashSet<GeneId> = HashSet::new();
        let mut batch_index = 0u64;
        if let Some(value) = progress_record.checkpoint.as_ref() {
            match AnnotationCheckpoint::parse(value) {
                Ok(checkpoint) if checkpoint.current_source == source.as_str() => {
                    processed.extend(checkpoint.processed_gene_ids.iter().copied());
                    batch_index = checkpoint.batch_index;
                    info!(
                        source = source.as_str(),
                        processed = processed.len(),
                        "Resuming annotation from checkpoint"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    self.finish_progress(source, RunStatus::Failed, Some(err.to_string()))
                        .await;
                    summary.error = Some(err.to_string());
                    return summary;
                }
            }
        }

        let pending: Vec<&Gene> = genes.iter().filter(|g| !processed.contains(&g.id)).collect();
        let total = genes.len() as u64;
        let mut failed: Vec<(Gene, String)> = Vec::new();
        let mut circuit_open = false;

        for (index, gene) in pending.iter().enumerate() {
            if index as u64 % self.config.pause_check_interval == 0
                && index > 0
                && self.pause.is_cancelled()
            {
                let checkpoint = AnnotationCheckpoint::new(
                    source.as_str(),
                    processed.iter().copied().collect(),
                    batch_index,
                );
                if let Err(err) = self.pause_progress(source, &checkpoint, total).await {
                    warn!(source = source.as_str(), error = %err, "Checkpoint write failed");
                }
                summary.duration_ms =
                    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
                info!(
                    source = source.as_str(),
                    processed = processed.len(),
                    "Annotation paused"
                );
                return summary;
            }

            match update_gene(annotator, &self.cache, self.store.as_ref(), gene).await {
                Ok(AnnotationOutcome::Fetched | AnnotationOutcome::FromCache) => {
                    summary.successful += 1;
                }
                Err(IngestError::CircuitOpen { .. }) => {
                    // Abort the batch: everything unprocessed is failed and
                    // will be retried on the next scheduled run.
                    warn!(
                        source = source.as_str(),
                        remaining = pending.len() - index,
                        "Circuit open; aborting batch"
                    );
                    for remaining in &pending[index..] {
                        failed.push(((**remaining).clone(), "circuit open".to_string()));
                    }
                    circuit_open = true;
                    break;
                }
                Err(err) => {
                    failed.push(((**gene).clone(), err.to_string()));
                }
            }

            processed.insert(gene.id);
            batch_index = processed.len() as u64 / self.config.pause_check_interval.max(1);

            if (index + 1) % 10 == 0 {
                let mut record = crate::entities::ProgressRecord::idle(source);
                record.status = RunStatus::Running;
                record.items_processed = processed.len() as u64;
                record.items_total = Some(total);
                if let Err(err) = self.tracker.update(record).await {
                    warn!(source = source.as_str(), error = %err, "Progress update failed");
                }
            }
        }

        // Second chance for transient failures, with backoff between
        // rounds. Circuit-open batches skip this; the next run retries.
        if !circuit_open && !failed.is_empty() {
            for round in 0..FAILED_RETRY_ROUNDS {
                if failed.is_empty() {
                    break;
                }
                let delay = FAILED_RETRY_BASE_DELAY * 2u32.saturating_pow(round);
                tokio::time::sleep(delay).await;

                let mut still_failed = Vec::new();
                for (gene, _last_error) in failed.drain(..) {
                    match update_gene(annotator, &self.cache, self.store.as_ref(), &gene).await {
                        Ok(_) => summary.successful += 1,
                        Err(IngestError::CircuitOpen { .. }) => {
                            still_failed.push((gene, "circuit open".to_string()));
                        }
                        Err(err) => {
                            still_failed.push((gene, err.to_string()));
                        }
                    }
                }
                failed = still_failed;
            }
        }

        summary.failed = failed.len() as u64;
        summary.sample_failed = failed
            .iter()
            .take(SAMPLE_FAILED_LIMIT)
            .map(|(gene, reason)| format!("{}: {reason}", gene.approved_symbol))
            .collect();
        summary.skipped = total.saturating_sub(pending.len() as u64);
        summary.duration_ms = started.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

        let terminal = if circuit_open {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        let error = circuit_open.then(|| "circuit open; batch aborted".to_string());
        summary.error = error.clone();
        self.finish_progress(source, terminal, error).await;

        info!(
            source = source.as_str(),
            successful = summary.successful,
            failed = summary.failed,
            skipped = summary.skipped,
            success_rate = summary.success_rate(),
            duration_ms = summary.duration_ms,
            "Annotation finished"
        );
        summary
    }

    async fn select_genes(
        &self,
        source: SourceName,
        selection: GeneSelection,
    ) -> Result<Vec<Gene>, IngestError> {
        let all = self.store.all_active_genes().await?;
        if selection == GeneSelection::MissingOnly || selection == GeneSelection::MissingOrExpired {
            let mut out = Vec::new();
            let now = time::OffsetDateTime::now_utc();
            for gene in all {
                match self.store.get_annotation(gene.id, source).await? {
                    None => out.push(gene),
                    Some(annotation)
                        if selection == GeneSelection::MissingOrExpired
                            && annotation.is_expired(now) =>
                    {
                        out.push(gene);
                    }
                    Some(_) => {}
                }
            }
            return Ok(out);
        }

        // Full selection still skips unexpired annotations so an unchanged
        // re-run writes nothing.
        let mut out = Vec::new();
        let now = time::OffsetDateTime::now_utc();
        for gene in all {
            match self.store.get_annotation(gene.id, source).await? {
                Some(annotation) if !annotation.is_expired(now) => {}
                _ => out.push(gene),
            }
        }
        Ok(out)
    }

    async fn pause_progress(
        &self,
        source: SourceName,
        checkpoint: &AnnotationCheckpoint,
        total: u64,
    ) -> Result<(), IngestError> {
        let mut record = crate::entities::ProgressRecord::idle(source);
        record.status = RunStatus::Paused;
        record.items_processed = checkpoint.processed_gene_ids.len() as u64;
        record.items_total = Some(total);
        record.checkpoint = Some(checkpoint.to_value()?);
        self.tracker.update(record).await
    }

    async fn finish_progress(&self, source: SourceName, status: RunStatus, error: Option<String>) {
        let mut record = match self.store.get_progress(source).await {
            Ok(record) => record,
            Err(_) => crate::entities::ProgressRecord::idle(source),
        };
        record.status = status;
        record.error = error;
        record.checkpoint = None;
        record.updated_at = time::OffsetDateTime::now_utc();
        if let Err(err) = self.tracker.update(record).await {
            warn!(source = source.as_str(), error = %err, "Terminal progress write failed");
        }
    }
}
