//! Gene mention normalization: raw free-text symbols → canonical genes.
//!
//! The batch entry point is async all the way down; there is deliberately
//! no synchronous wrapper spawning its own event loop. Unresolvable or
//! ambiguous mentions land in the staging queue and never block a run.

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use futures::future::join_all;
use regex::Regex;
use tracing::debug;

use crate::annotate::hgnc::{HgncCandidate, HgncClient};
use crate::config::{AUTO_ACCEPT_CONFIDENCE, Config, REJECT_CONFIDENCE};
use crate::entities::{Gene, SourceName, StagingCandidate, StagingStatus, gene::chromosome_of};
use crate::error::IngestError;
use crate::store::{EvidenceStore, GeneStore, StagingStore, Store};

#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    Resolved { gene: Gene },
    Staged { staging_id: u64 },
    Rejected { reason: String },
}

pub(crate) struct GeneNormalizer {
    hgnc: HgncClient,
    auto_accept_threshold: f64,
    reject_threshold: f64,
}

/// Symbol-shaped tokens: leading letter, then letters/digits/connectors,
/// 2–20 characters overall.
fn symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.-]{1,19}$").expect("static regex"))
}

/// Cleans one raw mention. Case is normalized for lookup only; callers
/// keep the original text for the audit trail.
pub(crate) fn clean_mention(raw: &str) -> Option<String> {
    let token = raw
        .trim()
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .trim();
    if token.is_empty() || !symbol_regex().is_match(token) {
        return None;
    }
    Some(token.to_ascii_uppercase())
}

impl GeneNormalizer {
    pub(crate) fn new(config: &Config) -> Result<Self, IngestError> {
        Ok(Self {
            hgnc: HgncClient::new(config.source(SourceName::Hgnc))?,
            auto_accept_threshold: AUTO_ACCEPT_CONFIDENCE,
            reject_threshold: REJECT_CONFIDENCE,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(base: String) -> Self {
        Self {
            hgnc: HgncClient::new_for_test(base),
            auto_accept_threshold: AUTO_ACCEPT_CONFIDENCE,
            reject_threshold: REJECT_CONFIDENCE,
        }
    }

    /// Resolves a batch of raw mentions for one source. Local lookups are
    /// batched into a single read; only the remainder goes to HGNC, in
    /// parallel behind the client's rate limiter.
    pub(crate) async fn normalize_batch(
        &self,
        store: &dyn Store,
        source: SourceName,
        mentions: &[String],
    ) -> Result<HashMap<String, Resolution>, IngestError> {
        let mut resolutions: HashMap<String, Resolution> = HashMap::new();
        let mut cleaned: HashMap<String, Vec<String>> = HashMap::new();

        for raw in mentions {
            if resolutions.contains_key(raw) || cleaned.values().flatten().any(|r| r == raw) {
                continue;
            }
            match clean_mention(raw) {
                Some(token) => cleaned.entry(token).or_default().push(raw.clone()),
                None => {
                    resolutions.insert(
                        raw.clone(),
                        Resolution::Rejected {
                            reason: "does not look like a gene symbol".to_string(),
                        },
                    );
                }
            }
        }

        // Local pass: one batched read over approved symbols and aliases.
        let tokens: Vec<String> = cleaned.keys().cloned().collect();
        let local_hits = store.find_by_symbols(&tokens).await?;
        let mut unresolved: Vec<(String, Vec<String>)> = Vec::new();
        let mut locally_resolved_tokens: Vec<String> = Vec::new();
        for (token, raws) in cleaned {
            match local_hits.iter().find(|g| g.matches_symbol(&token)) {
                Some(gene) => {
                    locally_resolved_tokens.push(token);
                    for raw in raws {
                        resolutions.insert(
                            raw,
                            Resolution::Resolved { gene: gene.clone() },
                        );
                    }
                }
                None => unresolved.push((token, raws)),
            }
        }

        // A mention staged on an earlier run may now resolve locally (the
        // gene has since been approved or created); close its record.
        if !locally_resolved_tokens.is_empty() {
            for record in store.pending_staging().await? {
                if record.source_hint == source
                    && locally_resolved_tokens
                        .iter()
                        .any(|t| t.eq_ignore_ascii_case(&record.raw_text))
                {
                    store
                        .resolve_staging(
                            record.id,
                            StagingStatus::AutoResolved,
                            None,
                            Some("resolved by canonical lookup".to_string()),
                        )
                        .await?;
                }
            }
        }

        if unresolved.is_empty() {
            return Ok(resolutions);
        }

        // Chromosomes already evidenced by this source break candidate ties.
        let source_chromosomes = self.source_chromosomes(store, source).await?;

        let lookups = unresolved.iter().map(|(token, _)| {
            let token = token.clone();
            async move { (token.clone(), self.hgnc.resolve(&token).await) }
        });
        let mut remote: HashMap<String, Vec<HgncCandidate>> = HashMap::new();
        let mut remote_errors: HashMap<String, String> = HashMap::new();
        for (token, result) in join_all(lookups).await {
            match result {
                Ok(candidates) => {
                    remote.insert(token, candidates);
                }
                Err(err) => {
                    remote_errors.insert(token, err.to_string());
                }
            }
        }

        for (token, raws) in unresolved {
            if let Some(message) = remote_errors.get(&token) {
                for raw in raws {
                    resolutions.insert(
                        raw,
                        Resolution::Rejected {
                            reason: format!("HGNC lookup failed: {message}"),
                        },
                    );
                }
                continue;
            }
            let candidates = remote.remove(&token).unwrap_or_default();
            let resolution = self
                .dispose(store, source, &token, candidates, &source_chromosomes)
                .await?;
            for raw in raws {
                resolutions.insert(raw, resolution.clone());
            }
        }

        Ok(resolutions)
    }

    async fn source_chromosomes(
        &self,
        store: &dyn Store,
        source: SourceName,
    ) -> Result<HashSet<String>, IngestError> {
        let mut chromosomes = HashSet::new();
        for evidence in store.evidence_for_source(source).await? {
            if let Some(gene) = store.get_gene(evidence.gene_id).await?
                && let Some(chromosome) = gene.chromosome()
            {
                chromosomes.insert(chromosome);
            }
        }
        Ok(chromosomes)
    }

    async fn dispose(
        &self,
        store: &dyn Store,
        source: SourceName,
        token: &str,
        mut candidates: Vec<HgncCandidate>,
        source_chromosomes: &HashSet<String>,
    ) -> Result<Resolution, IngestError> {
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let Some(best_confidence) = candidates.first().map(|c| c.confidence) else {
            return Ok(Resolution::Rejected {
                reason: "no HGNC match".to_string(),
            });
        };
        if best_confidence < self.reject_threshold {
            return Ok(Resolution::Rejected {
                reason: format!("best HGNC match confidence {best_confidence:.2} below floor"),
            });
        }

        if best_confidence >= self.auto_accept_threshold {
            let top: Vec<&HgncCandidate> = candidates
                .iter()
                .filter(|c| (c.confidence - best_confidence).abs() < f64::EPSILON)
                .collect();
            let winner = match top.as_slice() {
                [single] => Some(*single),
                ties => pick_tie_winner(ties, source_chromosomes),
            };
            if let Some(winner) = winner {
                match store.upsert_gene(winner.record.to_draft()).await {
                    Ok(gene) => return Ok(Resolution::Resolved { gene }),
                    Err(IngestError::StagingConflict { reason, .. }) => {
                        debug!(token, reason = reason.as_str(), "Alias collision; staging");
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        let staged = store
            .add_staging(token, source, to_staging_candidates(&candidates))
            .await?;
        Ok(Resolution::Staged {
            staging_id: staged.id,
        })
    }

    /// Approves a pending staging record: creates or links the canonical
    /// gene from the best candidate.
    pub(crate) async fn approve_staging(
        &self,
        store: &dyn Store,
        staging_id: u64,
        reviewer: &str,
    ) -> Result<Gene, IngestError> {
        let pending = store.pending_staging().await?;
        let record = pending
            .iter()
            .find(|r| r.id == staging_id)
            .ok_or_else(|| IngestError::Store(format!("no pending staging record {staging_id}")))?;
        let candidate = record.best_candidate().ok_or_else(|| {
            IngestError::Store(format!("staging record {staging_id} has no candidates"))
        })?;

        let gene = store
            .upsert_gene(crate::entities::GeneDraft {
                approved_symbol: candidate.approved_symbol.clone(),
                hgnc_id: candidate.hgnc_id.clone(),
                location: candidate.chromosome.clone(),
                ..Default::default()
            })
            .await?;
        store
            .resolve_staging(
                staging_id,
                StagingStatus::Approved,
                Some(reviewer.to_string()),
                None,
            )
            .await?;
        Ok(gene)
    }
}

fn to_staging_candidates(candidates: &[HgncCandidate]) -> Vec<StagingCandidate> {
    candidates
        .iter()
        .map(|c| StagingCandidate {
            approved_symbol: c.record.symbol.clone(),
            hgnc_id: c.record.hgnc_id.clone(),
            confidence: c.confidence,
            match_kind: c.match_kind.to_string(),
            chromosome: c.record.location.as_deref().and_then(chromosome_of),
        })
        .collect()
}

/// Equal-confidence tie-break: prefer the candidate whose chromosome is
/// consistent with genes already evidenced by this source, then approved
/// matches over aliases. A tie that survives both rules is staged.
fn pick_tie_winner<'a>(
    ties: &[&'a HgncCandidate],
    source_chromosomes: &HashSet<String>,
) -> Option<&'a HgncCandidate> {
    let consistent: Vec<&&HgncCandidate> = ties
        .iter()
        .filter(|c| {
            c.record
                .location
                .as_deref()
                .and_then(chromosome_of)
                .is_some_and(|chr| source_chromosomes.contains(&chr))
        })
        .collect();
    if let [single] = consistent.as_slice() {
        return Some(**single);
    }

    let approved: Vec<&&HgncCandidate> = ties
        .iter()
        .filter(|c| c.match_kind == "approved")
        .collect();
    if let [single] = approved.as_slice() {
        return Some(**single);
    }

    None
}
