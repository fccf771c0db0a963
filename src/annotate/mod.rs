//! Annotation sources: per-gene enrichment with validated caching.
//!
//! Every source implements [`AnnotationSource`]; the shared
//! [`update_gene`] driver owns the cache-lookup → fetch → validate →
//! cache-and-persist sequence so no source can cache an invalid payload.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::CacheService;
use crate::entities::{Gene, GeneAnnotation, SourceName};
use crate::error::IngestError;
use crate::store::{AnnotationStore, Store};

pub(crate) mod clinvar;
pub(crate) mod descartes;
pub(crate) mod gnomad;
pub(crate) mod gtex;
pub(crate) mod hgnc;
pub(crate) mod hpo;
pub(crate) mod hpo_classify;
pub(crate) mod mgi;
pub(crate) mod string_db;

#[async_trait]
pub(crate) trait AnnotationSource: Send + Sync {
    fn source_name(&self) -> SourceName;

    fn version(&self) -> &'static str;

    fn cache_ttl_days(&self) -> u32;

    /// Fetches the enrichment payload for one gene. A valid
    /// "nothing known" result is an `Ok` payload that passes `is_valid`;
    /// transient upstream trouble is an `Err`.
    async fn fetch_annotation(&self, gene: &Gene) -> Result<serde_json::Value, IngestError>;

    /// Source-specific validity predicate, run before any cache or store
    /// write.
    fn is_valid(&self, annotation: &serde_json::Value) -> bool;

    /// Post-write hook for sources whose payloads feed back into the
    /// canonical gene row (HGNC cross-references).
    async fn apply_side_effects(
        &self,
        _store: &dyn Store,
        _gene: &Gene,
        _annotation: &serde_json::Value,
    ) -> Result<(), IngestError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnnotationOutcome {
    Fetched,
    FromCache,
}

/// Cache key for one gene within a source namespace: the HGNC id is the
/// only identifier stable across symbol updates.
fn cache_key(gene: &Gene) -> serde_json::Value {
    json!(gene.hgnc_id)
}

/// The single write path for annotations. On any error the gene is left
/// untouched: nothing is cached, nothing is persisted.
pub(crate) async fn update_gene(
    source: &dyn AnnotationSource,
    cache: &CacheService,
    store: &dyn Store,
    gene: &Gene,
) -> Result<AnnotationOutcome, IngestError> {
    let namespace = source.source_name().as_str();
    let key = cache_key(gene);

    if let Some(cached) = cache.get(&key, namespace).await? {
        if source.is_valid(&cached) {
            let mut annotation = GeneAnnotation::new(
                gene.id,
                source.source_name(),
                cached.clone(),
                source.cache_ttl_days(),
            );
            annotation.from_cache = true;
            source.apply_side_effects(store, gene, &cached).await?;
            store.write_annotation(annotation).await?;
            debug!(
                source = namespace,
                gene = gene.approved_symbol.as_str(),
                "Annotation served from cache"
            );
            return Ok(AnnotationOutcome::FromCache);
        }
        // A stale invalid entry predates the validity discipline; drop it.
        warn!(
            source = namespace,
            gene = gene.approved_symbol.as_str(),
            "Evicting invalid cached annotation"
        );
        cache.delete(&key, namespace).await?;
    }

    let fetched = source.fetch_annotation(gene).await?;
    if !source.is_valid(&fetched) {
        return Err(IngestError::InvalidAnnotation {
            api: namespace.to_string(),
            gene: gene.approved_symbol.clone(),
            reason: "payload failed the source validity predicate".to_string(),
        });
    }

    let ttl_seconds = u64::from(source.cache_ttl_days()) * 24 * 60 * 60;
    cache
        .set(&key, fetched.clone(), namespace, ttl_seconds)
        .await?;
    source.apply_side_effects(store, gene, &fetched).await?;
    store
        .write_annotation(GeneAnnotation::new(
            gene.id,
            source.source_name(),
            fetched,
            source.cache_ttl_days(),
        ))
        .await?;
    Ok(AnnotationOutcome::Fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::GeneId;
    use crate::store::{AnnotationStore, MemoryStore};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeSource {
        payload: serde_json::Value,
        fetches: AtomicU32,
        fail: bool,
    }

    impl FakeSource {
        fn returning(payload: serde_json::Value) -> Self {
            Self {
                payload,
                fetches: AtomicU32::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl AnnotationSource for FakeSource {
        fn source_name(&self) -> SourceName {
            SourceName::Gnomad
        }

        fn version(&self) -> &'static str {
            "test"
        }

        fn cache_ttl_days(&self) -> u32 {
            30
        }

        async fn fetch_annotation(&self, _gene: &Gene) -> Result<serde_json::Value, IngestError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IngestError::Api {
                    api: "gnomad".into(),
                    message: "HTTP 503".into(),
                });
            }
            Ok(self.payload.clone())
        }

        fn is_valid(&self, annotation: &serde_json::Value) -> bool {
            annotation.get("pli").map(|v| !v.is_null()).unwrap_or(false)
        }
    }

    fn scratch() -> (tempfile::TempDir, CacheService, MemoryStore, Gene) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheService::open(&dir.path().join("cache.redb")).expect("cache");
        let store = MemoryStore::new();
        let gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        (dir, cache, store, gene)
    }

    #[tokio::test]
    async fn valid_fetch_is_cached_and_persisted() {
        let (_dir, cache, store, gene) = scratch();
        let source = FakeSource::returning(json!({"pli": 0.98}));

        let outcome = update_gene(&source, &cache, &store, &gene)
            .await
            .expect("update");
        assert_eq!(outcome, AnnotationOutcome::Fetched);

        let stored = store
            .get_annotation(gene.id, SourceName::Gnomad)
            .await
            .expect("read")
            .expect("annotation exists");
        assert_eq!(stored.annotations["pli"], json!(0.98));
        assert!(!stored.from_cache);

        // Second update round-trips through the cache without fetching.
        let outcome = update_gene(&source, &cache, &store, &gene)
            .await
            .expect("update again");
        assert_eq!(outcome, AnnotationOutcome::FromCache);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_neither_cached_nor_persisted() {
        let (_dir, cache, store, gene) = scratch();
        let source = FakeSource::returning(json!({"pli": null, "lof_z": null}));

        let err = update_gene(&source, &cache, &store, &gene)
            .await
            .expect_err("all-null payload is invalid");
        assert!(matches!(err, IngestError::InvalidAnnotation { .. }));

        assert!(
            store
                .get_annotation(gene.id, SourceName::Gnomad)
                .await
                .expect("read")
                .is_none()
        );
        assert_eq!(
            cache
                .get(&json!("HGNC:9008"), "gnomad")
                .await
                .expect("cache read"),
            None
        );
    }

    #[tokio::test]
    async fn fetch_error_leaves_no_trace() {
        let (_dir, cache, store, gene) = scratch();
        let source = FakeSource {
            fail: true,
            ..FakeSource::returning(json!({"pli": 0.5}))
        };

        update_gene(&source, &cache, &store, &gene)
            .await
            .expect_err("fetch fails");
        assert!(
            store
                .get_annotation(gene.id, SourceName::Gnomad)
                .await
                .expect("read")
                .is_none()
        );
    }
}
