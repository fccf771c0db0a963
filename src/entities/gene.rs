use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Opaque canonical gene identifier, assigned by the store on first
/// successful normalization.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct GeneId(pub u64);

impl std::fmt::Display for GeneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Canonical gene row. Identity is `(approved_symbol, hgnc_id)`; genes are
/// never destroyed, only deactivated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gene {
    pub id: GeneId,
    pub approved_symbol: String,
    pub hgnc_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ensembl_gene_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ncbi_gene_id: Option<String>,
    /// Cytogenetic location as reported by HGNC (e.g. "16p13.3").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Gene {
    pub fn new(id: GeneId, approved_symbol: impl Into<String>, hgnc_id: impl Into<String>) -> Self {
        Self {
            id,
            approved_symbol: approved_symbol.into(),
            hgnc_id: hgnc_id.into(),
            ensembl_gene_id: None,
            ncbi_gene_id: None,
            location: None,
            aliases: BTreeSet::new(),
            created_at: OffsetDateTime::now_utc(),
            active: true,
        }
    }

    /// Chromosome arm prefix of the cytogenetic location ("16p13.3" → "16").
    pub fn chromosome(&self) -> Option<String> {
        chromosome_of(self.location.as_deref()?)
    }

    /// True when `symbol` matches the approved symbol or any alias,
    /// case-insensitively.
    pub fn matches_symbol(&self, symbol: &str) -> bool {
        let needle = symbol.trim().to_ascii_uppercase();
        if self.approved_symbol.to_ascii_uppercase() == needle {
            return true;
        }
        self.aliases
            .iter()
            .any(|alias| alias.to_ascii_uppercase() == needle)
    }
}

/// Extracts the chromosome from a cytogenetic location string.
pub fn chromosome_of(location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    let upper = location.to_ascii_uppercase();
    if upper.starts_with('X') || upper.starts_with('Y') {
        return Some(upper[..1].to_string());
    }
    let digits: String = location.chars().take_while(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

/// Resolved gene attributes handed to the store on create-or-link.
#[derive(Debug, Clone, Default)]
pub struct GeneDraft {
    pub approved_symbol: String,
    pub hgnc_id: String,
    pub ensembl_gene_id: Option<String>,
    pub ncbi_gene_id: Option<String>,
    pub location: Option<String>,
    pub aliases: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chromosome_extraction_handles_autosomes_and_sex_chromosomes() {
        assert_eq!(chromosome_of("16p13.3").as_deref(), Some("16"));
        assert_eq!(chromosome_of("Xq22.3").as_deref(), Some("X"));
        assert_eq!(chromosome_of("2q37").as_deref(), Some("2"));
        assert_eq!(chromosome_of(""), None);
        assert_eq!(chromosome_of("p13"), None);
    }

    #[test]
    fn matches_symbol_covers_approved_and_aliases() {
        let mut gene = Gene::new(GeneId(1), "PKD1", "HGNC:9008");
        gene.aliases.insert("PBP".to_string());

        assert!(gene.matches_symbol("pkd1"));
        assert!(gene.matches_symbol(" PBP "));
        assert!(!gene.matches_symbol("PKD2"));
    }

    #[test]
    fn gene_serializes_without_empty_xrefs() {
        let gene = Gene::new(GeneId(7), "NPHS1", "HGNC:7908");
        let json = serde_json::to_value(&gene).expect("serialize");
        assert!(json.get("ensembl_gene_id").is_none());
        assert_eq!(json["approved_symbol"], "NPHS1");
        assert_eq!(json["active"], true);
    }
}
