use serde::{Deserialize, Serialize};

use crate::error::IngestError;

/// Closed vocabulary of pipeline sources. Ingestion sources produce
/// evidence rows; annotation sources enrich canonical genes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceName {
    // Evidence ingestion
    Pubtator,
    Gencc,
    PanelappUk,
    PanelappAu,
    DiagnosticPanels,
    Literature,
    // Annotation
    Hgnc,
    Gnomad,
    Clinvar,
    Hpo,
    Mgi,
    StringDb,
    Gtex,
    Descartes,
}

impl SourceName {
    pub const ALL: [SourceName; 14] = [
        Self::Pubtator,
        Self::Gencc,
        Self::PanelappUk,
        Self::PanelappAu,
        Self::DiagnosticPanels,
        Self::Literature,
        Self::Hgnc,
        Self::Gnomad,
        Self::Clinvar,
        Self::Hpo,
        Self::Mgi,
        Self::StringDb,
        Self::Gtex,
        Self::Descartes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pubtator => "pubtator",
            Self::Gencc => "gencc",
            Self::PanelappUk => "panelapp_uk",
            Self::PanelappAu => "panelapp_au",
            Self::DiagnosticPanels => "diagnostic_panels",
            Self::Literature => "literature",
            Self::Hgnc => "hgnc",
            Self::Gnomad => "gnomad",
            Self::Clinvar => "clinvar",
            Self::Hpo => "hpo",
            Self::Mgi => "mgi",
            Self::StringDb => "string_db",
            Self::Gtex => "gtex",
            Self::Descartes => "descartes",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Pubtator => "PubTator3",
            Self::Gencc => "GenCC",
            Self::PanelappUk => "PanelApp UK",
            Self::PanelappAu => "PanelApp Australia",
            Self::DiagnosticPanels => "Diagnostic panels",
            Self::Literature => "Curated literature",
            Self::Hgnc => "HGNC",
            Self::Gnomad => "gnomAD",
            Self::Clinvar => "ClinVar",
            Self::Hpo => "HPO",
            Self::Mgi => "MGI mouse phenotypes",
            Self::StringDb => "STRING",
            Self::Gtex => "GTEx",
            Self::Descartes => "Descartes cell atlas",
        }
    }

    pub fn is_ingestion(&self) -> bool {
        matches!(
            self,
            Self::Pubtator
                | Self::Gencc
                | Self::PanelappUk
                | Self::PanelappAu
                | Self::DiagnosticPanels
                | Self::Literature
        )
    }

    pub fn is_annotation(&self) -> bool {
        !self.is_ingestion()
    }

    /// The canonical count key inside `evidence_data` for an ingestion
    /// source. Threshold filters key off this field.
    pub fn count_field(&self) -> Option<&'static str> {
        match self {
            Self::Pubtator | Self::Literature => Some("publication_count"),
            Self::Gencc => Some("submission_count"),
            Self::PanelappUk | Self::PanelappAu | Self::DiagnosticPanels => Some("panel_count"),
            _ => None,
        }
    }

    /// Annotation sources that resolve genes through Ensembl identifiers
    /// depend on HGNC cross-references landing first.
    pub fn requires_hgnc_xrefs(&self) -> bool {
        matches!(self, Self::Gtex | Self::Descartes)
    }
}

impl std::fmt::Display for SourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceName {
    type Err = IngestError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .find(|s| s.as_str() == normalized)
            .copied()
            .ok_or_else(|| {
                IngestError::Config(format!(
                    "Unknown source name '{value}'. Known sources: {}",
                    Self::ALL
                        .iter()
                        .map(SourceName::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::SourceName;
    use std::str::FromStr;

    #[test]
    fn round_trips_every_source_name() {
        for source in SourceName::ALL {
            let parsed = SourceName::from_str(source.as_str()).expect("parse");
            assert_eq!(parsed, source);
        }
    }

    #[test]
    fn parse_accepts_dashes_and_case() {
        assert_eq!(
            SourceName::from_str("PanelApp-UK").expect("parse"),
            SourceName::PanelappUk
        );
    }

    #[test]
    fn parse_rejects_unknown_source() {
        let err = SourceName::from_str("omim").expect_err("unknown source");
        assert!(err.to_string().contains("Unknown source name 'omim'"));
    }

    #[test]
    fn count_fields_exist_only_for_ingestion_sources() {
        for source in SourceName::ALL {
            assert_eq!(source.count_field().is_some(), source.is_ingestion());
        }
    }

    #[test]
    fn ensembl_consumers_require_hgnc() {
        assert!(SourceName::Gtex.requires_hgnc_xrefs());
        assert!(SourceName::Descartes.requires_hgnc_xrefs());
        assert!(!SourceName::Clinvar.requires_hgnc_xrefs());
    }
}
