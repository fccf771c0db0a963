use regex::Regex;

use crate::config::SourceConfig;
use crate::error::IngestError;

/// The precise boolean test deciding whether a record belongs in the
/// kidney domain. Inclusion terms compile into one case-insensitive
/// alternation; exclusion terms veto. Broad substrings ("tubul", "cyst")
/// are rejected at config load, so every inclusion hit is intentional:
/// "adrenal" contains "renal" and is vetoed here, not by narrowing the
/// inclusion terms.
#[derive(Debug)]
pub(crate) struct KidneyPredicate {
    include: Regex,
    exclude: Option<Regex>,
}

fn alternation(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| regex::escape(t.trim()))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("|")
}

impl KidneyPredicate {
    pub(crate) fn from_config(config: &SourceConfig) -> Result<Self, IngestError> {
        Self::new(&config.kidney_include, &config.kidney_exclude)
    }

    pub(crate) fn new(include: &[String], exclude: &[String]) -> Result<Self, IngestError> {
        let include_alt = alternation(include);
        if include_alt.is_empty() {
            return Err(IngestError::Config(
                "kidney predicate requires at least one inclusion term".to_string(),
            ));
        }
        let include = Regex::new(&format!("(?i)({include_alt})"))
            .map_err(|err| IngestError::Config(format!("kidney include terms: {err}")))?;

        let exclude_alt = alternation(exclude);
        let exclude = if exclude_alt.is_empty() {
            None
        } else {
            Some(
                Regex::new(&format!("(?i)({exclude_alt})"))
                    .map_err(|err| IngestError::Config(format!("kidney exclude terms: {err}")))?,
            )
        };

        Ok(Self { include, exclude })
    }

    /// True iff an inclusion term matches and no exclusion term does.
    pub(crate) fn matches(&self, text: &str) -> bool {
        if !self.include.is_match(text) {
            return false;
        }
        match &self.exclude {
            Some(exclude) => !exclude.is_match(text),
            None => true,
        }
    }

    /// Two-stage panel filter. Stage 1 collects candidates whose name,
    /// disease group, or relevant disorders hit an inclusion keyword;
    /// stage 2 confirms on the per-panel fields so a stray keyword in an
    /// unrelated panel name cannot slip through the exclusions.
    pub(crate) fn matches_panel(
        &self,
        name: &str,
        disease_group: Option<&str>,
        relevant_disorders: &[String],
    ) -> bool {
        let candidate = self.include.is_match(name)
            || disease_group.is_some_and(|g| self.include.is_match(g))
            || relevant_disorders.iter().any(|d| self.include.is_match(d));
        if !candidate {
            return false;
        }

        self.matches(name)
            || disease_group.is_some_and(|g| self.matches(g))
            || relevant_disorders.iter().any(|d| self.matches(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_predicate() -> KidneyPredicate {
        KidneyPredicate::new(
            &[
                "kidney".to_string(),
                "renal".to_string(),
                "nephro".to_string(),
            ],
            &["adrenal".to_string()],
        )
        .expect("predicate")
    }

    #[test]
    fn matches_core_kidney_terms() {
        let predicate = default_predicate();
        assert!(predicate.matches("Renal tubulopathies"));
        assert!(predicate.matches("Cystic kidney disease"));
        assert!(predicate.matches("Steroid-resistant nephrotic syndrome"));
        assert!(predicate.matches("Congenital anomalies of the kidney and urinary tract"));
    }

    #[test]
    fn rejects_non_kidney_panels() {
        let predicate = default_predicate();
        // The historical failure: "Cerebral malformation" panels carrying
        // TUBA1A must never match.
        assert!(!predicate.matches("Cerebral malformation"));
        assert!(!predicate.matches("Hereditary spastic paraplegia"));
    }

    #[test]
    fn adrenal_is_excluded_despite_containing_renal() {
        let predicate = default_predicate();
        assert!(!predicate.matches("Congenital adrenal hyperplasia"));
        assert!(!predicate.matches("Adrenal insufficiency"));
    }

    #[test]
    fn panel_filter_confirms_on_disorders() {
        let predicate = default_predicate();
        assert!(predicate.matches_panel(
            "Proteinuria",
            Some("Renal and urinary tract disorders"),
            &[]
        ));
        assert!(predicate.matches_panel(
            "Ciliopathies",
            None,
            &["Nephronophthisis".to_string(), "Retinal dystrophy".to_string()]
        ));
        assert!(!predicate.matches_panel("Cerebral malformation", Some("Neurology"), &[]));
    }

    #[test]
    fn panel_filter_rejects_candidates_that_only_hit_exclusions() {
        let predicate = default_predicate();
        assert!(!predicate.matches_panel("Adrenal disorders", None, &[]));
    }

    #[test]
    fn empty_include_terms_are_a_config_error() {
        let err = KidneyPredicate::new(&[], &[]).expect_err("no inclusion terms");
        assert!(err.to_string().contains("at least one inclusion term"));
    }
}
