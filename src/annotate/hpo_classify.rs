//! Kidney phenotype classification over HPO term sets.
//!
//! Scores are computed from descendant-set intersections prepared once
//! per run (see the HPO annotator). The syndromic assessment runs over
//! the gene's **full** phenotype set: pre-filtering to non-kidney terms
//! deflates every category denominator and misclassifies syndromic genes
//! as isolated.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

/// Minimum share of phenotypes inside one extra-renal category for a gene
/// to be called syndromic.
pub(crate) const SYNDROMIC_THRESHOLD: f64 = 0.1;

#[derive(Debug, Clone)]
pub(crate) struct ClinicalGroup {
    pub key: &'static str,
    pub weight: f64,
    pub terms: HashSet<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct TermGroup {
    pub key: &'static str,
    pub terms: HashSet<String>,
}

/// Descendant closures for every signature root, computed once per run
/// and cached for 24h.
#[derive(Debug, Clone)]
pub(crate) struct DescendantSets {
    pub clinical: Vec<ClinicalGroup>,
    pub onset: Vec<TermGroup>,
    pub syndromic: Vec<TermGroup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum Confidence {
    Insufficient,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct Classification {
    pub clinical_group_scores: BTreeMap<String, f64>,
    pub primary_clinical_group: Option<String>,
    pub onset_probabilities: BTreeMap<String, f64>,
    pub primary_onset_group: Option<String>,
    pub syndromic_category_scores: BTreeMap<String, f64>,
    pub is_syndromic: bool,
    pub confidence: Confidence,
    pub phenotype_count: usize,
}

fn confidence_for(phenotype_count: usize) -> Confidence {
    match phenotype_count {
        0..=2 => Confidence::Insufficient,
        3..=9 => Confidence::Low,
        10..=29 => Confidence::Medium,
        _ => Confidence::High,
    }
}

/// Argmax over insertion order; the first maximal key wins so results are
/// deterministic across runs.
fn argmax<'a, I>(scores: I) -> Option<&'a str>
where
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let mut best: Option<(&str, f64)> = None;
    for (key, score) in scores {
        let better = match best {
            Some((_, best_score)) => score > best_score,
            None => score > 0.0,
        };
        if better {
            best = Some((key, score));
        }
    }
    best.map(|(key, _)| key)
}

pub(crate) fn classify(phenotypes: &[String], sets: &DescendantSets) -> Classification {
    let phenotype_set: HashSet<&str> = phenotypes.iter().map(String::as_str).collect();
    let total_phenotypes = phenotype_set.len();

    // Clinical groups: weighted signature overlap, normalized to sum 1.
    let mut raw_clinical: Vec<(&str, f64)> = Vec::new();
    for group in &sets.clinical {
        let overlap = group
            .terms
            .iter()
            .filter(|t| phenotype_set.contains(t.as_str()))
            .count();
        let score = if group.terms.is_empty() {
            0.0
        } else {
            (overlap as f64 / group.terms.len() as f64) * group.weight
        };
        raw_clinical.push((group.key, score));
    }
    let clinical_total: f64 = raw_clinical.iter().map(|(_, s)| s).sum();
    let clinical_group_scores: BTreeMap<String, f64> = raw_clinical
        .iter()
        .map(|(key, score)| {
            let normalized = if clinical_total > 0.0 {
                score / clinical_total
            } else {
                0.0
            };
            ((*key).to_string(), normalized)
        })
        .collect();
    let primary_clinical_group = argmax(
        raw_clinical
            .iter()
            .map(|(key, score)| (*key, *score)),
    )
    .map(str::to_string);

    // Onset groups: intersection counts normalized to probabilities.
    let mut raw_onset: Vec<(&str, f64)> = Vec::new();
    for group in &sets.onset {
        let overlap = group
            .terms
            .iter()
            .filter(|t| phenotype_set.contains(t.as_str()))
            .count();
        raw_onset.push((group.key, overlap as f64));
    }
    let onset_total: f64 = raw_onset.iter().map(|(_, s)| s).sum();
    let onset_probabilities: BTreeMap<String, f64> = raw_onset
        .iter()
        .map(|(key, count)| {
            let probability = if onset_total > 0.0 {
                count / onset_total
            } else {
                0.0
            };
            ((*key).to_string(), probability)
        })
        .collect();
    let primary_onset_group =
        argmax(raw_onset.iter().map(|(key, score)| (*key, *score))).map(str::to_string);

    // Syndromic assessment over ALL phenotypes.
    let mut syndromic_category_scores: BTreeMap<String, f64> = BTreeMap::new();
    let mut max_category_score = 0.0f64;
    for group in &sets.syndromic {
        let overlap = group
            .terms
            .iter()
            .filter(|t| phenotype_set.contains(t.as_str()))
            .count();
        let score = if total_phenotypes == 0 {
            0.0
        } else {
            overlap as f64 / total_phenotypes as f64
        };
        max_category_score = max_category_score.max(score);
        syndromic_category_scores.insert(group.key.to_string(), score);
    }

    Classification {
        clinical_group_scores,
        primary_clinical_group,
        onset_probabilities,
        primary_onset_group,
        syndromic_category_scores,
        is_syndromic: max_category_score >= SYNDROMIC_THRESHOLD,
        confidence: confidence_for(total_phenotypes),
        phenotype_count: total_phenotypes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sets() -> DescendantSets {
        DescendantSets {
            clinical: vec![
                ClinicalGroup {
                    key: "glomerulopathy",
                    weight: 1.0,
                    terms: terms(&["HP:G1", "HP:G2"]),
                },
                ClinicalGroup {
                    key: "cyst_cilio",
                    weight: 1.0,
                    terms: terms(&["HP:C1", "HP:C2"]),
                },
            ],
            onset: vec![
                TermGroup {
                    key: "congenital",
                    terms: terms(&["HP:ON1"]),
                },
                TermGroup {
                    key: "adult",
                    terms: terms(&["HP:ON2"]),
                },
            ],
            syndromic: vec![
                TermGroup {
                    key: "head_neck",
                    terms: terms(&["HP:HN1", "HP:HN2"]),
                },
                TermGroup {
                    key: "neurologic",
                    terms: terms(&["HP:N1"]),
                },
            ],
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn clinical_scores_normalize_to_one_and_pick_a_primary() {
        let classification = classify(&ids(&["HP:G1", "HP:G2", "HP:C1"]), &sets());
        let sum: f64 = classification.clinical_group_scores.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(
            classification.primary_clinical_group.as_deref(),
            Some("glomerulopathy")
        );
    }

    #[test]
    fn no_clinical_overlap_means_no_primary_group() {
        let classification = classify(&ids(&["HP:HN1"]), &sets());
        assert_eq!(classification.primary_clinical_group, None);
        let sum: f64 = classification.clinical_group_scores.values().sum();
        assert!(sum.abs() < 1e-9);
    }

    #[test]
    fn syndromic_uses_the_full_phenotype_set() {
        // An Alport-like gene: kidney terms plus hearing loss. The kidney
        // terms stay in the denominator, and the head/neck match still
        // clears the threshold.
        let classification = classify(&ids(&["HP:G1", "HP:G2", "HP:ON2", "HP:HN1"]), &sets());
        assert!(classification.is_syndromic);
        let head_neck = classification.syndromic_category_scores["head_neck"];
        assert!((head_neck - 0.25).abs() < 1e-9);
    }

    #[test]
    fn pure_kidney_phenotypes_remain_isolated() {
        // A PKD-like gene with exclusively renal phenotypes must never be
        // called syndromic.
        let classification = classify(&ids(&["HP:C1", "HP:C2", "HP:ON2"]), &sets());
        assert!(!classification.is_syndromic);
        assert!(
            classification
                .syndromic_category_scores
                .values()
                .all(|s| *s == 0.0)
        );
        assert_eq!(
            classification.primary_clinical_group.as_deref(),
            Some("cyst_cilio")
        );
    }

    #[test]
    fn onset_probabilities_are_normalized() {
        let classification = classify(&ids(&["HP:ON1", "HP:ON2", "HP:G1"]), &sets());
        let sum: f64 = classification.onset_probabilities.values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(classification.primary_onset_group.is_some());
    }

    #[test]
    fn confidence_tiers_follow_phenotype_counts() {
        assert_eq!(confidence_for(0), Confidence::Insufficient);
        assert_eq!(confidence_for(2), Confidence::Insufficient);
        assert_eq!(confidence_for(3), Confidence::Low);
        assert_eq!(confidence_for(10), Confidence::Medium);
        assert_eq!(confidence_for(30), Confidence::High);
    }

    #[test]
    fn empty_phenotypes_classify_without_panicking() {
        let classification = classify(&[], &sets());
        assert!(!classification.is_syndromic);
        assert_eq!(classification.confidence, Confidence::Insufficient);
        assert_eq!(classification.phenotype_count, 0);
    }
}
