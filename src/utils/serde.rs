use serde::{Deserialize, Serialize};

/// Upstream APIs are inconsistent about single-vs-list string fields
/// (HGNC alias_symbol, PanelApp publications); this absorbs all shapes.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StringOrVec {
    #[default]
    None,
    Single(String),
    Multiple(Vec<String>),
}

impl StringOrVec {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::Single(value) => vec![value],
            Self::Multiple(values) => values,
        }
    }
}
