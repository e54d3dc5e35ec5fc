use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaCategory {
    Antigravity,
    Codex,
}

impl QuotaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaCategory::Antigravity => "antigravity",
            QuotaCategory::Codex => "codex",
        }
    }
}

impl fmt::Display for QuotaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelQuota {
    pub name: String,
    /// Remaining share, 0-100.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderQuotaData {
    pub models: Vec<ModelQuota>,
}

impl ProviderQuotaData {
    pub fn new(models: Vec<ModelQuota>) -> Self {
        Self { models }
    }

    /// Lowest remaining percentage across tracked models, `None` when
    /// nothing is tracked.
    pub fn min_percentage(&self) -> Option<f64> {
        self.models
            .iter()
            .map(|m| m.percentage)
            .filter(|p| p.is_finite())
            .reduce(f64::min)
    }
}

/// Per-account quota keyed by account label.
pub type CategoryQuota = HashMap<String, ProviderQuotaData>;

/// One upstream quota backend. A fetch returns the full snapshot for its
/// category.
#[async_trait]
pub trait QuotaSource: Send + Sync {
    fn category(&self) -> QuotaCategory;

    async fn fetch(&self) -> CoreResult<CategoryQuota>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(values: &[f64]) -> ProviderQuotaData {
        ProviderQuotaData::new(
            values
                .iter()
                .enumerate()
                .map(|(i, p)| ModelQuota {
                    name: format!("model-{}", i),
                    percentage: *p,
                })
                .collect(),
        )
    }

    #[test]
    fn min_percentage_ignores_nan() {
        assert_eq!(quota(&[80.0, 12.5, 40.0]).min_percentage(), Some(12.5));
        assert_eq!(quota(&[f64::NAN, 30.0]).min_percentage(), Some(30.0));
        assert_eq!(quota(&[]).min_percentage(), None);
    }

    #[test]
    fn category_map_keys_serialize_as_names() {
        let mut map = HashMap::new();
        map.insert(QuotaCategory::Codex, 1);
        assert_eq!(serde_json::to_string(&map).unwrap(), r#"{"codex":1}"#);
    }
}
