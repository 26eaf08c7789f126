// Inventory types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where a stored model's bytes live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ModelSource {
    /// Physically inside the managed models directory
    #[serde(rename_all = "camelCase")]
    Owned { path: PathBuf, size_bytes: u64 },
    /// Registry pointer to a file elsewhere, never copied
    #[serde(rename_all = "camelCase")]
    Linked { source_uri: String, size_bytes: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StoredModel {
    pub display_name: String,
    pub added_at: DateTime<Utc>,
    #[serde(flatten)]
    pub source: ModelSource,
}

impl StoredModel {
    pub fn size_bytes(&self) -> u64 {
        match &self.source {
            ModelSource::Owned { size_bytes, .. } | ModelSource::Linked { size_bytes, .. } => *size_bytes,
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self.source, ModelSource::Linked { .. })
    }

    /// Path or URI the model is addressed by in `delete_model`
    pub fn location(&self) -> String {
        match &self.source {
            ModelSource::Owned { path, .. } => path.to_string_lossy().into_owned(),
            ModelSource::Linked { source_uri, .. } => source_uri.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_with_kind_tag() {
        let model = StoredModel {
            display_name: "phi.gguf".to_string(),
            added_at: Utc::now(),
            source: ModelSource::Linked {
                source_uri: "/sdcard/phi.gguf".to_string(),
                size_bytes: 10,
            },
        };

        let json = serde_json::to_value(&model).unwrap();
        assert_eq!(json["kind"], "linked");
        assert_eq!(json["sourceUri"], "/sdcard/phi.gguf");
        assert_eq!(json["sizeBytes"], 10);
        assert_eq!(json["displayName"], "phi.gguf");
        assert_eq!(model.location(), "/sdcard/phi.gguf");
        assert!(model.is_linked());
    }
}
