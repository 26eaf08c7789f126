// Database models - External model links
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Registry entry pointing at a model file outside managed storage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalLink {
    /// File name the model is listed under
    pub name: String,
    pub source_uri: String,
    /// Size when last seen
    pub size_bytes: u64,
    pub linked_at: DateTime<Utc>,
}
