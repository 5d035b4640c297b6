//! Artifact metadata

use serde::{Deserialize, Serialize};

/// Metadata for a stored code artifact (a tar of the submitter's source
/// tree). The blob itself stays in the store and is only materialized when a
/// job referencing it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub size: u64,
    pub created_at: f64,
}
