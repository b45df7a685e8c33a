//! Legacy JSON statistics import
//!
//! Earlier releases persisted a single JSON map of per-user totals.
//! If that file is still present at startup it is imported once into
//! the statistics database; the old format never separated upload and
//! download, so its totals land on the download side.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct LegacyUserStats {
    pub username: String,
    #[serde(default)]
    pub total_bytes: u64,
    #[serde(default = "epoch")]
    pub last_access: DateTime<Utc>,
    #[serde(default)]
    pub requests_count: u64,
    #[serde(default = "epoch")]
    pub connected_since: DateTime<Utc>,
    #[serde(default)]
    pub connection_count: u64,
    #[serde(default)]
    pub disabled: bool,
}

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Load the legacy stats file. A missing file is not an error; a
/// malformed one is, so the caller can log and move on.
pub fn load(path: &str) -> Result<Option<HashMap<String, LegacyUserStats>>> {
    if path.is_empty() || !Path::new(path).exists() {
        return Ok(None);
    }

    let data = std::fs::read_to_string(path)?;
    let users: HashMap<String, LegacyUserStats> = serde_json::from_str(&data)?;
    Ok(Some(users))
}
