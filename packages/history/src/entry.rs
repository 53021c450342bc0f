use std::path::PathBuf;

use chrono::{DateTime, Utc};
use comet_fetcher::{Coordinate, Resolution, ResolutionError};
use serde::{Deserialize, Serialize};

/// An entry in the history list.
///
/// `coordinate` is the string the user actually typed, which may be
/// incomplete or mangled; `resolved_artifact` is what we fully resolved it
/// to last time. Carrying the module paths here lets a later launch skip
/// the repository walk entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub coordinate: String,
    #[serde(rename = "last-refresh-time")]
    pub last_refresh_time: DateTime<Utc>,
    #[serde(rename = "resolved-artifact")]
    pub resolved_artifact: String,
    #[serde(rename = "module-path")]
    pub module_paths: Vec<PathBuf>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl HistoryEntry {
    pub fn from_resolution(fragment: &str, resolution: &Resolution) -> Self {
        HistoryEntry {
            coordinate: fragment.to_owned(),
            last_refresh_time: resolution.refresh_time,
            resolved_artifact: resolution.coordinate.to_string(),
            module_paths: resolution.module_paths.clone(),
            name: resolution.name.clone(),
            description: resolution.description.clone(),
        }
    }

    /// Rebuilds a [`Resolution`] from the cached fields. Packaging details
    /// that never made it into the cache (declared entry point, feature
    /// flags) come back empty; the launcher rediscovers them from the
    /// payload itself.
    pub fn as_resolution(&self) -> Result<Resolution, ResolutionError> {
        Ok(Resolution {
            coordinate: Coordinate::parse(&self.resolved_artifact)?,
            name: self.name.clone(),
            description: self.description.clone(),
            entry: None,
            features: Vec::new(),
            module_paths: self.module_paths.clone(),
            refresh_time: self.last_refresh_time,
        })
    }

    /// True only while every module file from the last resolution is still
    /// on disk. Anything less is treated as a cache miss.
    pub fn still_on_disk(&self) -> bool {
        !self.module_paths.is_empty() && self.module_paths.iter().all(|p| p.exists())
    }
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} @ {} ({} modules)",
            self.coordinate,
            self.resolved_artifact,
            self.last_refresh_time,
            self.module_paths.len()
        )
    }
}
