use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,

    // Feature configs
    pub matching: Option<MatchingConfig>,
    pub aggregation: Option<AggregationConfig>,
    pub background_jobs: Option<BackgroundJobsConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MatchingConfig {
    /// Minimum similarity for an automatic link, in (0, 1].
    pub auto_link_threshold: Option<f64>,
    /// Words ignored when comparing names, on top of the built-in list.
    pub extra_stop_tokens: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct AggregationConfig {
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct BackgroundJobsConfig {
    pub aggregation_interval_hours: Option<u64>,
    pub matching_interval_hours: Option<u64>,
    /// Entity kinds the matching job runs over, e.g. `["product", "market"]`.
    pub matching_kinds: Option<Vec<String>>,
    pub recompute_on_startup: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
