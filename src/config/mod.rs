mod file_config;

pub use file_config::{AggregationConfig, BackgroundJobsConfig, FileConfig, MatchingConfig};

use crate::aggregation::DEFAULT_MAX_ATTEMPTS;
use crate::catalog_store::EntityKind;
use crate::engine::EngineSettings;
use crate::matching::DEFAULT_AUTO_LINK_THRESHOLD;
use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub auto_link_threshold: Option<f64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,

    // Feature configs (with defaults)
    pub matching: MatchingSettings,
    pub aggregation: AggregationSettings,
    pub background_jobs: BackgroundJobsSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchingSettings {
    pub auto_link_threshold: f64,
    pub extra_stop_tokens: Vec<String>,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            auto_link_threshold: DEFAULT_AUTO_LINK_THRESHOLD,
            extra_stop_tokens: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregationSettings {
    pub max_attempts: u32,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJobsSettings {
    pub aggregation_interval_hours: u64,
    pub matching_interval_hours: u64,
    pub matching_kinds: Vec<EntityKind>,
    pub recompute_on_startup: bool,
}

impl Default for BackgroundJobsSettings {
    fn default() -> Self {
        Self {
            aggregation_interval_hours: 24,
            matching_interval_hours: 6,
            matching_kinds: vec![
                EntityKind::Product,
                EntityKind::Variety,
                EntityKind::Country,
                EntityKind::Market,
                EntityKind::PriceStage,
            ],
            recompute_on_startup: false,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        // Validate db_dir exists
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let matching_file = file.matching.unwrap_or_default();
        let auto_link_threshold = matching_file
            .auto_link_threshold
            .or(cli.auto_link_threshold)
            .unwrap_or(DEFAULT_AUTO_LINK_THRESHOLD);
        if !(auto_link_threshold > 0.0 && auto_link_threshold <= 1.0) {
            bail!(
                "auto_link_threshold must be in (0, 1], got {}",
                auto_link_threshold
            );
        }
        let matching = MatchingSettings {
            auto_link_threshold,
            extra_stop_tokens: matching_file.extra_stop_tokens.unwrap_or_default(),
        };

        let max_attempts = file
            .aggregation
            .unwrap_or_default()
            .max_attempts
            .or(cli.max_attempts)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        let aggregation = AggregationSettings { max_attempts };

        let jobs_file = file.background_jobs.unwrap_or_default();
        let defaults = BackgroundJobsSettings::default();
        let matching_kinds = match jobs_file.matching_kinds {
            Some(kinds) => kinds
                .iter()
                .map(|name| parse_entity_kind(name))
                .collect::<Result<Vec<_>>>()?,
            None => defaults.matching_kinds,
        };
        let background_jobs = BackgroundJobsSettings {
            aggregation_interval_hours: jobs_file
                .aggregation_interval_hours
                .unwrap_or(defaults.aggregation_interval_hours),
            matching_interval_hours: jobs_file
                .matching_interval_hours
                .unwrap_or(defaults.matching_interval_hours),
            matching_kinds,
            recompute_on_startup: jobs_file
                .recompute_on_startup
                .unwrap_or(defaults.recompute_on_startup),
        };
        if background_jobs.aggregation_interval_hours == 0
            || background_jobs.matching_interval_hours == 0
        {
            bail!("Background job intervals must be at least one hour");
        }

        Ok(Self {
            db_dir,
            matching,
            aggregation,
            background_jobs,
        })
    }

    pub fn catalog_db_path(&self) -> PathBuf {
        self.db_dir.join("prices.db")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            auto_link_threshold: self.matching.auto_link_threshold,
            extra_stop_tokens: self.matching.extra_stop_tokens.clone(),
            max_attempts: self.aggregation.max_attempts,
        }
    }
}

/// Parses an entity kind name as used in config files ("product", "price_stage"...).
fn parse_entity_kind(s: &str) -> Result<EntityKind> {
    match EntityKind::from_db_str(&s.trim().to_lowercase()) {
        Some(kind) => Ok(kind),
        None => bail!("Unknown entity kind in matching_kinds: {}", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_temp_db_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn test_parse_entity_kind() {
        assert_eq!(parse_entity_kind("product").unwrap(), EntityKind::Product);
        // Case insensitive
        assert_eq!(parse_entity_kind("PRICE_STAGE").unwrap(), EntityKind::PriceStage);
        // Invalid
        assert!(parse_entity_kind("region").is_err());
    }

    #[test]
    fn test_resolve_cli_only() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            auto_link_threshold: Some(0.9),
            max_attempts: Some(2),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.matching.auto_link_threshold, 0.9);
        assert_eq!(config.aggregation.max_attempts, 2);
        assert_eq!(config.background_jobs, BackgroundJobsSettings::default());
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/should/be/overridden")),
            auto_link_threshold: Some(0.9),
            max_attempts: Some(2),
        };

        let file_config = FileConfig {
            db_dir: Some(temp_dir.path().to_string_lossy().to_string()),
            matching: Some(MatchingConfig {
                auto_link_threshold: Some(0.75),
                extra_stop_tokens: Some(vec!["bulk".to_string()]),
            }),
            background_jobs: Some(BackgroundJobsConfig {
                matching_kinds: Some(vec!["product".to_string(), "market".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, Some(file_config)).unwrap();

        // TOML values should override CLI
        assert_eq!(config.db_dir, temp_dir.path());
        assert_eq!(config.matching.auto_link_threshold, 0.75);
        assert_eq!(config.matching.extra_stop_tokens, vec!["bulk".to_string()]);
        assert_eq!(
            config.background_jobs.matching_kinds,
            vec![EntityKind::Product, EntityKind::Market]
        );
        // CLI value used when TOML doesn't specify
        assert_eq!(config.aggregation.max_attempts, 2);
    }

    #[test]
    fn test_resolve_missing_db_dir_error() {
        let cli = CliConfig::default();
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("db_dir must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_db_dir_error() {
        let cli = CliConfig {
            db_dir: Some(PathBuf::from("/nonexistent/path/that/should/not/exist")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_resolve_db_dir_not_directory_error() {
        // Create a temporary file (not a directory)
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let cli = CliConfig {
            db_dir: Some(temp_file.path().to_path_buf()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_resolve_rejects_bad_values() {
        let temp_dir = make_temp_db_dir();
        for cli in [
            CliConfig {
                db_dir: Some(temp_dir.path().to_path_buf()),
                auto_link_threshold: Some(1.5),
                ..Default::default()
            },
            CliConfig {
                db_dir: Some(temp_dir.path().to_path_buf()),
                auto_link_threshold: Some(0.0),
                ..Default::default()
            },
            CliConfig {
                db_dir: Some(temp_dir.path().to_path_buf()),
                max_attempts: Some(0),
                ..Default::default()
            },
        ] {
            assert!(AppConfig::resolve(&cli, None).is_err(), "{:?}", cli);
        }

        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let file_config = FileConfig {
            background_jobs: Some(BackgroundJobsConfig {
                matching_interval_hours: Some(0),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(AppConfig::resolve(&cli, Some(file_config)).is_err());
    }

    #[test]
    fn test_engine_settings_and_db_path() {
        let temp_dir = make_temp_db_dir();
        let cli = CliConfig {
            db_dir: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };

        let config = AppConfig::resolve(&cli, None).unwrap();

        assert_eq!(config.catalog_db_path(), temp_dir.path().join("prices.db"));
        assert_eq!(config.engine_settings(), EngineSettings::default());
    }
}
