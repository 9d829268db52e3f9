//! Application configuration.
//!
//! Sources, lowest priority first: built-in defaults, the TOML file, and
//! `PAPERPAL_`-prefixed environment variables with `__` separating sections
//! (`PAPERPAL_PROVIDER__MODEL=gpt-4o`).

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::compare::ComparisonConfig;
use crate::discuss::DiscussionConfig;
use crate::embedding::EmbeddingSettings;
use crate::extraction::ExtractionConfig;
use crate::generate::GenerationConfig;
use crate::merge::MergeConfig;
use crate::provider::retry::RetryPolicy;
use crate::provider::ProviderSettings;
use crate::query::DEFAULT_LIMIT;
use crate::segmenter::SegmenterConfig;
use crate::store::StoreConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "PAPERPAL_";

const APP_DIR: &str = "paper-pal";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Every configurable section of the application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderSettings,
    pub embedding: EmbeddingSettings,
    pub segmenter: SegmenterConfig,
    pub extraction: ExtractionConfig,
    pub retry: RetryPolicy,
    pub merge: MergeConfig,
    pub store: StoreConfig,
    pub discussion: DiscussionConfig,
    pub comparison: ComparisonConfig,
    pub generation: GenerationConfig,

    /// SQLite database file; defaults to the user data directory
    pub db_path: Option<PathBuf>,

    /// Default number of search results
    pub search_results: Option<usize>,
}

impl AppConfig {
    /// Load configuration from `path` (or the user config file when `None`)
    /// and the environment.
    ///
    /// # Errors
    /// Returns `ConfigError::NotFound` when an explicit `path` does not exist,
    /// `ConfigError::Load` for malformed values, and `ConfigError::Invalid`
    /// when a value is out of range
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut figment = Figment::new();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::NotFound(path.to_path_buf()));
                }
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(user_config) = default_config_file().filter(|p| p.exists()) {
                    debug!(path = %user_config.display(), "Using user config file");
                    figment = figment.merge(Toml::file(user_config));
                }
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        config.inherit_request_timeout();
        Ok(config)
    }

    /// Give every model-calling component without its own deadline the
    /// provider's `request_timeout_secs`.
    pub fn inherit_request_timeout(&mut self) {
        let secs = self.provider.request_timeout_secs;
        for slot in [
            &mut self.extraction.request_timeout_secs,
            &mut self.comparison.request_timeout_secs,
            &mut self.discussion.request_timeout_secs,
            &mut self.generation.request_timeout_secs,
        ] {
            slot.get_or_insert(secs);
        }
    }

    /// Reject values the components cannot work with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.comparison.max_papers < 2 {
            return Err(ConfigError::Invalid(
                "comparison.max_papers must be at least 2".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.store.fuzzy_threshold) {
            return Err(ConfigError::Invalid(
                "store.fuzzy_threshold must be between 0 and 1".to_string(),
            ));
        }
        if let Some(threshold) = self.merge.fuzzy_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(ConfigError::Invalid(
                    "merge.fuzzy_threshold must be between 0 and 1".to_string(),
                ));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.extraction.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "extraction.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.search_results == Some(0) {
            return Err(ConfigError::Invalid("search_results must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Database file to open.
    pub fn database_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
                .join("papers.db")
        })
    }

    pub fn search_limit(&self) -> usize {
        self.search_results.unwrap_or(DEFAULT_LIMIT)
    }
}

/// `<config dir>/paper-pal/config.toml`, when the platform has a config dir.
pub fn default_config_file() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderKind;
    use figment::Jail;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.search_limit(), 5);
        assert_eq!(config.comparison.max_papers, 5);
        assert_eq!(config.store.fuzzy_threshold, 0.75);
        assert!(config.database_path().ends_with("paper-pal/papers.db"));
    }

    #[test]
    fn test_file_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "paperpal.toml",
                r#"
                db_path = "/tmp/papers.db"

                [provider]
                kind = "gemini"
                model = "gemini-1.5-pro"

                [retry]
                max_attempts = 5
                "#,
            )?;
            jail.set_env("PAPERPAL_PROVIDER__MODEL", "gemini-2.0-flash");
            jail.set_env("PAPERPAL_COMPARISON__MAX_PAPERS", "3");

            let config = AppConfig::load(Some(Path::new("paperpal.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.provider.kind, ProviderKind::Gemini);
            assert_eq!(config.provider.model, "gemini-2.0-flash");
            assert_eq!(config.retry.max_attempts, 5);
            assert_eq!(config.comparison.max_papers, 3);
            assert_eq!(config.database_path(), PathBuf::from("/tmp/papers.db"));
            // untouched sections keep their defaults
            assert_eq!(
                config.extraction,
                ExtractionConfig {
                    request_timeout_secs: Some(config.provider.request_timeout_secs),
                    ..ExtractionConfig::default()
                }
            );
            Ok(())
        });
    }

    #[test]
    fn test_provider_timeout_is_the_default_deadline() {
        Jail::expect_with(|jail| {
            jail.create_file("paperpal.toml", "[comparison]\nrequest_timeout_secs = 90\n")?;
            jail.set_env("PAPERPAL_PROVIDER__REQUEST_TIMEOUT_SECS", "15");

            let config = AppConfig::load(Some(Path::new("paperpal.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.provider.request_timeout_secs, 15);
            assert_eq!(config.extraction.request_timeout(), Duration::from_secs(15));
            assert_eq!(config.discussion.request_timeout_secs, Some(15));
            assert_eq!(config.generation.request_timeout_secs, Some(15));
            // an explicit component value wins
            assert_eq!(config.comparison.request_timeout_secs, Some(90));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file() {
        let result = AppConfig::load(Some(Path::new("/definitely/not/here.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.toml", "[comparison]\nmax_papers = 1\n")?;
            let result = AppConfig::load(Some(Path::new("bad.toml")));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));

            jail.create_file("malformed.toml", "[retry]\nmax_attempts = \"many\"\n")?;
            let result = AppConfig::load(Some(Path::new("malformed.toml")));
            assert!(matches!(result, Err(ConfigError::Load(_))));
            Ok(())
        });
    }
}
