//! Cache settings
//!
//! Loaded from an optional TOML file layered under `SERENADE_CACHE_*`
//! environment variables (nested keys separated by `__`).

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::{
    category::{resolve, CacheCategory, CachePolicy, PolicyOverrides},
    CacheError, Result,
};

const ENV_PREFIX: &str = "SERENADE_CACHE";
const APP_DIR: &str = "serenade";

/// Tunables for the cache subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// SQLite database for the primary durable engine
    pub database_path: Option<PathBuf>,
    /// Directory for the fallback engine
    pub fallback_dir: Option<PathBuf>,
    pub fallback_quota_bytes: u64,
    pub fallback_compression: bool,
    pub cleanup_interval_secs: u64,
    /// Hard age limit for durable records, independent of category
    pub durable_max_age_secs: u64,
    pub warm_static_on_init: bool,
    /// Per-category policy overrides keyed by category name
    pub categories: HashMap<String, PolicyOverrides>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            fallback_dir: None,
            fallback_quota_bytes: 5 * 1024 * 1024,
            fallback_compression: false,
            cleanup_interval_secs: 60 * 60,
            durable_max_age_secs: 7 * 24 * 60 * 60,
            warm_static_on_init: true,
            categories: HashMap::new(),
        }
    }
}

impl CacheSettings {
    /// Load from `path` (if it exists) and the environment, then validate
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()).required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: CacheSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings rooted in a single directory, for tests and embedded use
    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            database_path: Some(dir.join("cache.sqlite3")),
            fallback_dir: Some(dir.join("fallback")),
            ..Self::default()
        }
    }

    fn default_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| Self::default_root().join("cache.sqlite3"))
    }

    pub fn fallback_dir(&self) -> PathBuf {
        self.fallback_dir
            .clone()
            .unwrap_or_else(|| Self::default_root().join("fallback"))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn durable_max_age(&self) -> Duration {
        Duration::from_secs(self.durable_max_age_secs)
    }

    /// Overrides keyed by category; unknown names are an error
    pub fn category_overrides(&self) -> Result<HashMap<CacheCategory, PolicyOverrides>> {
        self.categories
            .iter()
            .map(|(name, overrides)| Ok((name.parse::<CacheCategory>()?, *overrides)))
            .collect()
    }

    /// Resolved policy for `category` with configured overrides applied
    pub fn policy(&self, category: CacheCategory) -> Result<CachePolicy> {
        let overrides = self
            .category_overrides()?
            .remove(&category)
            .unwrap_or_default();
        resolve(category, &overrides)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cleanup_interval_secs == 0 {
            return Err(CacheError::Config(config::ConfigError::Message(
                "cleanup_interval_secs must be greater than 0".to_string(),
            )));
        }
        let overrides = self.category_overrides()?;
        for category in CacheCategory::ALL {
            resolve(
                category,
                overrides.get(&category).unwrap_or(&PolicyOverrides::default()),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = CacheSettings::default();
        assert_eq!(settings.cleanup_interval(), Duration::from_secs(3600));
        assert_eq!(settings.durable_max_age(), Duration::from_secs(604_800));
        assert_eq!(settings.fallback_quota_bytes, 5 * 1024 * 1024);
        assert!(settings.validate().is_ok());
        assert!(settings.database_path().ends_with("serenade/cache.sqlite3"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.toml");
        std::fs::write(
            &path,
            r#"
fallback_quota_bytes = 2048
cleanup_interval_secs = 60

[categories.realtime]
stale_after_ms = 1000
evict_after_ms = 5000
persist = true
"#,
        )
        .unwrap();

        let settings = CacheSettings::load(Some(&path)).unwrap();
        assert_eq!(settings.fallback_quota_bytes, 2048);
        assert_eq!(settings.cleanup_interval(), Duration::from_secs(60));

        let policy = settings.policy(CacheCategory::Realtime).unwrap();
        assert_eq!(policy.stale_after, Some(Duration::from_secs(1)));
        assert_eq!(policy.evict_after, Some(Duration::from_secs(5)));
        assert!(policy.persist);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = CacheSettings::load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.warm_static_on_init, CacheSettings::default().warm_static_on_init);
    }

    #[test]
    fn test_unknown_category_name_is_rejected() {
        let mut settings = CacheSettings::default();
        settings
            .categories
            .insert("volatile".to_string(), PolicyOverrides::default());
        assert!(matches!(
            settings.validate(),
            Err(CacheError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_inverted_override_is_rejected() {
        let mut settings = CacheSettings::default();
        settings.categories.insert(
            "dynamic".to_string(),
            PolicyOverrides::new()
                .stale_after(Duration::from_secs(100))
                .evict_after(Duration::from_secs(10)),
        );
        assert!(matches!(
            settings.validate(),
            Err(CacheError::InvalidPolicy { .. })
        ));
    }

    #[test]
    fn test_in_dir_paths() {
        let settings = CacheSettings::in_dir("/tmp/serenade-test");
        assert_eq!(
            settings.database_path(),
            PathBuf::from("/tmp/serenade-test/cache.sqlite3")
        );
        assert_eq!(
            settings.fallback_dir(),
            PathBuf::from("/tmp/serenade-test/fallback")
        );
    }
}
