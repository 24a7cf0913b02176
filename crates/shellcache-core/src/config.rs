//! Configuration for a deployed version.
//!
//! `WorkerConfig` is everything a worker instance is built from. The version
//! string names the cache generation; it is fixed per deploy and every store
//! name and garbage-collection decision derives from it.
//!
//! `Config` is the on-disk form used by the CLI, stored at
//! `~/.config/shellcache/config.json` unless `SHELLCACHE_CONFIG` points
//! elsewhere.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheStorage;
use crate::network::client::DEFAULT_TIMEOUT_SECS;
use crate::worker::WorkerError;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "shellcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the config file location
const CONFIG_ENV: &str = "SHELLCACHE_CONFIG";

/// Cache generation baked in at build time, if the build set one.
const BUILD_VERSION: Option<&str> = option_env!("SHELLCACHE_CACHE_VERSION");

const DEFAULT_VERSION: &str = "v1";
const DEFAULT_ORIGIN: &str = "http://localhost:8080/";
const DEFAULT_SHELL_KEY: &str = "/__app_shell__";
const DEFAULT_FALLBACK_KEY: &str = "/";
const DEFAULT_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    "/manifest.json",
    "/icon-192.png",
    "/icon-512.png",
];

fn default_version() -> String {
    BUILD_VERSION.unwrap_or(DEFAULT_VERSION).to_string()
}

fn default_origin() -> Url {
    Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL")
}

fn default_manifest() -> Vec<String> {
    DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect()
}

fn default_shell_key() -> String {
    DEFAULT_SHELL_KEY.to_string()
}

fn default_fallback_key() -> String {
    DEFAULT_FALLBACK_KEY.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Cache generation name. Bumped on every deploy.
    #[serde(default = "default_version")]
    pub version: String,
    /// The worker's own origin; assets resolve against it.
    #[serde(default = "default_origin")]
    pub origin: Url,
    /// Root-relative paths precached at install.
    #[serde(default = "default_manifest")]
    pub manifest: Vec<String>,
    /// Logical key every navigation response is stored under.
    #[serde(default = "default_shell_key")]
    pub shell_key: String,
    /// Consulted when the shell key was never populated.
    #[serde(default = "default_fallback_key")]
    pub fallback_key: String,
    /// Skip the waiting phase as soon as precache succeeds.
    #[serde(default = "default_true")]
    pub skip_waiting_on_install: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            origin: default_origin(),
            manifest: default_manifest(),
            shell_key: default_shell_key(),
            fallback_key: default_fallback_key(),
            skip_waiting_on_install: true,
        }
    }
}

impl WorkerConfig {
    pub fn new(version: impl Into<String>, origin: Url) -> Self {
        Self {
            version: version.into(),
            origin,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        CacheStorage::validate_name(&self.version)
            .map_err(|_| WorkerError::Config(format!("invalid version name {:?}", self.version)))?;

        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host().is_none() {
            return Err(WorkerError::Config(format!(
                "origin must be an http(s) URL with a host, got {}",
                self.origin
            )));
        }

        let keys = self
            .manifest
            .iter()
            .chain([&self.shell_key, &self.fallback_key]);
        for path in keys {
            if !path.starts_with('/') || path.starts_with("//") {
                return Err(WorkerError::Config(format!(
                    "{:?} is not a root-relative path",
                    path
                )));
            }
        }
        Ok(())
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, WorkerError> {
        self.origin
            .join(path)
            .map_err(|e| WorkerError::Config(format!("cannot resolve {:?}: {}", path, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub worker: WorkerConfig,
    /// Overrides the platform cache directory.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            cache_dir: None,
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.cache_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.manifest.len(), 5);
        assert!(config.skip_waiting_on_install);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let origin = Url::parse("https://app.test/").unwrap();

        let bad_version = WorkerConfig::new("v1/../x", origin.clone());
        assert!(matches!(bad_version.validate(), Err(WorkerError::Config(_))));

        let mut relative = WorkerConfig::new("v1", origin.clone());
        relative.manifest.push("icon.png".to_string());
        assert!(relative.validate().is_err());

        let mut protocol_relative = WorkerConfig::new("v1", origin);
        protocol_relative.shell_key = "//evil.test/".to_string();
        assert!(protocol_relative.validate().is_err());

        let file_origin = WorkerConfig::new("v1", Url::parse("file:///srv/app/").unwrap());
        assert!(file_origin.validate().is_err());
    }

    #[test]
    fn test_resolve_against_origin() {
        let config = WorkerConfig::new("v1", Url::parse("https://app.test/game/").unwrap());
        assert_eq!(
            config.resolve("/icon-512.png").unwrap().as_str(),
            "https://app.test/icon-512.png"
        );
    }

    #[test]
    fn test_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = Config::load_from(&path).unwrap();
        assert_eq!(config.request_timeout_secs, DEFAULT_TIMEOUT_SECS);
        config.worker.version = "v7".to_string();
        config.cache_dir = Some(dir.path().join("cache"));
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.worker.version, "v7");
        assert_eq!(loaded.cache_dir().unwrap(), dir.path().join("cache"));
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"version": "v3", "origin": "https://tiles.example/"}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.worker.version, "v3");
        assert_eq!(config.worker.shell_key, "/__app_shell__");
        assert_eq!(config.worker.manifest, default_manifest());
        assert_eq!(config.request_timeout_secs, 30);
    }
}
