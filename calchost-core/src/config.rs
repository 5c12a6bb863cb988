//! Controller configuration.
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults
//! 2. An explicit config file, or `./calchost.toml` if present
//! 3. Environment variables (`CALCHOST_DEFAULT_MODEL`, `CALCHOST_SLICE_US`,
//!    `CALCHOST_YIELD_MS`)
//!
//! # Config File Format
//!
//! ```toml
//! # calchost.toml
//! slice_us = 10000
//! yield_ms = 10
//! default_model = "83"
//! broadcast = true
//! auto_start = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CalcError, CalcResult};

/// File looked up in the working directory when no path is given.
pub const LOCAL_CONFIG: &str = "calchost.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Emulated microseconds per worker slice.
    pub slice_us: u32,

    /// Wall-clock pause between worker slices, in milliseconds.
    pub yield_ms: u64,

    /// Model used when a ROM's type cannot be detected.
    /// Loading fails if this is unset or names no known model.
    pub default_model: Option<String>,

    /// Emit `BytesAvailable` when device output arrives.
    pub broadcast: bool,

    /// Start the worker after every successful load.
    pub auto_start: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slice_us: 10_000,
            yield_ms: 10,
            default_model: Some("83".to_string()),
            broadcast: true,
            auto_start: true,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// An explicit `path` must exist and parse. The implicit local file is
    /// optional, and a broken one is skipped with a warning.
    pub fn load(path: Option<&Path>) -> CalcResult<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load_local().unwrap_or_default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse a config file.
    pub fn load_from_file(path: &Path) -> CalcResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CalcError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> CalcResult<Self> {
        Ok(toml::from_str(content)?)
    }

    fn load_local() -> Option<Self> {
        let path = Path::new(LOCAL_CONFIG);
        if !path.exists() {
            return None;
        }
        match Self::load_from_file(path) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Ignoring {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup("CALCHOST_DEFAULT_MODEL") {
            log::info!("Using CALCHOST_DEFAULT_MODEL from environment: {}", model);
            self.default_model = if model.is_empty() { None } else { Some(model) };
        }
        if let Some(value) = lookup("CALCHOST_SLICE_US") {
            match value.parse() {
                Ok(slice_us) => self.slice_us = slice_us,
                Err(e) => log::warn!("Ignoring CALCHOST_SLICE_US={}: {}", value, e),
            }
        }
        if let Some(value) = lookup("CALCHOST_YIELD_MS") {
            match value.parse() {
                Ok(yield_ms) => self.yield_ms = yield_ms,
                Err(e) => log::warn!("Ignoring CALCHOST_YIELD_MS={}: {}", value, e),
            }
        }
    }

    /// Generate a sample config file content.
    pub fn sample() -> String {
        r#"# calchost configuration
# Place this file at ./calchost.toml or pass it with --config

# Emulated microseconds per worker slice
slice_us = 10000

# Pause between worker slices, in milliseconds
yield_ms = 10

# Model to assume when a ROM's type cannot be detected
# (82, 83, 83p, 83pse, 85, 86). Remove to make such loads fail.
default_model = "83"

# Notify subscribers when the device sends a byte
broadcast = true

# Start emulating as soon as a ROM is loaded
auto_start = true
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.slice_us, 10_000);
        assert_eq!(config.yield_ms, 10);
        assert_eq!(config.default_model.as_deref(), Some("83"));
        assert!(config.broadcast);
        assert!(config.auto_start);
    }

    #[test]
    fn test_sample_parses_to_defaults() {
        let config = Config::from_toml(&Config::sample()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::from_toml("auto_start = false\nslice_us = 500\n").unwrap();
        assert!(!config.auto_start);
        assert_eq!(config.slice_us, 500);
        assert_eq!(config.yield_ms, 10);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Config::from_toml("slice_us = \"fast\"").unwrap_err();
        assert!(matches!(err, CalcError::Config(_)));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_model = \"86\"").unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.default_model.as_deref(), Some("86"));
    }

    #[test]
    fn test_missing_explicit_file_is_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, CalcError::Open { .. }));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CALCHOST_DEFAULT_MODEL", ""),
            ("CALCHOST_SLICE_US", "2500"),
            ("CALCHOST_YIELD_MS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.default_model, None);
        assert_eq!(config.slice_us, 2500);
        assert_eq!(config.yield_ms, 10);
    }
}
