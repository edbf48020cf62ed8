//! Configuration management with layered loading
//!
//! Precedence (lowest to highest):
//! 1. Compiled defaults
//! 2. Global config: `$XDG_CONFIG_HOME/pricetree/pricetree.toml`
//! 3. Local config: `./.pricetree.toml` (working directory)
//! 4. Environment variables: `PRICETREE_*` prefix, `__` between sections

use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::application::ApplicationError;
use crate::domain::{EvaluationCache, PricingOptions};

/// Money and cache settings used by the pricing aggregator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PricingConfig {
    /// Decimal places for totals and breakdown lines
    pub decimals: u32,
    /// Capacity of the per-request condition cache
    pub cache_capacity: usize,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            decimals: 2,
            cache_capacity: EvaluationCache::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VisibilityConfig {
    /// Treat unrecognized rule operators as satisfied
    pub fail_open: bool,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self { fail_open: true }
    }
}

/// Raw settings for intermediate parsing; `None` means "not specified".
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawSettings {
    pub data_file: Option<PathBuf>,
    pub pricing: RawPricingConfig,
    pub visibility: RawVisibilityConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawPricingConfig {
    pub decimals: Option<u32>,
    pub cache_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawVisibilityConfig {
    pub fail_open: Option<bool>,
}

/// Unified configuration for pricetree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// JSON store used by the CLI (default: ~/.pricetree/store.json)
    pub data_file: PathBuf,
    pub pricing: PricingConfig,
    pub visibility: VisibilityConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_file: default_data_file(),
            pricing: PricingConfig::default(),
            visibility: VisibilityConfig::default(),
        }
    }
}

fn default_data_file() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".pricetree").join("store.json"))
        .unwrap_or_else(|| PathBuf::from("~/.pricetree/store.json"))
}

/// Get the XDG config directory for pricetree.
pub fn global_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "pricetree").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    global_config_dir().map(|dir| dir.join("pricetree.toml"))
}

/// Get the path to the local config file in `dir`.
pub fn local_config_path(dir: &Path) -> PathBuf {
    dir.join(".pricetree.toml")
}

/// Load a TOML file into RawSettings for manual merging.
pub fn load_raw_settings(path: &Path) -> Result<RawSettings, ApplicationError> {
    let content = std::fs::read_to_string(path).map_err(|e| ApplicationError::Config {
        message: format!("read {}: {}", path.display(), e),
    })?;
    toml::from_str(&content).map_err(|e| ApplicationError::Config {
        message: format!("parse {}: {}", path.display(), e),
    })
}

impl Settings {
    /// Options handed to the pricing aggregator.
    pub fn pricing_options(&self) -> PricingOptions {
        PricingOptions {
            decimals: self.pricing.decimals,
            fail_open: self.visibility.fail_open,
        }
    }

    /// Expand `~`, `$VAR` and `${VAR}` in path-like fields.
    ///
    /// Unknown variables leave the path untouched.
    pub(crate) fn expand_paths(&mut self) {
        let raw = self.data_file.to_string_lossy().to_string();
        if let Ok(expanded) = shellexpand::full(&raw) {
            self.data_file = PathBuf::from(expanded.as_ref());
        }
    }

    /// Overlay every specified field onto self.
    pub fn merge_with(&self, overlay: &RawSettings) -> Self {
        Self {
            data_file: overlay
                .data_file
                .clone()
                .unwrap_or_else(|| self.data_file.clone()),
            pricing: PricingConfig {
                decimals: overlay.pricing.decimals.unwrap_or(self.pricing.decimals),
                cache_capacity: overlay
                    .pricing
                    .cache_capacity
                    .unwrap_or(self.pricing.cache_capacity),
            },
            visibility: VisibilityConfig {
                fail_open: overlay
                    .visibility
                    .fail_open
                    .unwrap_or(self.visibility.fail_open),
            },
        }
    }

    /// Load settings with layered precedence.
    ///
    /// `local_dir` is searched for `.pricetree.toml`; pass `None` to skip
    /// the local layer.
    pub fn load(local_dir: Option<&Path>) -> Result<Self, ApplicationError> {
        let mut current = Self::default();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                let raw = load_raw_settings(&global_path)?;
                current = current.merge_with(&raw);
            }
        }

        if let Some(dir) = local_dir {
            let local_path = local_config_path(dir);
            if local_path.exists() {
                let raw = load_raw_settings(&local_path)?;
                current = current.merge_with(&raw);
            }
        }

        current = Self::apply_env_overrides(current)?;
        current.expand_paths();
        current.validate()?;
        Ok(current)
    }

    /// Apply PRICETREE_* environment variables as explicit overrides.
    fn apply_env_overrides(mut settings: Self) -> Result<Self, ApplicationError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("PRICETREE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(config_err)?;

        if let Ok(val) = config.get_string("data_file") {
            settings.data_file = PathBuf::from(val);
        }
        if let Ok(val) = config.get_string("pricing.decimals") {
            settings.pricing.decimals = parse_env("pricing.decimals", &val)?;
        }
        if let Ok(val) = config.get_string("pricing.cache_capacity") {
            settings.pricing.cache_capacity = parse_env("pricing.cache_capacity", &val)?;
        }
        if let Ok(val) = config.get_string("visibility.fail_open") {
            settings.visibility.fail_open = parse_env("visibility.fail_open", &val)?;
        }
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ApplicationError> {
        if self.pricing.decimals > 10 {
            return Err(ApplicationError::Config {
                message: format!("pricing.decimals must be at most 10, got {}", self.pricing.decimals),
            });
        }
        if self.pricing.cache_capacity == 0 {
            return Err(ApplicationError::Config {
                message: "pricing.cache_capacity must be positive".into(),
            });
        }
        Ok(())
    }

    /// Show the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ApplicationError> {
        toml::to_string_pretty(self).map_err(|e| ApplicationError::Config {
            message: format!("serialize config: {e}"),
        })
    }

    /// Generate a template config file.
    pub fn template() -> String {
        r#"# pricetree configuration
#
# Locations (by precedence, lowest to highest):
#   Global: ~/.config/pricetree/pricetree.toml
#   Local:  ./.pricetree.toml
#   Env:    PRICETREE_* environment variables, e.g. PRICETREE_PRICING__DECIMALS=3

# JSON store used by the command line tool
# data_file = "~/.pricetree/store.json"

[pricing]
# Decimal places for totals and breakdown lines
# decimals = 2

# Entries kept by the per-request condition cache
# cache_capacity = 256

[visibility]
# Unrecognized rule operators count as satisfied (true) or hide the node (false)
# fail_open = true
"#
        .to_string()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ApplicationError> {
    value.trim().parse().map_err(|_| ApplicationError::Config {
        message: format!("invalid value for {key}: {value}"),
    })
}

fn config_err(e: ConfigError) -> ApplicationError {
    ApplicationError::Config {
        message: e.to_string(),
    }
}
