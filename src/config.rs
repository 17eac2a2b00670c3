use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::{CaptureConfig, EngineConfig};
use crate::error::ConfigError;
use crate::firewall::FirewallConfig;
use crate::ledger::LedgerConfig;
use crate::ml::ModelConfig;
use crate::rules::RulesConfig;

/// Accepted range for the bootstrap sample size
pub const BOOTSTRAP_RANGE: std::ops::RangeInclusive<usize> = 20..=50;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub rules: RulesConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub firewall: FirewallConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/ngfw/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("ngfw/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let bootstrap = self.engine.bootstrap_size;
        if !BOOTSTRAP_RANGE.contains(&bootstrap) {
            return Err(ConfigError::Invalid {
                field: "engine.bootstrap_size",
                reason: format!(
                    "{} is outside {}..={}",
                    bootstrap,
                    BOOTSTRAP_RANGE.start(),
                    BOOTSTRAP_RANGE.end()
                ),
            });
        }
        if bootstrap < self.model.min_samples {
            return Err(ConfigError::Invalid {
                field: "engine.bootstrap_size",
                reason: format!("must be at least model.min_samples ({})", self.model.min_samples),
            });
        }
        if self.ledger.packet_window < bootstrap {
            return Err(ConfigError::Invalid {
                field: "ledger.packet_window",
                reason: format!("must hold the bootstrap sample ({} packets)", bootstrap),
            });
        }
        if self.ledger.threat_window == 0 {
            return Err(ConfigError::Invalid {
                field: "ledger.threat_window",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.ledger.escalation_threshold == 0 {
            return Err(ConfigError::Invalid {
                field: "ledger.escalation_threshold",
                reason: "must be at least 1".to_string(),
            });
        }
        for range in &self.ledger.private_ranges {
            if range.parse::<ipnetwork::IpNetwork>().is_err() {
                return Err(ConfigError::Invalid {
                    field: "ledger.private_ranges",
                    reason: format!("{} is not a CIDR network", range),
                });
            }
        }
        if !(self.model.contamination > 0.0 && self.model.contamination <= 0.5) {
            return Err(ConfigError::Invalid {
                field: "model.contamination",
                reason: format!("{} is outside (0, 0.5]", self.model.contamination),
            });
        }
        if self.model.num_trees == 0 {
            return Err(ConfigError::Invalid {
                field: "model.num_trees",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.rules.min_length > self.rules.max_length {
            return Err(ConfigError::Invalid {
                field: "rules.min_length",
                reason: format!("greater than rules.max_length ({})", self.rules.max_length),
            });
        }
        if self.capture.channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "capture.channel_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.firewall.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "firewall.command_timeout_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
