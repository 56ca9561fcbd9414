use serde::{Deserialize, Serialize};
use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use crate::paths::ConfigPaths;
use crate::plans::{PlansConfig, ThresholdsConfig};
use crate::sweep::SweepConfig;

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    9480
}

fn default_api_token() -> Option<String> {
    env::var("TALLY_API_TOKEN")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Overrides `~/.tally/usage.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Bearer token required on account and job routes when set.
    #[serde(default = "default_api_token", skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(skip)]
    paths: Option<ConfigPaths>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database_path: None,
            api_token: default_api_token(),
            plans: PlansConfig::default(),
            thresholds: ThresholdsConfig::default(),
            sweep: SweepConfig::default(),
            paths: None,
        }
    }
}

impl DaemonConfig {
    /// Returns the `ConfigPaths` for this config. If paths haven't been set,
    /// creates the default paths (may fail if `$HOME` is unset).
    pub fn paths(&self) -> anyhow::Result<ConfigPaths> {
        match &self.paths {
            Some(p) => Ok(p.clone()),
            None => ConfigPaths::new(),
        }
    }

    /// Set a custom `ConfigPaths` (useful for testing or multi-instance).
    pub fn set_paths(&mut self, paths: ConfigPaths) {
        self.paths = Some(paths);
    }

    /// Load config from the default location (`~/.tally/config.toml`).
    pub fn load() -> anyhow::Result<Self> {
        let paths = ConfigPaths::new()?;
        Self::load_from(&paths)
    }

    /// Load config from a specific `ConfigPaths`.
    pub fn load_from(paths: &ConfigPaths) -> anyhow::Result<Self> {
        let config_file = paths.config_path();
        let mut config = if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            config
        } else {
            Self::default()
        };
        config.paths = Some(paths.clone());
        config.validate()?;
        Ok(config)
    }

    /// Validate config values. Called automatically by `load` / `load_from`.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must not be 0");
        }
        if self.api_token.as_deref() == Some("") {
            anyhow::bail!("api_token must not be empty when set");
        }
        if self.sweep.interval_secs == 0 {
            anyhow::bail!("sweep.interval_secs must be greater than 0");
        }
        if self.sweep.max_in_flight_age_secs == 0 {
            anyhow::bail!("sweep.max_in_flight_age_secs must be greater than 0");
        }
        self.plans.validate()?;
        self.thresholds.validate()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolved database location: the explicit setting, else the default
    /// file under the config directory.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.paths()?.database_path()),
        }
    }
}
