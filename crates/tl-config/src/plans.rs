use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Plan tier -> token quota mapping supplied by billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlansConfig {
    #[serde(default = "default_tier")]
    pub default_tier: String,
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, i64>,
}

fn default_tier() -> String {
    "standard".to_string()
}

fn default_tiers() -> BTreeMap<String, i64> {
    BTreeMap::from([
        ("free".to_string(), 180_000),
        ("standard".to_string(), 3_000_000),
        ("pro".to_string(), 10_000_000),
    ])
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            default_tier: default_tier(),
            tiers: default_tiers(),
        }
    }
}

impl PlansConfig {
    /// Token limit for `tier`, or for the default tier when `tier` is
    /// missing. `None` for a tier that is not configured.
    pub fn limit_for(&self, tier: Option<&str>) -> Option<i64> {
        let tier = tier.unwrap_or(&self.default_tier);
        self.tiers.get(tier).copied()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.tiers.contains_key(&self.default_tier) {
            anyhow::bail!(
                "plans.default_tier {:?} is not listed in plans.tiers",
                self.default_tier
            );
        }
        if let Some((tier, limit)) = self.tiers.iter().find(|(_, limit)| **limit < 0) {
            anyhow::bail!("plans.tiers.{} must not be negative (got {})", tier, limit);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdsConfig {
    #[serde(default = "default_warning_percent")]
    pub warning_percent: f64,
    #[serde(default = "default_critical_percent")]
    pub critical_percent: f64,
}

fn default_warning_percent() -> f64 {
    80.0
}

fn default_critical_percent() -> f64 {
    95.0
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            warning_percent: default_warning_percent(),
            critical_percent: default_critical_percent(),
        }
    }
}

impl ThresholdsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.warning_percent > 0.0
            && self.warning_percent < self.critical_percent
            && self.critical_percent <= 100.0)
        {
            anyhow::bail!(
                "thresholds must satisfy 0 < warning_percent < critical_percent <= 100 \
                 (got {} / {})",
                self.warning_percent,
                self.critical_percent
            );
        }
        Ok(())
    }
}
