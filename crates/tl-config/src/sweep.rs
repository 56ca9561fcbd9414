use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Settle pending or processing jobs that went silent as failed. Off by
    /// default: job state normally belongs to the workflow.
    #[serde(default)]
    pub settle_stale_jobs: bool,
    /// Silence after which `settle_stale_jobs` applies.
    #[serde(default = "default_max_in_flight_age_secs")]
    pub max_in_flight_age_secs: u64,
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_in_flight_age_secs() -> u64 {
    7200
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_secs: default_interval_secs(),
            settle_stale_jobs: false,
            max_in_flight_age_secs: default_max_in_flight_age_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_correct() {
        let s = SweepConfig::default();
        assert!(s.enabled);
        assert_eq!(s.interval_secs, 300);
        assert!(!s.settle_stale_jobs);
        assert_eq!(s.max_in_flight_age_secs, 7200);
    }

    #[test]
    fn stale_settlement_is_opt_in() {
        let s: SweepConfig = toml::from_str("settle_stale_jobs = true\n").unwrap();
        assert!(s.settle_stale_jobs);
        assert!(s.enabled);
    }

    #[test]
    fn serde_missing_fields_uses_defaults() {
        let s: SweepConfig = toml::from_str("enabled = false\n").unwrap();
        assert!(!s.enabled);
        assert_eq!(s.interval_secs, 300);
    }
}
