//! Engine configuration.
//!
//! Every section has defaults, so a YAML file only needs the values it changes:
//!
//! ```yaml
//! run_mode: run_until_input
//! verification:
//!   max_attempts: 5
//! retry:
//!   timeout_ms: 2000
//! ```

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::{
    collaborators::RetryPolicy,
    eligibility::EligibilityPolicy,
    error::{FlowError, Result},
    offers::{NegotiationPolicy, RateTable},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// One handler per call.
    #[default]
    Step,
    /// Keep running handlers until one waits for input or the session closes.
    RunUntilInput,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationPolicy {
    /// Wrong codes and address denials tolerated before verification fails.
    pub max_attempts: u32,
}

impl Default for VerificationPolicy {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub run_mode: RunMode,
    /// Upper bound on handler calls in one turn when running until input.
    pub max_steps_per_turn: usize,
    pub handler_deadline_ms: u64,
    /// Consecutive timed-out turns at one stage before the handler gives up and the
    /// session is closed.
    pub max_timed_out_turns: u32,
    /// Closed sessions idle for this long are purged.
    pub session_idle_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub verification: VerificationPolicy,
    pub negotiation: NegotiationPolicy,
    pub eligibility: EligibilityPolicy,
    pub rates: RateTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            run_mode: RunMode::default(),
            max_steps_per_turn: 8,
            handler_deadline_ms: 15_000,
            max_timed_out_turns: 3,
            session_idle_timeout_secs: 3_600,
            retry: RetryPolicy::default(),
            verification: VerificationPolicy::default(),
            negotiation: NegotiationPolicy::default(),
            eligibility: EligibilityPolicy::default(),
            rates: RateTable::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn handler_deadline(&self) -> Duration {
        Duration::from_millis(self.handler_deadline_ms)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> Result<()> {
            Err(FlowError::Config(format!("{key}: {message}")))
        }

        if self.max_steps_per_turn == 0 {
            return invalid("max_steps_per_turn", "must be at least 1");
        }
        if self.handler_deadline_ms == 0 || self.retry.timeout_ms == 0 {
            return invalid("deadlines", "timeouts must be positive");
        }
        if self.max_timed_out_turns == 0 {
            return invalid("max_timed_out_turns", "must be at least 1");
        }
        if self.verification.max_attempts == 0 {
            return invalid("verification.max_attempts", "must be at least 1");
        }
        if self.negotiation.max_attempts == 0 {
            return invalid("negotiation.max_attempts", "must be at least 1");
        }
        if self.negotiation.rate_step < 0.0 || self.negotiation.max_discount < 0.0 {
            return invalid("negotiation", "discounts cannot be negative");
        }
        if self.rates.bands.is_empty() {
            return invalid("rates.bands", "at least one rate band is required");
        }
        if self
            .rates
            .bands
            .iter()
            .any(|band| band.tenure_months == 0 || band.annual_rate < 0.0)
        {
            return invalid("rates.bands", "tenures must be positive and rates non-negative");
        }
        let eligibility = &self.eligibility;
        if eligibility.max_limit_multiple < 1.0 {
            return invalid("eligibility.max_limit_multiple", "must be at least 1");
        }
        if !(0.0..=1.0).contains(&eligibility.max_emi_ratio) || eligibility.max_emi_ratio == 0.0 {
            return invalid("eligibility.max_emi_ratio", "must be within (0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.run_mode, RunMode::Step);
        assert_eq!(config.verification.max_attempts, 3);
        assert_eq!(config.negotiation.max_attempts, 3);
        assert_eq!(config.eligibility.min_credit_score, 700);
        assert_eq!(config.max_timed_out_turns, 3);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml_str(
            r#"
run_mode: run_until_input
verification:
  max_attempts: 5
retry:
  timeout_ms: 2000
"#,
        )
        .unwrap();
        assert_eq!(config.run_mode, RunMode::RunUntilInput);
        assert_eq!(config.verification.max_attempts, 5);
        assert_eq!(config.retry.timeout_ms, 2000);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.rates, RateTable::default());
    }

    #[test]
    fn rejects_unusable_values() {
        let err = EngineConfig::from_yaml_str("verification:\n  max_attempts: 0\n").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));

        let err = EngineConfig::from_yaml_str("max_timed_out_turns: 0\n").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));

        let err = EngineConfig::from_yaml_str("rates:\n  bands: []\n").unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));

        let err = EngineConfig::from_yaml_str("run_mode: sideways\n").unwrap_err();
        assert!(matches!(err, FlowError::Yaml(_)));
    }
}
