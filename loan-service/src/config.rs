use anyhow::{Context, Result};
use loan_flow::{EngineConfig, in_memory::CustomerRecord};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

pub const CONFIG_ENV: &str = "LOAN_SERVICE_CONFIG";

/// Service settings, read from the YAML file named by `LOAN_SERVICE_CONFIG`.
///
/// ```yaml
/// bind_addr: 0.0.0.0:8080
/// engine:
///   run_mode: run_until_input
/// customers:
///   - customer_id: CUST100
///     credit_score: 760
///     pre_approved_limit: 300000
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub bind_addr: String,
    pub engine: EngineConfig,
    /// Customer directory backing the bureau and catalog. Empty means the demo set.
    pub customers: Vec<CustomerRecord>,
    /// Issue this OTP instead of random codes. Meant for demos only.
    pub fixed_otp: Option<String>,
    pub purge_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            engine: EngineConfig::default(),
            customers: Vec::new(),
            fixed_otp: None,
            purge_interval_secs: 60,
        }
    }
}

impl ServiceConfig {
    /// Loads the file named by `LOAN_SERVICE_CONFIG`, or the defaults when it is unset.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_path(&path),
            Err(_) => {
                info!("{CONFIG_ENV} not set, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.engine.validate()?;
        if config.purge_interval_secs == 0 {
            anyhow::bail!("purge_interval_secs must be positive");
        }
        Ok(config)
    }
}
