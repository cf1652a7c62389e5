use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::{SwrError, SwrResult};

/// Tunables shared by every engine call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest retirement precomputed by the baseline table.
    pub max_duration_years: u32,
    /// Upper bound on a re-retire salary as a fraction of the current balance.
    pub salary_cap: f64,
    /// Opening balance for table searches and virtual retirements.
    pub normalized_balance: f64,
    /// The rate solver gives up with a numeric error above this rate.
    pub rate_ceiling_bp: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_duration_years: 60,
            salary_cap: 0.20,
            normalized_balance: 1e6,
            rate_ceiling_bp: 1_000_000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> SwrResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SwrError::Config(format!("can't read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| SwrError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SwrResult<()> {
        if self.max_duration_years == 0 {
            return Err(SwrError::Config("max_duration_years must be > 0".to_string()));
        }
        if !self.salary_cap.is_finite() || self.salary_cap <= 0.0 {
            return Err(SwrError::Config("salary_cap must be > 0".to_string()));
        }
        if !self.normalized_balance.is_finite() || self.normalized_balance <= 0.0 {
            return Err(SwrError::Config("normalized_balance must be > 0".to_string()));
        }
        if self.rate_ceiling_bp < 2 {
            return Err(SwrError::Config("rate_ceiling_bp must be >= 2".to_string()));
        }
        Ok(())
    }
}
