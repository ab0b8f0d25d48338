use crate::error::{DispatchError, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Dispatch tunables that do not change a kernel's identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Compute units on the target device, used by the split-KV heuristic.
    pub num_compute_units: u32,
    /// Upper bound for the number of KV splits the heuristic may suggest.
    pub max_num_splits: u32,
    /// Warmup launches before timing when a stream requests timing.
    pub cold_niters: u32,
    /// Timed launches averaged into the returned elapsed time.
    pub nrepeat: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            num_compute_units: 304,
            max_num_splits: 16,
            cold_niters: 3,
            nrepeat: 10,
        }
    }
}

impl DispatchConfig {
    pub const ENV_NUM_CU: &'static str = "TILE_DISPATCH_NUM_CU";
    pub const ENV_MAX_SPLITS: &'static str = "TILE_DISPATCH_MAX_SPLITS";
    pub const ENV_COLD_ITERS: &'static str = "TILE_DISPATCH_COLD_ITERS";
    pub const ENV_NREPEAT: &'static str = "TILE_DISPATCH_NREPEAT";

    /// Defaults overridden by any `TILE_DISPATCH_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = read_env(Self::ENV_NUM_CU)? {
            config.num_compute_units = v;
        }
        if let Some(v) = read_env(Self::ENV_MAX_SPLITS)? {
            config.max_num_splits = v;
        }
        if let Some(v) = read_env(Self::ENV_COLD_ITERS)? {
            config.cold_niters = v;
        }
        if let Some(v) = read_env(Self::ENV_NREPEAT)? {
            config.nrepeat = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DispatchError::InvalidArgument(format!("dispatch config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_compute_units == 0 {
            return Err(DispatchError::InvalidArgument(
                "num_compute_units must be positive".into(),
            ));
        }
        if self.max_num_splits == 0 {
            return Err(DispatchError::InvalidArgument(
                "max_num_splits must be positive".into(),
            ));
        }
        if self.nrepeat == 0 {
            return Err(DispatchError::InvalidArgument("nrepeat must be positive".into()));
        }
        Ok(())
    }
}

fn read_env<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DispatchError::InvalidArgument(format!("{}='{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Process-wide configuration, set once.
static GLOBAL_CONFIG: OnceCell<DispatchConfig> = OnceCell::new();

/// Get the global configuration, reading the environment on first use.
///
/// Falls back to defaults if the environment holds unparsable values; use
/// [`init_global_config`] to surface those errors instead.
pub fn global_config() -> &'static DispatchConfig {
    GLOBAL_CONFIG.get_or_init(|| match DispatchConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("ignoring dispatch environment: {}", e);
            DispatchConfig::default()
        }
    })
}

/// Install an explicit global configuration.
///
/// Fails if the configuration was already initialized.
pub fn init_global_config(config: DispatchConfig) -> Result<()> {
    config.validate()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| DispatchError::InvalidArgument("dispatch config already initialized".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sane() {
        let cfg = DispatchConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.max_num_splits >= 1);
    }

    #[test]
    fn test_from_json_partial() {
        let cfg = DispatchConfig::from_json(r#"{"num_compute_units": 80}"#).unwrap();
        assert_eq!(cfg.num_compute_units, 80);
        assert_eq!(cfg.nrepeat, DispatchConfig::default().nrepeat);
    }

    #[test]
    fn test_from_json_rejects_zero() {
        assert!(DispatchConfig::from_json(r#"{"max_num_splits": 0}"#).is_err());
        assert!(DispatchConfig::from_json("not json").is_err());
    }
}
