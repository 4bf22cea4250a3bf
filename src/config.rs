//! Configuration with layered resolution using figment.
//!
//! Resolution order (highest priority last):
//! 1. Built-in defaults
//! 2. `linkgraph.toml` in the working directory (or an explicit path)
//! 3. Environment variables: `LINKGRAPH_*`
//!
//! ```toml
//! threshold = 0.1
//! score_bias = 0.4
//! poll_interval_ms = 5000
//! max_stalls = 5
//! scoring_workers = 8
//! ```

use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::clustering::DEFAULT_THRESHOLD;
use crate::error::{LinkingResult, ValidationError};
use crate::progress::{PollConfig, DEFAULT_MAX_STALLS, DEFAULT_POLL_INTERVAL};
use crate::runtime::RuntimeConfig;
use crate::weighting::DEFAULT_SCORE_BIAS;

/// Boxed wrapper for figment::Error to reduce Result size on the stack.
#[derive(Debug)]
pub struct ConfigError(Box<figment::Error>);

impl Deref for ConfigError {
    type Target = figment::Error;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self(Box::new(err))
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkingConfig {
    /// Merge threshold; edges at or above it are never merged.
    pub threshold: f64,
    /// Constant added to every model score.
    pub score_bias: f64,
    /// Interval between completion polls, in milliseconds.
    pub poll_interval_ms: u64,
    /// Consecutive polls without progress before a wait gives up.
    pub max_stalls: u32,
    /// Scoring pool size.
    pub scoring_workers: usize,
    /// Clustering pool size.
    pub clustering_workers: usize,
    /// Queue capacity per pool.
    pub queue_capacity: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            threshold: DEFAULT_THRESHOLD,
            score_bias: DEFAULT_SCORE_BIAS,
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(u64::MAX),
            max_stalls: DEFAULT_MAX_STALLS,
            scoring_workers: runtime.scoring_workers,
            clustering_workers: runtime.clustering_workers,
            queue_capacity: runtime.queue_capacity,
        }
    }
}

impl LinkingConfig {
    /// Default config file name, looked up in the working directory.
    pub const FILE_NAME: &'static str = "linkgraph.toml";

    /// Prefix of environment overrides.
    pub const ENV_PREFIX: &'static str = "LINKGRAPH_";

    /// Loads defaults, `linkgraph.toml` and `LINKGRAPH_*` overrides, then validates.
    ///
    /// # Errors
    /// `Config` if a source cannot be parsed, `Validation` if a value is out of range.
    pub fn load() -> LinkingResult<Self> {
        Self::from_figment(Self::layered(Toml::file(Self::FILE_NAME)))
    }

    /// Like [`LinkingConfig::load`], reading the TOML layer from `path`.
    ///
    /// # Errors
    /// `Config` if a source cannot be parsed, `Validation` if a value is out of range.
    pub fn load_from(path: impl AsRef<Path>) -> LinkingResult<Self> {
        Self::from_figment(Self::layered(Toml::file(path.as_ref())))
    }

    /// Extracts and validates a config from a caller-supplied figment.
    ///
    /// # Errors
    /// `Config` if extraction fails, `Validation` if a value is out of range.
    pub fn from_figment(figment: Figment) -> LinkingResult<Self> {
        let config: Self = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    fn layered(file: figment::providers::Data<Toml>) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(file)
            .merge(Env::prefixed(Self::ENV_PREFIX))
    }

    /// Checks value ranges.
    ///
    /// # Errors
    /// The first out-of-range value found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            return Err(ValidationError::InvalidThreshold {
                value: self.threshold,
            });
        }
        if !self.score_bias.is_finite() || self.score_bias < 0.0 {
            return Err(ValidationError::InvalidBias {
                value: self.score_bias,
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::ZeroPollInterval);
        }
        if self.max_stalls == 0 {
            return Err(ValidationError::ZeroMaxStalls);
        }
        Ok(())
    }

    /// Polling parameters for completion waits.
    #[must_use]
    pub const fn poll_config(&self) -> PollConfig {
        PollConfig {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_stalls: self.max_stalls,
        }
    }

    /// Worker pool sizing.
    #[must_use]
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            scoring_workers: self.scoring_workers,
            clustering_workers: self.clustering_workers,
            queue_capacity: self.queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::LinkingError;

    #[test]
    fn defaults_match_documented_values() {
        let config = LinkingConfig::default();
        assert!((config.threshold - 0.1).abs() < f64::EPSILON);
        assert!((config.score_bias - 0.4).abs() < f64::EPSILON);
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.max_stalls, 5);
        assert_eq!(config.poll_config(), PollConfig::default());
        config.validate().unwrap();
    }

    #[test]
    fn toml_layer_overrides_defaults() {
        let figment = Figment::from(Serialized::defaults(LinkingConfig::default())).merge(
            Toml::string(
                r"
                threshold = 0.25
                max_stalls = 3
                scoring_workers = 16
                ",
            ),
        );
        let config = LinkingConfig::from_figment(figment).unwrap();
        assert!((config.threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.max_stalls, 3);
        assert_eq!(config.runtime_config().scoring_workers, 16);
        assert!((config.score_bias - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "poll_interval_ms = 250\nscore_bias = 0.0\n").unwrap();

        let config = LinkingConfig::load_from(&path).unwrap();
        assert_eq!(config.poll_config().interval, Duration::from_millis(250));
        assert!(config.score_bias.abs() < f64::EPSILON);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LinkingConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.max_stalls, LinkingConfig::default().max_stalls);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let figment = Figment::from(Serialized::defaults(LinkingConfig::default()))
            .merge(Toml::string("threshold = 0.0"));
        let err = LinkingConfig::from_figment(figment).unwrap_err();
        assert!(matches!(
            err,
            LinkingError::Validation(ValidationError::InvalidThreshold { .. })
        ));

        let figment = Figment::from(Serialized::defaults(LinkingConfig::default()))
            .merge(Toml::string("max_stalls = 0"));
        assert!(matches!(
            LinkingConfig::from_figment(figment),
            Err(LinkingError::Validation(ValidationError::ZeroMaxStalls))
        ));
    }

    #[test]
    fn malformed_source_is_a_config_error() {
        let figment = Figment::from(Serialized::defaults(LinkingConfig::default()))
            .merge(Toml::string("threshold = \"high\""));
        let err = LinkingConfig::from_figment(figment).unwrap_err();
        assert!(matches!(err, LinkingError::Config(_)));
    }
}
