//! Pipeline tuning knobs and their environment overrides.

use std::time::Duration;

use crate::entities::resolve::ResolverConfig;
use crate::error::BioQueryError;

pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(20);

const ENV_SOURCE_TIMEOUT: &str = "BIOQUERY_SOURCE_TIMEOUT_SECS";
const ENV_MIN_CONFIDENCE: &str = "BIOQUERY_MIN_CONFIDENCE";
const ENV_AMBIGUITY_MARGIN: &str = "BIOQUERY_AMBIGUITY_MARGIN";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub source_timeout: Duration,
    pub resolver: ResolverConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            source_timeout: DEFAULT_SOURCE_TIMEOUT,
            resolver: ResolverConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, BioQueryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BioQueryError> {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<f64>(&lookup, ENV_SOURCE_TIMEOUT)? {
            config.source_timeout = timeout_from_secs(secs)?;
        }
        if let Some(value) = parse_var(&lookup, ENV_MIN_CONFIDENCE)? {
            config.resolver.min_confidence = value;
        }
        if let Some(value) = parse_var(&lookup, ENV_AMBIGUITY_MARGIN)? {
            config.resolver.ambiguity_margin = value;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Result<Self, BioQueryError> {
        self.source_timeout = timeout_from_secs(secs)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), BioQueryError> {
        if self.source_timeout.is_zero() {
            return Err(BioQueryError::InvalidArgument(
                "Source timeout must be greater than zero".into(),
            ));
        }
        self.resolver.validate()
    }
}

fn timeout_from_secs(secs: f64) -> Result<Duration, BioQueryError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(BioQueryError::InvalidArgument(format!(
            "Source timeout must be a positive number of seconds, got {secs}"
        )));
    }
    Duration::try_from_secs_f64(secs).map_err(|_| {
        BioQueryError::InvalidArgument(format!("Source timeout of {secs} seconds is too large"))
    })
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, BioQueryError> {
    let Some(raw) = lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };
    raw.parse::<T>().map(Some).map_err(|_| {
        BioQueryError::InvalidArgument(format!("{key} has an invalid value: '{raw}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.source_timeout, Duration::from_secs(20));
        assert_eq!(config.resolver.min_confidence, 0.5);
    }

    #[test]
    fn environment_overrides_are_parsed() {
        let config = PipelineConfig::from_lookup(lookup(&[
            (ENV_SOURCE_TIMEOUT, "2.5"),
            (ENV_MIN_CONFIDENCE, "0.7"),
            (ENV_AMBIGUITY_MARGIN, " 0.1 "),
        ]))
        .unwrap();
        assert_eq!(config.source_timeout, Duration::from_millis(2500));
        assert_eq!(config.resolver.min_confidence, 0.7);
        assert_eq!(config.resolver.ambiguity_margin, 0.1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = PipelineConfig::from_lookup(lookup(&[(ENV_SOURCE_TIMEOUT, "soon")])).unwrap_err();
        assert!(err.to_string().contains(ENV_SOURCE_TIMEOUT));

        assert!(PipelineConfig::from_lookup(lookup(&[(ENV_SOURCE_TIMEOUT, "0")])).is_err());
        assert!(PipelineConfig::from_lookup(lookup(&[(ENV_MIN_CONFIDENCE, "1.5")])).is_err());
        assert!(PipelineConfig::default().with_timeout_secs(-1.0).is_err());
    }

    #[test]
    fn oversized_timeout_is_an_error_not_a_panic() {
        let err = PipelineConfig::default()
            .with_timeout_secs(1e20)
            .unwrap_err();
        assert!(matches!(err, BioQueryError::InvalidArgument(_)));
        assert!(err.to_string().contains("too large"));

        assert!(PipelineConfig::from_lookup(lookup(&[(ENV_SOURCE_TIMEOUT, "1e20")])).is_err());
        let config = PipelineConfig::default().with_timeout_secs(3600.0).unwrap();
        assert_eq!(config.source_timeout, Duration::from_secs(3600));
    }
}
