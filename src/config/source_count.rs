//! Number of data sources declared for a run.

use super::ConfigError;

/// Environment variable holding the number of additional sources.
pub const NSOURCES_ENV: &str = "RASTERTRAIN_NSOURCES";

/// Source count resolved once, before any bundle is declared.
///
/// The registry always declares one more bundle than the count, so the
/// default of 1 yields an input source and a label source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCount(usize);

impl Default for SourceCount {
    fn default() -> Self {
        Self(1)
    }
}

impl SourceCount {
    pub fn new(count: usize) -> Result<Self, ConfigError> {
        if count == 0 {
            return Err(ConfigError::InvalidSourceCount {
                value: count.to_string(),
            });
        }
        Ok(Self(count))
    }

    /// Prefer an explicit override, then the environment, then the default.
    pub fn resolve(cli_override: Option<usize>) -> Result<Self, ConfigError> {
        match cli_override {
            Some(count) => Self::new(count),
            None => Self::from_env_value(std::env::var(NSOURCES_ENV).ok().as_deref()),
        }
    }

    pub fn from_env_value(value: Option<&str>) -> Result<Self, ConfigError> {
        let Some(raw) = value.map(str::trim).filter(|raw| !raw.is_empty()) else {
            return Ok(Self::default());
        };
        let count = raw
            .parse::<usize>()
            .map_err(|_| ConfigError::InvalidSourceCount {
                value: raw.to_string(),
            })?;
        Self::new(count)
    }

    pub fn get(&self) -> usize {
        self.0
    }

    /// Number of bundles the registry declares.
    pub fn declared_bundles(&self) -> usize {
        self.0 + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_environment_declares_two_bundles() {
        let count = SourceCount::from_env_value(None).unwrap();
        assert_eq!(count.get(), 1);
        assert_eq!(count.declared_bundles(), 2);
        assert_eq!(SourceCount::from_env_value(Some("  ")).unwrap(), count);
    }

    #[test]
    fn environment_value_adds_one_implicit_bundle() {
        let count = SourceCount::from_env_value(Some("3")).unwrap();
        assert_eq!(count.declared_bundles(), 4);
    }

    #[test]
    fn invalid_values_are_configuration_errors() {
        assert!(matches!(
            SourceCount::from_env_value(Some("zero")),
            Err(ConfigError::InvalidSourceCount { .. })
        ));
        assert!(SourceCount::from_env_value(Some("0")).is_err());
        assert!(SourceCount::new(0).is_err());
    }

    #[test]
    fn explicit_override_wins() {
        assert_eq!(SourceCount::resolve(Some(2)).unwrap().declared_bundles(), 3);
    }
}
