use std::time::Duration;

use chrono_tz::Tz;
use thiserror::Error;
use ulid::Ulid;

use crate::model::ResourceSet;

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Madrid;
pub const DEFAULT_AVAILABILITY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("SESIONES_TIMEZONE: unknown timezone {0:?}")]
    Timezone(String),
    #[error("SESIONES_AVAILABILITY_TIMEOUT_MS: not a millisecond count: {0:?}")]
    Timeout(String),
    #[error("SESIONES_EXEMPT_UNITS: not a ULID: {0:?}")]
    ExemptUnit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Display timezone for every wall-clock string.
    pub timezone: Tz,
    /// Upper bound for a remote availability lookup before degrading to
    /// local-only locks.
    pub availability_timeout: Duration,
    /// Mobile units that never block.
    pub exempt_unit_ids: ResourceSet,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            availability_timeout: Duration::from_millis(DEFAULT_AVAILABILITY_TIMEOUT_MS),
            exempt_unit_ids: ResourceSet::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset variables take their default; set but invalid ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(tz) = lookup("SESIONES_TIMEZONE") {
            config.timezone = tz.trim().parse().map_err(|_| ConfigError::Timezone(tz.clone()))?;
        }
        if let Some(ms) = lookup("SESIONES_AVAILABILITY_TIMEOUT_MS") {
            let ms: u64 = ms.trim().parse().map_err(|_| ConfigError::Timeout(ms.clone()))?;
            config.availability_timeout = Duration::from_millis(ms);
        }
        if let Some(units) = lookup("SESIONES_EXEMPT_UNITS") {
            for raw in units.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let id = Ulid::from_string(raw).map_err(|_| ConfigError::ExemptUnit(raw.to_string()))?;
                config.exempt_unit_ids.insert(id);
            }
        }
        Ok(config)
    }
}
