use std::str::FromStr;

use tracing::level_filters::LevelFilter;

pub const LOGGING_LEVEL_VAR: &str = "COSMIAN_PKCS11_LOGGING_LEVEL";
pub const LOG_HOME_VAR: &str = "COSMIAN_PKCS11_LOG_HOME";
pub const DISABLE_LOGGING_VAR: &str = "COSMIAN_PKCS11_DISABLE_LOGGING";

pub const LOG_NAME: &str = "cosmian-pkcs11-objects.log";

/// Module settings, read from the environment when `C_Initialize` is called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleConfig {
    pub logging_level: LevelFilter,
    /// Directory of the log file; `~/.cosmian` when not set.
    pub log_home: Option<String>,
    pub disable_logging: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            logging_level: LevelFilter::INFO,
            log_home: None,
            disable_logging: false,
        }
    }
}

impl ModuleConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from any variable source; unparsable values
    /// fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let default = Self::default();
        let logging_level = lookup(LOGGING_LEVEL_VAR)
            .and_then(|level| LevelFilter::from_str(level.trim()).ok())
            .unwrap_or(default.logging_level);
        let log_home = lookup(LOG_HOME_VAR).filter(|home| !home.trim().is_empty());
        let disable_logging = lookup(DISABLE_LOGGING_VAR)
            .is_some_and(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"));
        Self {
            logging_level,
            log_home,
            disable_logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let empty = ModuleConfig::from_lookup(|_| None);
        assert_eq!(empty, ModuleConfig::default());

        let vars: HashMap<&str, &str> = [
            (LOGGING_LEVEL_VAR, "debug"),
            (LOG_HOME_VAR, "/tmp/pkcs11"),
            (DISABLE_LOGGING_VAR, "TRUE"),
        ]
        .into_iter()
        .collect();
        let config = ModuleConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_owned()));
        assert_eq!(config.logging_level, LevelFilter::DEBUG);
        assert_eq!(config.log_home.as_deref(), Some("/tmp/pkcs11"));
        assert!(config.disable_logging);

        let config = ModuleConfig::from_lookup(|name| {
            (name == LOGGING_LEVEL_VAR).then(|| "verbose".to_owned())
        });
        assert_eq!(config.logging_level, LevelFilter::INFO);
    }
}
