//! Extension tunables.
//!
//! Resolution chain: environment variable > config file > default. The
//! environment is the one the harness captured, not the process's own, so
//! a test run can be configured without touching global state.
//!
//! ```toml
//! # ~/.config/xk6-output-plugin/config.toml
//! flush_on_stop = true
//! start_timeout_secs = 30
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::launcher::LaunchOptions;

/// Explicit config file location. A missing file here is an error.
pub const ENV_CONFIG: &str = "XK6_OUTPUT_PLUGIN_CONFIG";
pub const ENV_FLUSH_ON_STOP: &str = "XK6_OUTPUT_PLUGIN_FLUSH_ON_STOP";
/// Start timeout in whole seconds.
pub const ENV_START_TIMEOUT: &str = "XK6_OUTPUT_PLUGIN_START_TIMEOUT";

const APP_DIR: &str = "xk6-output-plugin";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtensionConfig {
    /// Flush period used when the plugin asks for 0.
    pub default_buffering_ms: u64,
    /// Periods below this are honored but logged as a warning.
    pub min_buffering_ms: u64,
    /// Run one last flush before stopping the plugin.
    pub flush_on_stop: bool,
    pub start_timeout_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for ExtensionConfig {
    fn default() -> Self {
        Self {
            default_buffering_ms: 1000,
            min_buffering_ms: 200,
            flush_on_stop: false,
            start_timeout_secs: 60,
            stop_grace_secs: 5,
        }
    }
}

/// Flush period chosen for a plugin's requested buffering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferingPeriod {
    pub period: Duration,
    pub below_floor: bool,
}

/// `$XDG_CONFIG_HOME/xk6-output-plugin` or `~/.config/xk6-output-plugin`.
pub fn config_dir(env: &HashMap<String, String>) -> PathBuf {
    if let Some(xdg) = env.get("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(xdg).join(APP_DIR);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join(APP_DIR)
}

pub fn config_path(env: &HashMap<String, String>) -> PathBuf {
    config_dir(env).join("config.toml")
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

impl ExtensionConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the configuration from `env`, the config file and defaults.
    pub fn resolve(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = if let Some(explicit) = env.get(ENV_CONFIG) {
            Self::load(Path::new(explicit))?
        } else {
            let path = config_path(env);
            if path.is_file() {
                Self::load(&path)?
            } else {
                Self::default()
            }
        };

        if let Some(value) = env.get(ENV_FLUSH_ON_STOP) {
            config.flush_on_stop = parse_bool(ENV_FLUSH_ON_STOP, value)?;
        }
        if let Some(value) = env.get(ENV_START_TIMEOUT) {
            config.start_timeout_secs =
                value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnv {
                        var: ENV_START_TIMEOUT,
                        value: value.clone(),
                    })?;
        }

        Ok(config)
    }

    /// Map a plugin's requested buffering (ms) to the flush period. `0`
    /// selects the default; values below the floor are used unchanged.
    pub fn buffering_period(&self, requested_ms: u32) -> BufferingPeriod {
        let ms = if requested_ms == 0 {
            self.default_buffering_ms
        } else {
            u64::from(requested_ms)
        };
        BufferingPeriod {
            period: Duration::from_millis(ms),
            below_floor: ms < self.min_buffering_ms,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            start_timeout: Duration::from_secs(self.start_timeout_secs),
            stop_grace: self.stop_grace(),
            ..LaunchOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn zero_buffering_uses_default() {
        let period = ExtensionConfig::default().buffering_period(0);
        assert_eq!(period.period, Duration::from_millis(1000));
        assert!(!period.below_floor);
    }

    #[test]
    fn low_buffering_is_flagged_but_kept() {
        let period = ExtensionConfig::default().buffering_period(50);
        assert_eq!(period.period, Duration::from_millis(50));
        assert!(period.below_floor);
    }

    #[test]
    fn floor_itself_is_not_below_floor() {
        let period = ExtensionConfig::default().buffering_period(200);
        assert_eq!(period.period, Duration::from_millis(200));
        assert!(!period.below_floor);
    }

    #[test]
    fn resolve_without_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let xdg = tmp.path().display().to_string();
        let config = ExtensionConfig::resolve(&env(&[("XDG_CONFIG_HOME", &xdg)])).unwrap();
        assert_eq!(config, ExtensionConfig::default());
    }

    #[test]
    fn resolve_reads_xdg_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(APP_DIR);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.toml"),
            "flush_on_stop = true\nstart_timeout_secs = 15\n",
        )
        .unwrap();

        let xdg = tmp.path().display().to_string();
        let config = ExtensionConfig::resolve(&env(&[("XDG_CONFIG_HOME", &xdg)])).unwrap();
        assert!(config.flush_on_stop);
        assert_eq!(config.start_timeout_secs, 15);
        assert_eq!(config.default_buffering_ms, 1000);
    }

    #[test]
    fn env_overrides_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("custom.toml");
        std::fs::write(&path, "flush_on_stop = true\nstart_timeout_secs = 15\n").unwrap();

        let path = path.display().to_string();
        let config = ExtensionConfig::resolve(&env(&[
            (ENV_CONFIG, &path),
            (ENV_FLUSH_ON_STOP, "off"),
            (ENV_START_TIMEOUT, "3"),
        ]))
        .unwrap();
        assert!(!config.flush_on_stop);
        assert_eq!(config.start_timeout_secs, 3);
        assert_eq!(config.launch_options().start_timeout, Duration::from_secs(3));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.toml").display().to_string();
        let err = ExtensionConfig::resolve(&env(&[(ENV_CONFIG, &path)])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }), "{err}");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "flush_on_exit = true\n").unwrap();
        let err = ExtensionConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "{err}");
    }

    #[test]
    fn invalid_env_values_are_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let xdg = tmp.path().display().to_string();
        let err = ExtensionConfig::resolve(&env(&[
            ("XDG_CONFIG_HOME", &xdg),
            (ENV_FLUSH_ON_STOP, "maybe"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnv { var: ENV_FLUSH_ON_STOP, .. }),
            "{err}"
        );

        let err = ExtensionConfig::resolve(&env(&[
            ("XDG_CONFIG_HOME", &xdg),
            (ENV_START_TIMEOUT, "soon"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnv { var: ENV_START_TIMEOUT, .. }),
            "{err}"
        );
    }
}
