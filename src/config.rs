//! Settings loading using Figment.
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `BEAMLINE_DAQ_`, sections separated
//!    by a double underscore
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use beamline_daq::config::Settings;
//!
//! // BEAMLINE_DAQ_DAQ__PLATFORM=2 overrides [daq] platform
//! let settings = Settings::load_from("config/daq.toml")?;
//! settings.validate()?;
//! println!("DAQ platform: {}", settings.daq.platform);
//! # Ok::<(), beamline_daq::error::DaqError>(())
//! ```

use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::daq::DaqMode;
use crate::error::{DaqError, DaqResult};
use crate::logging::{parse_log_level, OutputFormat};

/// Default settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BEAMLINE_DAQ_";

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Run coordinator settings
    #[serde(default)]
    pub daq: DaqSettings,
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Run coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqSettings {
    /// Device name
    #[serde(default = "default_name")]
    pub name: String,
    /// DAQ platform number
    #[serde(default)]
    pub platform: u32,
    /// Host the control session binds to; the local host name when unset
    #[serde(default)]
    pub host: Option<String>,
    /// How long kickoff waits for the DAQ to become ready, in milliseconds
    #[serde(default = "default_begin_timeout")]
    pub begin_timeout_ms: u64,
    /// Readiness polling increment in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Mode used until a configure call sets one
    #[serde(default)]
    pub default_mode: DaqMode,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_level")]
    pub level: String,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_name() -> String {
    "daq".to_string()
}

fn default_begin_timeout() -> u64 {
    2000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            platform: 0,
            host: None,
            begin_timeout_ms: default_begin_timeout(),
            poll_interval_ms: default_poll_interval(),
            default_mode: DaqMode::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: OutputFormat::default(),
        }
    }
}

impl Settings {
    /// Load from the default file and the environment.
    pub fn load() -> DaqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file is not an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> DaqResult<Self> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(DaqError::from)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> DaqResult<()> {
        parse_log_level(&self.logging.level)?;

        if self.daq.poll_interval_ms == 0 {
            return Err(DaqError::Validation(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.daq.begin_timeout_ms < self.daq.poll_interval_ms {
            return Err(DaqError::Validation(format!(
                "begin_timeout_ms ({}) must be at least one poll interval ({})",
                self.daq.begin_timeout_ms, self.daq.poll_interval_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = write_config(
            r#"
            [daq]
            name = "xpp_daq"
            platform = 1
            host = "daq-xpp-mon01"
            begin_timeout_ms = 3000
            default_mode = "auto"

            [logging]
            level = "debug"
            format = "json"
            "#,
        );
        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.daq.name, "xpp_daq");
        assert_eq!(settings.daq.platform, 1);
        assert_eq!(settings.daq.host.as_deref(), Some("daq-xpp-mon01"));
        assert_eq!(settings.daq.begin_timeout_ms, 3000);
        assert_eq!(settings.daq.poll_interval_ms, 100);
        assert_eq!(settings.daq.default_mode, DaqMode::Auto);
        assert_eq!(settings.logging.format, OutputFormat::Json);
        settings.validate().unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.daq.name, "daq");
        assert_eq!(settings.daq.begin_timeout_ms, 2000);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_timeout_shorter_than_poll() {
        let mut settings = Settings::default();
        settings.daq.begin_timeout_ms = 50;
        assert!(matches!(settings.validate(), Err(DaqError::Validation(_))));
        settings.daq.poll_interval_ms = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bad_mode_fails_to_load() {
        let file = write_config("[daq]\ndefault_mode = \"sometimes\"\n");
        assert!(matches!(
            Settings::load_from(file.path()),
            Err(DaqError::Config(_))
        ));
    }
}
