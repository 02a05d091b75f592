//! Configuration types for Snare

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::session::PollTiming;
use crate::{Result, SnareError};

/// Rendering backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Deterministic engine replaying a TOML site description
    #[default]
    Scripted,
    /// Headless Chrome (requires the `chrome` feature)
    Chrome,
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine selection
    #[serde(default)]
    pub engine: EngineConfig,
    /// Operation timeouts
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    /// Script poller timing
    #[serde(default)]
    pub poller: PollerConfig,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Which backend to drive
    #[serde(default)]
    pub backend: Backend,
    /// Site description for the scripted backend
    #[serde(default)]
    pub replay_file: Option<PathBuf>,
    /// Run Chrome without a window
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Chrome executable, searched on `PATH` if unset
    #[serde(default)]
    pub chrome_path: Option<PathBuf>,
    /// Extra Chrome command-line arguments
    #[serde(default)]
    pub chrome_args: Vec<String>,
    /// Identity string reported when the engine has none of its own
    #[serde(default)]
    pub default_user_agent: Option<String>,
}

fn default_headless() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            replay_file: None,
            headless: default_headless(),
            chrome_path: None,
            chrome_args: Vec::new(),
            default_user_agent: None,
        }
    }
}

/// Operation timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// Window for URL capture
    pub capture_ms: u64,
    /// Window for VRF token extraction
    pub vrf_ms: u64,
    /// Budget for script evaluation
    pub script_ms: u64,
    /// Extra time granted to teardown beyond an operation's window
    pub guard_margin_ms: u64,
    /// Capture capacity of filtered interception
    pub filter_max_requests: usize,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            capture_ms: 30_000,
            vrf_ms: 15_000,
            script_ms: 10_000,
            guard_margin_ms: 5_000,
            filter_max_requests: 100,
        }
    }
}

impl TimeoutsConfig {
    /// Guard margin as a duration
    #[must_use]
    pub fn guard_margin(&self) -> Duration {
        Duration::from_millis(self.guard_margin_ms)
    }
}

/// Script poller timing, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Pause after the page finished loading before the first evaluation
    pub settle_delay_ms: u64,
    /// Pause between evaluations
    pub poll_interval_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            poll_interval_ms: 300,
        }
    }
}

impl PollerConfig {
    /// Poller timing described by this config
    #[must_use]
    pub fn timing(&self) -> PollTiming {
        PollTiming {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SnareError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| SnareError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.engine.replay_file {
            if !path.exists() {
                return Err(SnareError::ConfigError(format!(
                    "Replay file does not exist: {}",
                    path.display()
                )));
            }
        }

        let timeouts = [
            ("capture_ms", self.timeouts.capture_ms),
            ("vrf_ms", self.timeouts.vrf_ms),
            ("script_ms", self.timeouts.script_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(SnareError::ConfigError(format!(
                    "timeouts.{name} cannot be 0"
                )));
            }
        }

        if self.timeouts.filter_max_requests == 0 {
            return Err(SnareError::ConfigError(
                "timeouts.filter_max_requests cannot be 0".to_string(),
            ));
        }

        if self.poller.poll_interval_ms == 0 {
            return Err(SnareError::ConfigError(
                "poller.poll_interval_ms cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            [engine]
            backend = "chrome"
            chrome_args = ["--disable-gpu"]

            [timeouts]
            vrf_ms = 5000

            [poller]
            poll_interval_ms = 100
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.engine.backend, Backend::Chrome);
        assert!(config.engine.headless);
        assert_eq!(config.engine.chrome_args, vec!["--disable-gpu"]);
        assert_eq!(config.timeouts.vrf_ms, 5000);
        assert_eq!(config.timeouts.capture_ms, 30_000);
        assert_eq!(config.poller.settle_delay_ms, 500);
        assert_eq!(
            config.poller.timing().poll_interval,
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.engine.backend, Backend::Scripted);
        assert_eq!(config.timeouts.script_ms, 10_000);
        assert_eq!(config.timeouts.guard_margin(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut fixture = NamedTempFile::new().unwrap();
        fixture.write_all(b"default_user_agent = \"Replay/1.0\"\n").unwrap();

        let mut file = NamedTempFile::new().unwrap();
        let config_toml = format!(
            "[engine]\nreplay_file = \"{}\"\n",
            fixture.path().display().to_string().replace('\\', "\\\\")
        );
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.engine.replay_file.as_deref(), Some(fixture.path()));
    }

    #[test]
    fn test_invalid_config_zero_timeout() {
        let config_toml = r"
            [timeouts]
            script_ms = 0
        ";

        let config: Config = toml::from_str(config_toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_config_missing_replay_file() {
        let config = Config {
            engine: EngineConfig {
                replay_file: Some("/nonexistent/site.toml".into()),
                ..EngineConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(SnareError::ConfigError(_))));
    }
}
