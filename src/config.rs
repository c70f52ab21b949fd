//! Configuration loading.
//!
//! Defaults come from [`crate::constants`]. An optional JSON file overrides
//! them, `PIXELFLUT_*` environment variables override the file, and CLI
//! flags (applied by `main`) override everything.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::constants;

/// Server configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Host or address to bind.
    pub host: String,
    /// TCP port to bind (0 picks a free port).
    pub port: u16,
    /// Lua behavior definition to load and watch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<PathBuf>,
    /// Initial canvas width.
    pub width: u32,
    /// Initial canvas height.
    pub height: u32,
    /// Render ticks per second.
    pub frame_rate: u32,
    /// Per-session commands per second.
    pub rate_budget: f64,
    /// Per-session commands per second in godmode.
    pub godmode_budget: f64,
    /// Behavior file poll interval in milliseconds.
    pub reload_interval_ms: u64,
    /// Maximum line length in bytes.
    pub max_line_length: usize,
    /// Answer malformed lines with `ERROR: ...`.
    pub reply_errors: bool,
    /// Where `save` without a path writes snapshots.
    pub snapshot_dir: PathBuf,
    /// How long a reconnect waits for the evicted session to close.
    pub eviction_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_HOST.to_string(),
            port: constants::DEFAULT_PORT,
            behavior: None,
            width: constants::DEFAULT_WIDTH,
            height: constants::DEFAULT_HEIGHT,
            frame_rate: constants::DEFAULT_FRAME_RATE,
            rate_budget: constants::DEFAULT_RATE_BUDGET,
            godmode_budget: constants::DEFAULT_GODMODE_BUDGET,
            reload_interval_ms: constants::DEFAULT_RELOAD_INTERVAL.as_millis() as u64,
            max_line_length: constants::DEFAULT_MAX_LINE_LENGTH,
            reply_errors: true,
            snapshot_dir: PathBuf::from(constants::DEFAULT_SNAPSHOT_DIR),
            eviction_timeout_ms: constants::DEFAULT_EVICTION_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load defaults, then the optional config file, then env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` is given but cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PIXELFLUT_HOST") {
            self.host = host;
        }

        if let Ok(port) = std::env::var("PIXELFLUT_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("Ignoring invalid PIXELFLUT_PORT: {port}"),
            }
        }

        if let Ok(behavior) = std::env::var("PIXELFLUT_BEHAVIOR") {
            self.behavior = Some(PathBuf::from(behavior));
        }

        if let Ok(rate) = std::env::var("PIXELFLUT_RATE") {
            match rate.parse::<f64>() {
                Ok(rate) => self.rate_budget = rate,
                Err(_) => log::warn!("Ignoring invalid PIXELFLUT_RATE: {rate}"),
            }
        }
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("Canvas size must be non-zero, got {}x{}", self.width, self.height);
        }
        if self.frame_rate == 0 {
            anyhow::bail!("frame_rate must be at least 1");
        }
        if [self.rate_budget, self.godmode_budget].iter().any(|b| b.is_nan() || *b <= 0.0) {
            anyhow::bail!(
                "Rate budgets must be positive, got {} / {}",
                self.rate_budget,
                self.godmode_budget
            );
        }
        if self.max_line_length == 0 {
            anyhow::bail!("max_line_length must be at least 1");
        }
        if self.reload_interval_ms == 0 {
            anyhow::bail!("reload_interval_ms must be at least 1");
        }
        Ok(())
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a `WIDTHxHEIGHT` size string.
///
/// # Errors
///
/// Returns an error if the string is not two positive integers joined by `x`.
pub fn parse_size(s: &str) -> Result<(u32, u32)> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .with_context(|| format!("Expected WIDTHxHEIGHT, got '{s}'"))?;
    let w: u32 = w.trim().parse().with_context(|| format!("Invalid width in '{s}'"))?;
    let h: u32 = h.trim().parse().with_context(|| format!("Invalid height in '{s}'"))?;
    if w == 0 || h == 0 {
        anyhow::bail!("Size must be non-zero, got '{s}'");
    }
    Ok((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 1234);
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.frame_rate, 30);
        assert_eq!(config.max_line_length, 1024);
        assert!(config.reply_errors);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{"port": 4321, "width": 100, "behavior": "brain.lua"}"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.port, 4321);
        assert_eq!(config.width, 100);
        assert_eq!(config.height, 480);
        assert_eq!(config.behavior, Some(PathBuf::from("brain.lua")));
    }

    #[test]
    fn test_bad_json_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from_file(&path).is_err());
        assert!(Config::load(Some(&tmp.path().join("missing.json"))).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.width = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.rate_budget = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.frame_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization_skips_missing_behavior() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(!json.contains("behavior"));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("800x600").unwrap(), (800, 600));
        assert_eq!(parse_size("64X48").unwrap(), (64, 48));
        assert!(parse_size("800").is_err());
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("ax10").is_err());
    }

    #[test]
    fn test_bind_addr() {
        let config = Config {
            host: "127.0.0.1".into(),
            port: 0,
            ..Config::default()
        };
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }
}
