//! Node configuration.
//!
//! The configuration file is TOML. Every section and field is optional and
//! falls back to its default, so an empty file is a valid configuration:
//!
//! ```toml
//! [overlay]
//! listen_addr = "0.0.0.0:6346"
//! max_connections = 32
//! known_hosts = ["203.0.113.5:6346"]
//!
//! [overlay.queue]
//! high_watermark = 49152
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! Environment variables prefixed with `GNET_` override file values.

use std::path::{Path, PathBuf};

use anyhow::Context;
use gnet_overlay::OverlayConfig;
use serde::{Deserialize, Serialize};

use crate::logging::{LogConfig, LogFormat};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub overlay: OverlayConfig,
    pub logging: LoggingConfig,
}

/// Logging section of the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// text or json.
    pub format: String,
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            colors: true,
        }
    }
}

impl LoggingConfig {
    pub fn to_log_config(&self) -> LogConfig {
        let config = LogConfig {
            ansi_colors: self.colors,
            ..LogConfig::default()
        };
        config
            .with_level(&self.level)
            .with_format(LogFormat::parse(&self.format))
    }
}

impl AppConfig {
    /// Loads a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Loads a configuration file and applies environment overrides.
    pub fn from_file_with_env(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies `GNET_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let overlay = &mut self.overlay;
        if let Some(addr) = var("GNET_LISTEN_ADDR").and_then(|v| v.parse().ok()) {
            overlay.listen_addr = addr;
        }
        if let Some(enabled) = var("GNET_LISTEN_ENABLED").and_then(|v| v.parse().ok()) {
            overlay.listen_enabled = enabled;
        }
        if let Some(max) = var("GNET_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            overlay.max_connections = max;
        }
        if let Some(target) = var("GNET_TARGET_CONNECTIONS").and_then(|v| v.parse().ok()) {
            overlay.target_connections = target;
        }
        if let Some(hosts) = var("GNET_KNOWN_HOSTS") {
            overlay.known_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(path) = var("GNET_HOST_CACHE_DB") {
            overlay.host_cache_db = Some(PathBuf::from(path));
        }
        if let Some(ultrapeer) = var("GNET_ULTRAPEER").and_then(|v| v.parse().ok()) {
            overlay.local.ultrapeer = ultrapeer;
        }
        if let Some(level) = var("GNET_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("GNET_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Checks values that would make the node misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        let overlay = &self.overlay;
        if overlay.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if overlay.target_connections > overlay.max_connections {
            anyhow::bail!(
                "target_connections ({}) exceeds max_connections ({})",
                overlay.target_connections,
                overlay.max_connections
            );
        }
        let queue = &overlay.queue;
        if queue.low_watermark >= queue.high_watermark || queue.high_watermark > queue.max_size {
            anyhow::bail!(
                "queue watermarks must satisfy low < high <= max_size (got {} / {} / {})",
                queue.low_watermark,
                queue.high_watermark,
                queue.max_size
            );
        }
        if overlay.queue.compression_level > 9 {
            anyhow::bail!("compression_level must be 0-9");
        }
        if overlay.rx_fc_ratio > 100 {
            anyhow::bail!("rx_fc_ratio is a percentage (0-100)");
        }
        if overlay.write_chunk_size == 0 {
            anyhow::bail!("write_chunk_size must be positive");
        }
        Ok(())
    }

    /// The default configuration as TOML.
    pub fn sample_config() -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(&Self::default())?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"").unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.overlay.max_connections, OverlayConfig::default().max_connections);
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[overlay]
listen_addr = "127.0.0.1:7000"
known_hosts = ["198.51.100.7:6346"]

[overlay.queue]
high_watermark = 40000

[overlay.host_cache]
allow_private = true

[logging]
format = "json"
"#
        )
        .unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.overlay.listen_addr.port(), 7000);
        assert_eq!(config.overlay.known_hosts, vec!["198.51.100.7:6346"]);
        assert_eq!(config.overlay.queue.high_watermark, 40000);
        assert_eq!(config.overlay.queue.low_watermark, 16 * 1024);
        assert!(config.overlay.host_cache.allow_private);
        assert_eq!(config.logging.to_log_config().format, LogFormat::Json);
    }

    #[test]
    fn test_bad_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[overlay\n").unwrap();
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("GNET_LISTEN_ADDR", "127.0.0.1:6400"),
            ("GNET_MAX_CONNECTIONS", "4"),
            ("GNET_TARGET_CONNECTIONS", "not a number"),
            ("GNET_KNOWN_HOSTS", "1.2.3.4:6346, 5.6.7.8:6346,"),
            ("GNET_LOG_LEVEL", "trace"),
        ]
        .into_iter()
        .collect();
        let mut config = AppConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.overlay.listen_addr.port(), 6400);
        assert_eq!(config.overlay.max_connections, 4);
        // Unparseable values are ignored.
        assert_eq!(config.overlay.target_connections, 8);
        assert_eq!(config.overlay.known_hosts, vec!["1.2.3.4:6346", "5.6.7.8:6346"]);
        assert_eq!(config.logging.level, "trace");
        // 8 targets over a limit of 4.
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_watermarks() {
        let mut config = AppConfig::default();
        config.overlay.queue.low_watermark = config.overlay.queue.high_watermark;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sample_config_parses_back() {
        let sample = AppConfig::sample_config().unwrap();
        assert!(sample.contains("[overlay]"));
        let parsed: AppConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.overlay.listen_addr, OverlayConfig::default().listen_addr);
    }
}
