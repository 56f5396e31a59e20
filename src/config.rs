use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Smallest pending buffer that still fits a greeting plus a request with a
/// 255-byte domain.
pub const MIN_PENDING_BYTES: usize = 2 + 255 + 4 + 1 + 255 + 2;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub listen_port: u16,
    /// Seconds allowed for reaching the destination.
    pub connect_timeout: u64,
    /// Client bytes buffered before relaying starts.
    pub max_pending_bytes: usize,
    /// Queued bytes per write direction before readers stop reading.
    pub write_high_watermark: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 1080,
            connect_timeout: 10,
            max_pending_bytes: 64 * 1024,
            write_high_watermark: 256 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout == 0 {
            bail!("connect_timeout must be at least one second");
        }
        if self.max_pending_bytes < MIN_PENDING_BYTES {
            bail!("max_pending_bytes must be at least {}", MIN_PENDING_BYTES);
        }
        if self.write_high_watermark == 0 {
            bail!("write_high_watermark must be positive");
        }
        self.log_level()?;
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn log_level(&self) -> anyhow::Result<slog::Level> {
        slog::Level::from_str(&self.log_level)
            .map_err(|_| anyhow::anyhow!("invalid log level: {}", self.log_level))
    }
}
