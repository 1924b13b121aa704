//! Configuration loading.
//!
//! Defaults cover every knob; an optional TOML file (`--config <path>`)
//! overrides them, and `TELEMETRY_ARCHIVE_DIR` overrides the archive root
//! last. There is no other environment coupling.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_UDP_PORT: u16 = 8514;
pub const DEFAULT_HTTP_PORT: u16 = 8080;
pub const DEFAULT_ARCHIVE_ROOT: &str = "telemetry/prints";

/// Environment variable overriding the archive root.
pub const ARCHIVE_DIR_ENV: &str = "TELEMETRY_ARCHIVE_DIR";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub udp_port: u16,
    pub http_port: u16,
    pub archive: ArchiveConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub root: PathBuf,
    pub print_end_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Datagrams buffered between the UDP reader and the decode stage.
    pub input_capacity: usize,
    /// Default buffer for hub subscribers (WebSocket connections, taps).
    pub subscriber_capacity: usize,
    /// Buffer for the archive writer's subscription.
    pub writer_capacity: usize,
    /// Reorder window size for metric taps.
    pub reorder_window: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            udp_port: DEFAULT_UDP_PORT,
            http_port: DEFAULT_HTTP_PORT,
            archive: ArchiveConfig {
                root: PathBuf::from(DEFAULT_ARCHIVE_ROOT),
                print_end_timeout: Duration::from_secs(10 * 60),
            },
            pipeline: PipelineConfig {
                input_capacity: 1000,
                subscriber_capacity: 100,
                writer_capacity: 100,
                reorder_window: 2,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (Option for every field)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    udp: Option<RawUdpConfig>,
    http: Option<RawHttpConfig>,
    archive: Option<RawArchiveConfig>,
    pipeline: Option<RawPipelineConfig>,
}

#[derive(Debug, Deserialize)]
struct RawUdpConfig {
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawHttpConfig {
    port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawArchiveConfig {
    root: Option<String>,
    print_end_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPipelineConfig {
    input_capacity: Option<usize>,
    subscriber_capacity: Option<usize>,
    writer_capacity: Option<usize>,
    reorder_window: Option<usize>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load configuration: defaults, then the optional TOML file, then the
/// `TELEMETRY_ARCHIVE_DIR` override.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = Config::default();
    if let Some(path) = path {
        let toml_str = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Io(format!("reading config file '{}': {}", path.display(), e))
        })?;
        apply_toml(&mut config, &toml_str)?;
    }
    apply_env(&mut config);
    Ok(config)
}

fn apply_toml(config: &mut Config, toml_str: &str) -> Result<(), ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    if let Some(udp) = raw.udp {
        if let Some(port) = udp.port {
            config.udp_port = port;
        }
    }
    if let Some(http) = raw.http {
        if let Some(port) = http.port {
            config.http_port = port;
        }
    }
    if let Some(archive) = raw.archive {
        if let Some(root) = archive.root {
            config.archive.root = PathBuf::from(root);
        }
        if let Some(secs) = archive.print_end_timeout_secs {
            if secs == 0 {
                return Err(ConfigError::InvalidValue(
                    "archive.print_end_timeout_secs must be positive".to_owned(),
                ));
            }
            config.archive.print_end_timeout = Duration::from_secs(secs);
        }
    }
    if let Some(pipeline) = raw.pipeline {
        if let Some(n) = pipeline.input_capacity {
            config.pipeline.input_capacity = n;
        }
        if let Some(n) = pipeline.subscriber_capacity {
            config.pipeline.subscriber_capacity = n;
        }
        if let Some(n) = pipeline.writer_capacity {
            config.pipeline.writer_capacity = n;
        }
        if let Some(n) = pipeline.reorder_window {
            if n == 0 {
                return Err(ConfigError::InvalidValue(
                    "pipeline.reorder_window must be at least 1".to_owned(),
                ));
            }
            config.pipeline.reorder_window = n;
        }
    }
    Ok(())
}

fn apply_env(config: &mut Config) {
    if let Ok(root) = std::env::var(ARCHIVE_DIR_ENV) {
        if !root.is_empty() {
            config.archive.root = PathBuf::from(root);
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
