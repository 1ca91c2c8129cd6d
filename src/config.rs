//! Configuration for the session engine.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values. The resolved
//! [`Config`] is validated once at startup; size relationships that could
//! only fail at runtime are rejected here instead.

use crate::error::ConfigError;
use crate::protocol::HEADER_LEN;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the `framewire` server.
#[derive(Parser, Debug, Default)]
#[command(name = "framewire")]
#[command(version = "0.1.0")]
#[command(about = "Echo server for the framewire binary protocol", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7878)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (0 = number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum attachment + payload bytes per frame
    #[arg(long)]
    pub max_content_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: String,
    /// Number of worker threads (0 = available parallelism)
    pub workers: usize,
    /// Maximum number of live sessions
    pub max_connections: usize,
    /// Handler threads; 0 runs handlers on the I/O worker
    pub dispatch_threads: usize,
    /// Bound of the handler hand-off queue
    pub dispatch_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".to_string(),
            workers: 0,
            max_connections: 10_000,
            dispatch_threads: 0,
            dispatch_queue_capacity: 1024,
        }
    }
}

/// Arena, read buffer and write queue sizing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub page_size: usize,
    /// 0 = one page per worker
    pub page_count: usize,
    pub max_chunk_size: usize,
    pub read_buffer_size: usize,
    /// Write queue capacity in bytes
    pub write_queue_capacity: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub coalesce_threshold: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * 1024 * 1024,           // 4 MB
            page_count: 0,
            max_chunk_size: 256 * 1024,           // 256 KB
            read_buffer_size: 64 * 1024,          // 64 KB
            write_queue_capacity: 4 * 1024 * 1024, // 4 MB
            high_watermark: 0.9,
            low_watermark: 0.6,
            coalesce_threshold: 32 * 1024,
        }
    }
}

/// Framing and payload codec settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub max_content_length: usize,
    pub serializer: String,
    pub compressor: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_content_length: 64 * 1024 - HEADER_LEN,
            serializer: "raw".to_string(),
            compressor: "identity".to_string(),
        }
    }
}

/// Timeouts in milliseconds (0 disables idle and heartbeat)
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub idle_ms: u64,
    pub heartbeat_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 3000,
            idle_ms: 0,
            heartbeat_ms: 0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub page_size: usize,
    pub page_count: usize,
    pub max_chunk_size: usize,
    pub read_buffer_size: usize,
    pub write_queue_capacity: usize,
    pub high_watermark: f64,
    pub low_watermark: f64,
    pub coalesce_threshold: usize,
    pub max_content_length: usize,
    pub connect_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_connections: usize,
    pub dispatch_threads: usize,
    pub dispatch_queue_capacity: usize,
    pub serializer: String,
    pub compressor: String,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::FileRead {
                    path: config_path.clone(),
                    source: e,
                })?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse {
                path: config_path.clone(),
                source: e,
            })?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence).
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            workers: cli.workers.unwrap_or(file.server.workers),
            page_size: file.buffers.page_size,
            page_count: file.buffers.page_count,
            max_chunk_size: file.buffers.max_chunk_size,
            read_buffer_size: file.buffers.read_buffer_size,
            write_queue_capacity: file.buffers.write_queue_capacity,
            high_watermark: file.buffers.high_watermark,
            low_watermark: file.buffers.low_watermark,
            coalesce_threshold: file.buffers.coalesce_threshold,
            max_content_length: cli
                .max_content_length
                .unwrap_or(file.protocol.max_content_length),
            connect_timeout_ms: file.timeouts.connect_ms,
            idle_timeout_ms: file.timeouts.idle_ms,
            heartbeat_interval_ms: file.timeouts.heartbeat_ms,
            max_connections: cli.max_connections.unwrap_or(file.server.max_connections),
            dispatch_threads: file.server.dispatch_threads,
            dispatch_queue_capacity: file.server.dispatch_queue_capacity,
            serializer: file.protocol.serializer,
            compressor: file.protocol.compressor,
            log_level: cli.log_level.unwrap_or(file.logging.level),
        }
    }

    /// Number of I/O worker threads after resolving `0` to the core count.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus()
        } else {
            self.workers
        }
    }

    /// Number of arena pages after resolving `0` to the worker count.
    pub fn page_count(&self) -> usize {
        if self.page_count == 0 {
            self.worker_count()
        } else {
            self.page_count
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Idle timeout, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    /// Heartbeat interval, `None` when disabled.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }

    /// Check size relationships and ranges.
    ///
    /// Everything that would otherwise surface as an allocation or framing
    /// failure on a live connection is rejected here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.into(),
            }
        }

        if self.page_size == 0 {
            return Err(invalid("page_size", "must be greater than 0"));
        }
        if self.max_chunk_size == 0 || self.max_chunk_size > self.page_size {
            return Err(invalid(
                "max_chunk_size",
                format!(
                    "{} must be in 1..={} (page_size)",
                    self.max_chunk_size, self.page_size
                ),
            ));
        }
        if self.read_buffer_size > self.max_chunk_size {
            return Err(invalid(
                "read_buffer_size",
                format!(
                    "{} exceeds max_chunk_size {}",
                    self.read_buffer_size, self.max_chunk_size
                ),
            ));
        }
        if self.max_content_length == 0
            || HEADER_LEN + self.max_content_length > self.read_buffer_size
        {
            return Err(invalid(
                "max_content_length",
                format!(
                    "{} plus {HEADER_LEN} header bytes must fit in read_buffer_size {}",
                    self.max_content_length, self.read_buffer_size
                ),
            ));
        }
        if self.max_content_length > i32::MAX as usize {
            return Err(invalid("max_content_length", "must fit in a signed 32-bit length"));
        }
        if self.write_queue_capacity == 0 {
            return Err(invalid("write_queue_capacity", "must be greater than 0"));
        }
        if !(self.low_watermark > 0.0
            && self.low_watermark < self.high_watermark
            && self.high_watermark <= 1.0)
        {
            return Err(invalid(
                "high_watermark",
                format!(
                    "expected 0 < low ({}) < high ({}) <= 1",
                    self.low_watermark, self.high_watermark
                ),
            ));
        }
        if (self.write_queue_capacity as f64 * self.low_watermark) as usize == 0 {
            return Err(invalid(
                "write_queue_capacity",
                format!(
                    "{} bytes leaves a zero-byte low watermark at {}",
                    self.write_queue_capacity, self.low_watermark
                ),
            ));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be greater than 0"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(invalid("connect_timeout_ms", "must be greater than 0"));
        }
        if self.dispatch_threads > 0 && self.dispatch_queue_capacity == 0 {
            return Err(invalid(
                "dispatch_queue_capacity",
                "must be greater than 0 when dispatch_threads is set",
            ));
        }
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
