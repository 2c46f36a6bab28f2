use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::Deserialize;

use crate::core::ServerError;

/// Server configuration.
///
/// Load priority: CLI args > environment (`RSQLITED_*`) > config file
/// (`./rsqlited.toml` or `/etc/rsqlited/rsqlited.toml`) > defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_max_conns")]
    pub max_conns: usize,

    /// How long a writing statement waits for the write lock or a busy
    /// engine. 0 surfaces busy immediately; `u64::MAX` waits forever.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Idle timeout between statements; 0 disables.
    #[serde(default)]
    pub sleep_timeout_ms: u64,
    /// Idle timeout inside an open transaction; 0 disables.
    #[serde(default = "default_sleep_in_tx_timeout_ms")]
    pub sleep_in_tx_timeout_ms: u64,
    /// Statements slower than this count as slow in SHOW STATUS; 0
    /// disables.
    #[serde(default)]
    pub long_query_ms: u64,

    /// Queued intakes a worker drains per wake, in (0, 100]; 100 drains
    /// everything pending.
    #[serde(default = "default_worker_io_ratio")]
    pub worker_io_ratio: u32,
    /// Re-poll interval for a busy parker woken while the write lock is
    /// still held elsewhere.
    #[serde(default = "default_worker_busy_min_wait_ms")]
    pub worker_busy_min_wait_ms: u64,

    #[serde(default = "default_init_read_buffer")]
    pub processor_init_read_buffer: usize,
    #[serde(default = "default_max_read_buffer")]
    pub processor_max_read_buffer: usize,
    #[serde(default = "default_max_write_times")]
    pub processor_max_write_times: usize,
    #[serde(default = "default_max_write_queue")]
    pub processor_max_write_queue: usize,
    #[serde(default = "default_max_write_buffer")]
    pub processor_max_write_buffer: usize,

    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub trace_error: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3272
}
fn default_data_dir() -> String {
    "./data".to_string()
}
fn default_worker_count() -> usize {
    4
}
fn default_max_conns() -> usize {
    151
}
fn default_busy_timeout_ms() -> u64 {
    50_000
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_sleep_in_tx_timeout_ms() -> u64 {
    30_000
}
fn default_worker_io_ratio() -> u32 {
    50
}
fn default_worker_busy_min_wait_ms() -> u64 {
    100
}
fn default_init_read_buffer() -> usize {
    4096
}
fn default_max_read_buffer() -> usize {
    65536
}
fn default_max_write_times() -> usize {
    1024
}
fn default_max_write_queue() -> usize {
    1024
}
fn default_max_write_buffer() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            worker_count: default_worker_count(),
            max_conns: default_max_conns(),
            busy_timeout_ms: default_busy_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            sleep_timeout_ms: 0,
            sleep_in_tx_timeout_ms: default_sleep_in_tx_timeout_ms(),
            long_query_ms: 0,
            worker_io_ratio: default_worker_io_ratio(),
            worker_busy_min_wait_ms: default_worker_busy_min_wait_ms(),
            processor_init_read_buffer: default_init_read_buffer(),
            processor_max_read_buffer: default_max_read_buffer(),
            processor_max_write_times: default_max_write_times(),
            processor_max_write_queue: default_max_write_queue(),
            processor_max_write_buffer: default_max_write_buffer(),
            trace: false,
            trace_error: false,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from file and environment.
    pub fn load() -> Result<Self, ::config::ConfigError> {
        let mut builder = Config::builder();
        for path in ["/etc/rsqlited/rsqlited.toml", "./rsqlited.toml"] {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
        // RSQLITED_BUSY_TIMEOUT_MS and friends map onto the flat keys.
        builder = builder.add_source(Environment::with_prefix("RSQLITED"));
        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.worker_io_ratio == 0 || self.worker_io_ratio > 100 {
            return Err(ServerError::Internal(format!(
                "worker_io_ratio {} out of range (0, 100]",
                self.worker_io_ratio
            )));
        }
        if self.worker_count == 0 {
            return Err(ServerError::Internal("worker_count must be > 0".to_string()));
        }
        if self.max_conns == 0 {
            return Err(ServerError::Internal("max_conns must be > 0".to_string()));
        }
        if self.processor_init_read_buffer == 0
            || self.processor_max_read_buffer < self.processor_init_read_buffer
        {
            return Err(ServerError::Internal(
                "read buffer sizes out of range".to_string(),
            ));
        }
        Ok(())
    }

    /// The busy deadline. `None` means wait on the write lock forever;
    /// callers handle a zero timeout before parking.
    pub fn busy_deadline(&self) -> Option<Duration> {
        if self.busy_timeout_ms == u64::MAX {
            None
        } else {
            Some(Duration::from_millis(self.busy_timeout_ms))
        }
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        nonzero_ms(self.auth_timeout_ms)
    }

    pub fn sleep_timeout(&self) -> Option<Duration> {
        nonzero_ms(self.sleep_timeout_ms)
    }

    pub fn sleep_in_tx_timeout(&self) -> Option<Duration> {
        nonzero_ms(self.sleep_in_tx_timeout_ms)
    }

    pub fn busy_min_wait(&self) -> Duration {
        Duration::from_millis(self.worker_busy_min_wait_ms.max(1))
    }
}

fn nonzero_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}
