//! Protocol policy: timeouts, chunking, concurrency and retry knobs.
//!
//! Values are supplied by the embedding application at construction time.
//! The library never reads the environment; the CLI loads an optional TOML
//! file through [`Config::from_toml_file`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

pub const KIB: u32 = 1024;
pub const MIB: u32 = 1024 * KIB;

/// Backoff policy: `base`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffPolicy {
    #[serde(with = "humantime_duration")]
    pub base: Duration,
    #[serde(with = "humantime_duration")]
    pub max: Duration,
    /// Add up to 50% random jitter to each delay.
    #[serde(default)]
    pub jitter: bool,
    /// Attempts allowed before giving up (reconnects only).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    5
}

impl BackoffPolicy {
    pub fn reconnect_default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: true,
            max_retries: default_max_retries(),
        }
    }

    pub fn chunk_retry_default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(5),
            jitter: false,
            max_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Bytes per chunk on the bulk link.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    /// Largest chunk a receiver accepts in a handshake.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u32,
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,
    #[serde(default = "default_control_timeout", with = "humantime_duration")]
    pub control_message_timeout: Duration,
    #[serde(default = "default_transfer_timeout", with = "humantime_duration")]
    pub handshake_timeout: Duration,
    #[serde(default = "default_transfer_timeout", with = "humantime_duration")]
    pub chunk_timeout: Duration,
    /// Attempts per chunk, the first send included.
    #[serde(default = "default_max_retries_per_chunk")]
    pub max_retries_per_chunk: u32,
    #[serde(default = "BackoffPolicy::chunk_retry_default")]
    pub chunk_retry: BackoffPolicy,
    /// Encoded envelope limit on the control link.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// JSON frame limit on the bulk link (chunk payloads are not framed).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Refuse inbound files larger than this.
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default = "BackoffPolicy::reconnect_default")]
    pub reconnect: BackoffPolicy,
}

fn default_chunk_size() -> u32 {
    MIB
}
fn default_max_chunk_size() -> u32 {
    8 * MIB
}
fn default_max_concurrent_transfers() -> usize {
    3
}
fn default_control_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_transfer_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_max_retries_per_chunk() -> u32 {
    3
}
fn default_max_message_size() -> usize {
    512
}
fn default_max_frame_size() -> usize {
    64 * KIB as usize
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            control_message_timeout: default_control_timeout(),
            handshake_timeout: default_transfer_timeout(),
            chunk_timeout: default_transfer_timeout(),
            max_retries_per_chunk: default_max_retries_per_chunk(),
            chunk_retry: BackoffPolicy::chunk_retry_default(),
            max_message_size: default_max_message_size(),
            max_frame_size: default_max_frame_size(),
            max_file_size: None,
            auto_reconnect: false,
            reconnect: BackoffPolicy::reconnect_default(),
        }
    }
}

impl Config {
    /// Check invariants between fields. Called by every constructor that
    /// accepts a `Config`.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size must be positive"));
        }
        if self.chunk_size > self.max_chunk_size {
            return Err(invalid(format!(
                "chunk_size {} exceeds max_chunk_size {}",
                self.chunk_size, self.max_chunk_size
            )));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(invalid("max_concurrent_transfers must be at least 1"));
        }
        if self.max_retries_per_chunk == 0 {
            return Err(invalid("max_retries_per_chunk must be at least 1"));
        }
        for (name, value) in [
            ("control_message_timeout", self.control_message_timeout),
            ("handshake_timeout", self.handshake_timeout),
            ("chunk_timeout", self.chunk_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be non-zero")));
            }
        }
        // An envelope carrying nothing but its header fields is ~200 bytes.
        if self.max_message_size < 256 {
            return Err(invalid("max_message_size must be at least 256 bytes"));
        }
        if self.max_frame_size < self.max_message_size {
            return Err(invalid("max_frame_size must not be below max_message_size"));
        }
        if self.max_file_size == Some(0) {
            return Err(invalid("max_file_size must be positive when set"));
        }
        for (name, policy) in [("reconnect", &self.reconnect), ("chunk_retry", &self.chunk_retry)] {
            if policy.base > policy.max {
                return Err(invalid(format!("{name}.base exceeds {name}.max")));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s).map_err(|e| invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidConfig(msg.into())
}

/// Durations as human-readable strings, e.g. `"5s"` or `"250ms"`.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
