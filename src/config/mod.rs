//! Configuration module for the Lumen Gateway
//!
//! Configuration is assembled from three sources, in priority order:
//! YAML file > environment variables > built-in defaults. The `.env`
//! file (if any) is loaded by the binary before this module runs, so
//! `.env` values arrive here as ordinary environment variables.
//!
//! Every tuning knob of the core (heartbeat cadence, command timeout,
//! offline-queue cap, ASR finalize window, TTS watermarks) lives here as
//! a named field with a default; none of them is hard-coded at a call
//! site.

use std::path::PathBuf;
use std::time::Duration;

mod yaml;

use crate::errors::{GatewayError, GatewayResult};

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// HTTP/WebSocket server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// TLS configuration (optional)
    pub tls: Option<TlsConfig>,
    /// CORS allowed origins (comma-separated list or "*" for all).
    /// None means same-origin only.
    pub cors_allowed_origins: Option<String>,
    /// Maximum REST requests per second per IP address
    pub rate_limit_requests_per_second: u32,
    /// Maximum burst size for rate limiting
    pub rate_limit_burst_size: u32,
    /// Static bearer token protecting the admin API. None disables the check.
    pub admin_token: Option<String>,
}

/// Heartbeat monitor settings.
#[derive(Debug, Clone)]
pub struct HeartbeatSettings {
    /// Probe cadence per connection.
    pub interval_ms: u64,
    /// Maximum `last_seen` age before a device is considered gone.
    pub timeout_ms: u64,
    /// Maximum age of the last liveness pong before the socket is
    /// considered broken even if frames were recently seen.
    pub pong_timeout_ms: u64,
    /// Cadence of the global offline sweep that catches sockets which
    /// vanished without a close event.
    pub sweep_interval_ms: u64,
}

/// Command dispatcher settings.
#[derive(Debug, Clone)]
pub struct CommandSettings {
    /// How long a directly-delivered command waits for `command_result`.
    pub timeout_ms: u64,
    /// Per-device offline queue capacity; oldest entries past this are dropped.
    pub queue_max: usize,
    /// How many queued commands one heartbeat response may carry.
    pub flush_batch: usize,
    /// Cadence of the pending-table expiry sweep.
    pub sweep_interval_ms: u64,
}

/// ASR session manager settings.
#[derive(Debug, Clone)]
pub struct AsrSettings {
    /// Upper bound of the finalize-wait step.
    pub finalize_max_wait_ms: u64,
    /// Poll cadence inside the finalize-wait step.
    pub finalize_poll_interval_ms: u64,
    /// Consecutive `ending` VAD chunks that trigger an early end-of-utterance.
    pub ending_run_threshold: u32,
    /// Sessions idle longer than this are reaped by the sweep.
    pub idle_timeout_ms: u64,
    /// Cadence of the abandoned-session sweep.
    pub sweep_interval_ms: u64,
    /// Grace delay after force-ending a superseded session on the same device.
    pub supersede_grace_ms: u64,
}

/// TTS backpressure settings. The watermark pairs are load-bearing
/// behavior, not incidental tuning.
#[derive(Debug, Clone)]
pub struct TtsSettings {
    /// Client-reported playback queue depth that engages the wait.
    pub queue_high_water: u32,
    /// Client-reported queue depth that releases the wait.
    pub queue_low_water: u32,
    /// Outbound buffered bytes that engage the wait.
    pub buffer_high_water: usize,
    /// Outbound buffered bytes that release the wait.
    pub buffer_low_water: usize,
    /// Client queue reports older than this are not trusted.
    pub status_staleness_ms: u64,
    /// Absolute upper bound of one clearance wait.
    pub max_wait_ms: u64,
    /// Poll cadence inside the clearance wait.
    pub poll_interval_ms: u64,
    /// Fixed pause before transmit while buffered bytes sit above the low water.
    pub spike_pause_ms: u64,
}

/// Device bookkeeping settings.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Capacity of the per-device log ring buffer.
    pub log_cap: usize,
}

/// Utterance recording settings.
#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub enabled: bool,
    /// Root directory; files land at `{dir}/{device_id}/{session_id}.wav`.
    pub dir: PathBuf,
}

/// Media translation settings used by the reply adapter.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    /// Base URL prefixed to rewritten file URLs. Empty means relative URLs.
    pub public_base_url: String,
    /// Directory whose contents are served under `/files`.
    pub files_dir: PathBuf,
    /// Quarantine area; files under it are rewritten to `/files/trash/...`.
    pub trash_dir: PathBuf,
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub server: ServerSettings,
    pub heartbeat: HeartbeatSettings,
    pub commands: CommandSettings,
    pub asr: AsrSettings,
    pub tts: TtsSettings,
    pub devices: DeviceSettings,
    pub recording: RecordingSettings,
    pub media: MediaSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8790,
                tls: None,
                cors_allowed_origins: None,
                rate_limit_requests_per_second: 60,
                rate_limit_burst_size: 10,
                admin_token: None,
            },
            heartbeat: HeartbeatSettings {
                interval_ms: 30_000,
                timeout_ms: 90_000,
                pong_timeout_ms: 75_000,
                sweep_interval_ms: 60_000,
            },
            commands: CommandSettings {
                timeout_ms: 5_000,
                queue_max: 20,
                flush_batch: 3,
                sweep_interval_ms: 60_000,
            },
            asr: AsrSettings {
                finalize_max_wait_ms: 3_000,
                finalize_poll_interval_ms: 50,
                ending_run_threshold: 2,
                idle_timeout_ms: 300_000,
                sweep_interval_ms: 60_000,
                supersede_grace_ms: 50,
            },
            tts: TtsSettings {
                queue_high_water: 40,
                queue_low_water: 20,
                buffer_high_water: 512 * 1024,
                buffer_low_water: 128 * 1024,
                status_staleness_ms: 1_200,
                max_wait_ms: 5_000,
                poll_interval_ms: 50,
                spike_pause_ms: 20,
            },
            devices: DeviceSettings { log_cap: 100 },
            recording: RecordingSettings {
                enabled: false,
                dir: PathBuf::from("recordings"),
            },
            media: MediaSettings {
                public_base_url: String::new(),
                files_dir: PathBuf::from("media"),
                trash_dir: PathBuf::from("media/trash"),
            },
        }
    }
}

impl GatewayConfig {
    /// Load configuration from environment variables over defaults.
    pub fn from_env() -> GatewayResult<Self> {
        let mut config = Self::default();
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, with environment variables
    /// overriding file values.
    pub fn from_file(path: &std::path::Path) -> GatewayResult<Self> {
        let mut config = yaml::load(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("LUMEN_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("LUMEN_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(token) = std::env::var("LUMEN_ADMIN_TOKEN") {
            if !token.is_empty() {
                self.server.admin_token = Some(token);
            }
        }
        if let Ok(origins) = std::env::var("LUMEN_CORS_ALLOWED_ORIGINS") {
            if !origins.is_empty() {
                self.server.cors_allowed_origins = Some(origins);
            }
        }
        if let Ok(base) = std::env::var("LUMEN_PUBLIC_BASE_URL") {
            self.media.public_base_url = base.trim_end_matches('/').to_string();
        }
    }

    /// Reject configurations the core cannot run with.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(GatewayError::Configuration(
                "heartbeat.interval_ms must be non-zero".into(),
            ));
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(GatewayError::Configuration(format!(
                "heartbeat.timeout_ms ({}) must exceed heartbeat.interval_ms ({})",
                self.heartbeat.timeout_ms, self.heartbeat.interval_ms
            )));
        }
        if self.commands.queue_max == 0 || self.commands.flush_batch == 0 {
            return Err(GatewayError::Configuration(
                "commands.queue_max and commands.flush_batch must be non-zero".into(),
            ));
        }
        if self.asr.finalize_poll_interval_ms == 0 || self.asr.ending_run_threshold == 0 {
            return Err(GatewayError::Configuration(
                "asr.finalize_poll_interval_ms and asr.ending_run_threshold must be non-zero"
                    .into(),
            ));
        }
        if self.tts.queue_low_water >= self.tts.queue_high_water {
            return Err(GatewayError::Configuration(format!(
                "tts.queue_low_water ({}) must be below tts.queue_high_water ({})",
                self.tts.queue_low_water, self.tts.queue_high_water
            )));
        }
        if self.tts.buffer_low_water >= self.tts.buffer_high_water {
            return Err(GatewayError::Configuration(format!(
                "tts.buffer_low_water ({}) must be below tts.buffer_high_water ({})",
                self.tts.buffer_low_water, self.tts.buffer_high_water
            )));
        }
        if self.tts.poll_interval_ms == 0 {
            return Err(GatewayError::Configuration(
                "tts.poll_interval_ms must be non-zero".into(),
            ));
        }
        if !self.media.public_base_url.is_empty() {
            url::Url::parse(&self.media.public_base_url).map_err(|e| {
                GatewayError::Configuration(format!("media.public_base_url is not a URL: {e}"))
            })?;
        }
        Ok(())
    }

    /// Socket address string the server binds to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn is_tls_enabled(&self) -> bool {
        self.server.tls.is_some()
    }
}

impl HeartbeatSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl CommandSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl AsrSettings {
    pub fn finalize_max_wait(&self) -> Duration {
        Duration::from_millis(self.finalize_max_wait_ms)
    }
    pub fn finalize_poll_interval(&self) -> Duration {
        Duration::from_millis(self.finalize_poll_interval_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
    pub fn supersede_grace(&self) -> Duration {
        Duration::from_millis(self.supersede_grace_ms)
    }
}

impl TtsSettings {
    pub fn status_staleness(&self) -> Duration {
        Duration::from_millis(self.status_staleness_ms)
    }
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
    pub fn spike_pause(&self) -> Duration {
        Duration::from_millis(self.spike_pause_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.commands.timeout_ms, 5_000);
        assert_eq!(config.asr.finalize_max_wait_ms, 3_000);
        assert_eq!(config.tts.queue_high_water, 40);
        assert_eq!(config.tts.buffer_high_water, 512 * 1024);
    }

    #[test]
    fn test_inverted_queue_watermarks_rejected() {
        let mut config = GatewayConfig::default();
        config.tts.queue_low_water = 40;
        config.tts.queue_high_water = 40;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("queue_low_water"));
    }

    #[test]
    fn test_inverted_buffer_watermarks_rejected() {
        let mut config = GatewayConfig::default();
        config.tts.buffer_low_water = config.tts.buffer_high_water;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timeout_must_exceed_interval() {
        let mut config = GatewayConfig::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_address_format() {
        let config = GatewayConfig::default();
        assert_eq!(config.address(), "0.0.0.0:8790");
    }

    #[test]
    fn test_public_base_url_must_parse() {
        let mut config = GatewayConfig::default();
        config.media.public_base_url = "not a url".to_string();
        assert!(config.validate().is_err());
        config.media.public_base_url = "https://gw.example.com:8790".to_string();
        assert!(config.validate().is_ok());
    }
}
