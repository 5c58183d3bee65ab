//! YAML configuration file loading
//!
//! The file model mirrors `GatewayConfig` but with every field optional,
//! so a config file only needs to name the values it changes. Unknown
//! keys are rejected to catch typos early.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::{GatewayConfig, TlsConfig};
use crate::errors::{GatewayError, GatewayResult};

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    heartbeat: HeartbeatSection,
    #[serde(default)]
    commands: CommandsSection,
    #[serde(default)]
    asr: AsrSection,
    #[serde(default)]
    tts: TtsSection,
    #[serde(default)]
    devices: DevicesSection,
    #[serde(default)]
    recording: RecordingSection,
    #[serde(default)]
    media: MediaSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    host: Option<String>,
    port: Option<u16>,
    tls_cert_path: Option<PathBuf>,
    tls_key_path: Option<PathBuf>,
    cors_allowed_origins: Option<String>,
    rate_limit_requests_per_second: Option<u32>,
    rate_limit_burst_size: Option<u32>,
    admin_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeartbeatSection {
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    pong_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandsSection {
    timeout_ms: Option<u64>,
    queue_max: Option<usize>,
    flush_batch: Option<usize>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AsrSection {
    finalize_max_wait_ms: Option<u64>,
    finalize_poll_interval_ms: Option<u64>,
    ending_run_threshold: Option<u32>,
    idle_timeout_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
    supersede_grace_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TtsSection {
    queue_high_water: Option<u32>,
    queue_low_water: Option<u32>,
    buffer_high_water: Option<usize>,
    buffer_low_water: Option<usize>,
    status_staleness_ms: Option<u64>,
    max_wait_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    spike_pause_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DevicesSection {
    log_cap: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RecordingSection {
    enabled: Option<bool>,
    dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MediaSection {
    public_base_url: Option<String>,
    files_dir: Option<PathBuf>,
    trash_dir: Option<PathBuf>,
}

macro_rules! apply {
    ($target:expr, $source:expr) => {
        if let Some(value) = $source {
            $target = value;
        }
    };
}

/// Load a `GatewayConfig` from a YAML file over the built-in defaults.
pub(super) fn load(path: &Path) -> GatewayResult<GatewayConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        GatewayError::Configuration(format!("cannot read {}: {e}", path.display()))
    })?;
    let file: FileConfig = serde_yaml::from_str(&raw).map_err(|e| {
        GatewayError::Configuration(format!("cannot parse {}: {e}", path.display()))
    })?;

    let mut config = GatewayConfig::default();

    apply!(config.server.host, file.server.host);
    apply!(config.server.port, file.server.port);
    match (file.server.tls_cert_path, file.server.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            config.server.tls = Some(TlsConfig {
                cert_path,
                key_path,
            });
        }
        (None, None) => {}
        _ => {
            return Err(GatewayError::Configuration(
                "server.tls_cert_path and server.tls_key_path must be set together".into(),
            ));
        }
    }
    config.server.cors_allowed_origins = file
        .server
        .cors_allowed_origins
        .or(config.server.cors_allowed_origins);
    apply!(
        config.server.rate_limit_requests_per_second,
        file.server.rate_limit_requests_per_second
    );
    apply!(
        config.server.rate_limit_burst_size,
        file.server.rate_limit_burst_size
    );
    config.server.admin_token = file.server.admin_token.or(config.server.admin_token);

    apply!(config.heartbeat.interval_ms, file.heartbeat.interval_ms);
    apply!(config.heartbeat.timeout_ms, file.heartbeat.timeout_ms);
    apply!(
        config.heartbeat.pong_timeout_ms,
        file.heartbeat.pong_timeout_ms
    );
    apply!(
        config.heartbeat.sweep_interval_ms,
        file.heartbeat.sweep_interval_ms
    );

    apply!(config.commands.timeout_ms, file.commands.timeout_ms);
    apply!(config.commands.queue_max, file.commands.queue_max);
    apply!(config.commands.flush_batch, file.commands.flush_batch);
    apply!(
        config.commands.sweep_interval_ms,
        file.commands.sweep_interval_ms
    );

    apply!(
        config.asr.finalize_max_wait_ms,
        file.asr.finalize_max_wait_ms
    );
    apply!(
        config.asr.finalize_poll_interval_ms,
        file.asr.finalize_poll_interval_ms
    );
    apply!(
        config.asr.ending_run_threshold,
        file.asr.ending_run_threshold
    );
    apply!(config.asr.idle_timeout_ms, file.asr.idle_timeout_ms);
    apply!(config.asr.sweep_interval_ms, file.asr.sweep_interval_ms);
    apply!(config.asr.supersede_grace_ms, file.asr.supersede_grace_ms);

    apply!(config.tts.queue_high_water, file.tts.queue_high_water);
    apply!(config.tts.queue_low_water, file.tts.queue_low_water);
    apply!(config.tts.buffer_high_water, file.tts.buffer_high_water);
    apply!(config.tts.buffer_low_water, file.tts.buffer_low_water);
    apply!(config.tts.status_staleness_ms, file.tts.status_staleness_ms);
    apply!(config.tts.max_wait_ms, file.tts.max_wait_ms);
    apply!(config.tts.poll_interval_ms, file.tts.poll_interval_ms);
    apply!(config.tts.spike_pause_ms, file.tts.spike_pause_ms);

    apply!(config.devices.log_cap, file.devices.log_cap);

    apply!(config.recording.enabled, file.recording.enabled);
    apply!(config.recording.dir, file.recording.dir);

    if let Some(base) = file.media.public_base_url {
        config.media.public_base_url = base.trim_end_matches('/').to_string();
    }
    apply!(config.media.files_dir, file.media.files_dir);
    apply!(config.media.trash_dir, file.media.trash_dir);

    Ok(config)
}
