use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Result, Context};
use log::{info, warn, error};

use crate::capture::{CaptureSettings, SignalConfig, DEFAULT_FRAME_BYTES, DEFAULT_SAMPLE_RATE};
use crate::clock::DEFAULT_MIN_VALID_EPOCH_SECS;
use crate::failover::{
    BackoffTable, FailoverPolicy, HostConfiguration, DEFAULT_BACKOFF_MS, DEFAULT_FAILOVER_THRESHOLD,
    DEFAULT_PRIMARY_RETRY_AFTER_MS,
};
use crate::playback::DEFAULT_VOLUME;
use crate::streaming::StreamingSettings;
use crate::transport::TransportConfig;

const APP_DIR: &str = "companion";

/// Persistent application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceSettings,
    pub hosts: HostSettings,
    pub transport: TransportSettings,
    pub failover: FailoverSettings,
    pub audio: AudioSettings,
    pub alerting: AlertingSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    pub device_id: String,
    /// Child profile this device pairs for
    pub child_id: String,
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub primary: String,
    pub secondary: Option<String>,
    pub port: u16,
    pub pairing_path: String,
    pub streaming_path: String,
    pub alert_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Debug builds only; release builds refuse to connect when set
    pub allow_insecure: bool,
    pub min_valid_epoch_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    pub threshold: u32,
    pub backoff_ms: Vec<u64>,
    pub primary_retry_after_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub frame_bytes: usize,
    pub sample_rate: u32,
    pub queue_capacity: usize,
    pub max_recording_ms: u64,
    pub gain_target: f32,
    pub max_gain: f32,
    pub vad_threshold: f32,
    pub noise_gate: f32,
    pub playback_volume: u8,
    pub processing_timeout_ms: u64,
    pub recovery_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingSettings {
    pub cooldown_secs: u64,
    /// Consecutive remote delivery failures before alerts divert to the fallback file
    pub remote_failure_limit: u32,
    pub audit_log_path: Option<PathBuf>,
    pub fallback_path: Option<PathBuf>,
    pub lockdown_enabled: bool,
    pub housekeeping_interval_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub state_path: Option<PathBuf>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: "companion-dev-0001".to_string(),
            child_id: String::new(),
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            primary: "api.companion.example".to_string(),
            secondary: None,
            port: 443,
            pairing_path: "/api/v1/devices/pair".to_string(),
            streaming_path: "/ws/audio".to_string(),
            alert_path: "/api/v1/devices/alerts".to_string(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            connect_timeout_ms: transport.connect_timeout_ms,
            request_timeout_ms: transport.request_timeout_ms,
            allow_insecure: false,
            min_valid_epoch_secs: DEFAULT_MIN_VALID_EPOCH_SECS,
        }
    }
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_FAILOVER_THRESHOLD,
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            primary_retry_after_ms: DEFAULT_PRIMARY_RETRY_AFTER_MS,
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        let signal = SignalConfig::default();
        Self {
            frame_bytes: DEFAULT_FRAME_BYTES,
            sample_rate: DEFAULT_SAMPLE_RATE,
            queue_capacity: 32,
            max_recording_ms: 30_000,
            gain_target: signal.gain_target,
            max_gain: signal.max_gain,
            vad_threshold: signal.vad_threshold,
            noise_gate: signal.noise_gate,
            playback_volume: DEFAULT_VOLUME,
            processing_timeout_ms: 30_000,
            recovery_attempts: 3,
        }
    }
}

impl Default for AlertingSettings {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            remote_failure_limit: 3,
            audit_log_path: None,
            fallback_path: None,
            lockdown_enabled: true,
            housekeeping_interval_secs: 15,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl AppConfig {
    /// Reject settings the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.device.device_id.trim().is_empty() {
            bail!("device.device_id must not be empty");
        }
        self.host_configuration().validate().context("hosts")?;
        if self.hosts.port == 0 {
            bail!("hosts.port must not be 0");
        }
        if self.failover.threshold == 0 {
            bail!("failover.threshold must be at least 1");
        }
        BackoffTable::new(&self.failover.backoff_ms).context("failover.backoff_ms")?;
        if self.transport.connect_timeout_ms == 0 || self.transport.request_timeout_ms == 0 {
            bail!("transport timeouts must be non-zero");
        }
        if self.audio.queue_capacity == 0 {
            bail!("audio.queue_capacity must be at least 1");
        }
        if self.audio.frame_bytes < 2 || self.audio.frame_bytes % 2 != 0 {
            bail!("audio.frame_bytes must be a positive even number");
        }
        if self.audio.sample_rate == 0 {
            bail!("audio.sample_rate must be non-zero");
        }
        if self.audio.playback_volume > 100 {
            bail!("audio.playback_volume must be 0-100");
        }
        if self.audio.processing_timeout_ms == 0 {
            bail!("audio.processing_timeout_ms must be non-zero");
        }
        Ok(())
    }

    pub fn host_configuration(&self) -> HostConfiguration {
        HostConfiguration::new(
            self.hosts.primary.clone(),
            self.hosts.secondary.as_deref().filter(|s| !s.trim().is_empty()),
            self.hosts.port,
        )
    }

    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout_ms: self.transport.connect_timeout_ms,
            request_timeout_ms: self.transport.request_timeout_ms,
            allow_insecure: self.transport.allow_insecure,
        }
    }

    pub fn to_failover_policy(&self) -> Result<FailoverPolicy> {
        Ok(FailoverPolicy {
            threshold: self.failover.threshold,
            backoff: BackoffTable::new(&self.failover.backoff_ms).context("failover.backoff_ms")?,
            primary_retry_after: Duration::from_millis(self.failover.primary_retry_after_ms),
        })
    }

    pub fn to_capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            frame_bytes: self.audio.frame_bytes,
            sample_rate: self.audio.sample_rate,
            max_recording: Duration::from_millis(self.audio.max_recording_ms),
            signal: SignalConfig {
                gain_target: self.audio.gain_target,
                max_gain: self.audio.max_gain,
                vad_threshold: self.audio.vad_threshold,
                noise_gate: self.audio.noise_gate,
            },
            ..CaptureSettings::default()
        }
    }

    pub fn to_streaming_settings(&self) -> StreamingSettings {
        StreamingSettings {
            path: self.hosts.streaming_path.clone(),
            queue_capacity: self.audio.queue_capacity,
            send_timeout: Duration::from_millis(self.transport.request_timeout_ms),
            processing_timeout: Duration::from_millis(self.audio.processing_timeout_ms),
            volume: self.audio.playback_volume,
            recovery_attempts: self.audio.recovery_attempts,
            ..StreamingSettings::default()
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.storage
            .state_path
            .clone()
            .unwrap_or_else(|| data_dir().join("state.toml"))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.alerting
            .audit_log_path
            .clone()
            .unwrap_or_else(|| data_dir().join("audit.jsonl"))
    }

    pub fn fallback_path(&self) -> PathBuf {
        self.alerting
            .fallback_path
            .clone()
            .unwrap_or_else(|| data_dir().join("undelivered_alerts.jsonl"))
    }
}

/// Configuration manager for loading and saving settings
pub struct ConfigManager {
    config_path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    pub fn with_config(config: AppConfig) -> Self {
        Self {
            config_path: PathBuf::from("fallback_config.toml"),
            config,
        }
    }

    pub fn new() -> Result<Self> {
        let config_path = Self::get_config_path()?;
        Self::load_from(config_path)
    }

    pub fn load_from(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let config = Self::load_or_create_config(&config_path)?;

        Ok(Self {
            config_path,
            config,
        })
    }

    pub fn get_config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update_config(&mut self, config: AppConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save_config()
    }

    pub fn save_config(&self) -> Result<()> {
        Self::save_config_to_path(&self.config, &self.config_path)?;
        info!("Configuration saved to: {:?}", self.config_path);
        Ok(())
    }

    fn load_or_create_config(config_path: &Path) -> Result<AppConfig> {
        if config_path.exists() {
            info!("Loading configuration from: {:?}", config_path);
            let config_str = fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;

            match toml::from_str::<AppConfig>(&config_str) {
                Ok(config) => {
                    info!("Configuration loaded successfully");
                    Ok(config)
                }
                Err(e) => {
                    warn!("Failed to parse configuration file: {}. Using defaults.", e);
                    let default_config = AppConfig::default();
                    if let Err(save_err) = Self::save_config_to_path(&default_config, config_path) {
                        error!("Failed to save default configuration: {}", save_err);
                    }
                    Ok(default_config)
                }
            }
        } else {
            info!("No configuration file found. Creating default configuration.");
            let default_config = AppConfig::default();
            Self::save_config_to_path(&default_config, config_path)?;
            Ok(default_config)
        }
    }

    fn save_config_to_path(config: &AppConfig, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(config)
            .context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, config_str)
            .context("Failed to write configuration file")?;
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        let config_dir = if let Some(config_dir) = dirs::config_dir() {
            config_dir.join(APP_DIR)
        } else {
            // Fallback to home directory
            let home_dir = dirs::home_dir()
                .context("Could not determine home directory")?;
            home_dir.join(format!(".{}", APP_DIR))
        };

        Ok(config_dir.join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.audio.frame_bytes, 4096);
        assert_eq!(config.failover.threshold, 3);
        assert!(!config.host_configuration().has_secondary());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = AppConfig::default();
        config.hosts.secondary = Some("backup.companion.example".to_string());
        let serialized = toml::to_string_pretty(&config).unwrap();
        let restored: AppConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(restored.hosts.secondary.as_deref(), Some("backup.companion.example"));
        assert!(restored.host_configuration().has_secondary());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: AppConfig = toml::from_str("[hosts]\nprimary = \"api.example.org\"\n").unwrap();
        assert_eq!(config.hosts.primary, "api.example.org");
        assert_eq!(config.hosts.port, 443);
        assert_eq!(config.audio.queue_capacity, 32);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let mut config = AppConfig::default();
        config.failover.backoff_ms = vec![5_000, 1_000];
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.hosts.primary = String::new();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.hosts.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_blank_secondary_means_none() {
        let mut config = AppConfig::default();
        config.hosts.secondary = Some("  ".to_string());
        assert!(!config.host_configuration().has_secondary());
    }

    #[test]
    fn test_manager_creates_and_recovers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let manager = ConfigManager::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(manager.get_config().hosts.port, 443);

        fs::write(&path, "this is = = not toml").unwrap();
        let manager = ConfigManager::load_from(&path).unwrap();
        assert_eq!(manager.get_config().audio.sample_rate, 16_000);
        // the broken file was replaced with defaults
        assert!(toml::from_str::<AppConfig>(&fs::read_to_string(&path).unwrap()).is_ok());
    }
}
