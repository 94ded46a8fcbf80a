//! Configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use voxlink_agent::{AgentOverrides, ConnectionOptions, LlmOverrides};
use voxlink_audio::AudioConfig;
use voxlink_vad::MonitorConfig;

use crate::socket_utils;

/// Environment variable that overrides `signed_url`
pub const SIGNED_URL_ENV: &str = "VOXLINK_SIGNED_URL";

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to configuration file
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Unix socket path for control commands
    pub socket_path: String,

    /// Pre-authorized agent URL (ws:// or wss://)
    pub signed_url: Option<String>,

    /// Voice override sent with the client-init frame
    pub voice_id: Option<String>,

    /// First thing the agent says
    pub first_message: Option<String>,

    pub llm_temperature: Option<f32>,

    pub llm_prompt: Option<String>,

    /// Session sample rate for microphone audio
    pub sample_rate: u32,

    /// Audio device index (None = default device)
    pub audio_device_index: Option<usize>,

    /// Keep the last 10 seconds of mic audio for `playback`
    pub debug_recording: bool,

    /// Stop the agent when the user talks over it
    pub interruption_enabled: bool,

    /// RMS level that counts as speech
    pub vad_threshold: f32,

    /// Loud chunks in a row before interrupting
    pub vad_required_consecutive: u32,

    /// Minimum gap between interruptions (milliseconds)
    pub vad_cooldown_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let monitor = MonitorConfig::default();
        Self {
            config_path: Self::default_config_path(),
            socket_path: default_socket_path(),
            signed_url: None,
            voice_id: None,
            first_message: None,
            llm_temperature: None,
            llm_prompt: None,
            sample_rate: voxlink_audio::TARGET_SAMPLE_RATE,
            audio_device_index: None,
            debug_recording: false,
            interruption_enabled: monitor.enabled,
            vad_threshold: monitor.threshold,
            vad_required_consecutive: monitor.required_consecutive,
            vad_cooldown_ms: monitor.cooldown.as_millis() as u64,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default location, or create it
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_config_path())
    }

    /// Load configuration from `config_path`, writing defaults if missing
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;

            toml::from_str::<DaemonConfig>(&contents).context("Failed to parse config file")?
        } else {
            let config = DaemonConfig {
                config_path: config_path.to_path_buf(),
                ..Self::default()
            };
            config.save().context("Failed to save default config")?;
            config
        };

        config.config_path = config_path.to_path_buf();
        config.apply_env();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(&self.config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SIGNED_URL_ENV) {
            if !url.trim().is_empty() {
                self.signed_url = Some(url.trim().to_string());
            }
        }
    }

    /// Seed for the connection options builder
    pub fn connection_options(&self) -> ConnectionOptions {
        let mut options = ConnectionOptions::new();

        if let Some(voice_id) = &self.voice_id {
            options = options.with_voice(voice_id.as_str());
        }

        if let Some(first_message) = &self.first_message {
            options = options.with_agent(AgentOverrides::default().first_message(first_message.as_str()));
        }

        let mut llm = LlmOverrides::default();
        if let Some(temperature) = self.llm_temperature {
            llm = llm.temperature(temperature);
        }
        if let Some(prompt) = &self.llm_prompt {
            llm = llm.prompt(prompt.as_str());
        }
        options.with_llm(llm)
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig::default()
            .threshold(self.vad_threshold)
            .required_consecutive(self.vad_required_consecutive)
            .cooldown(Duration::from_millis(self.vad_cooldown_ms))
            .enabled(self.interruption_enabled)
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.sample_rate,
            device_index: self.audio_device_index,
            ..AudioConfig::default()
        }
    }

    /// Get default config path
    fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxlink")
            .join("config.toml")
    }
}

fn default_socket_path() -> String {
    socket_utils::get_ipc_socket_path()
        .unwrap_or_else(|_| std::env::temp_dir().join(socket_utils::SOCKET_NAME))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_match_monitor() {
        let config = DaemonConfig::default();
        assert_eq!(config.sample_rate, 16000);
        assert_eq!(config.monitor_config(), MonitorConfig::default());
        assert!(config.socket_path.ends_with("voxlink.sock"));
    }

    #[test]
    fn test_load_writes_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = DaemonConfig::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.config_path, path);
        assert_eq!(config.vad_cooldown_ms, 1000);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = DaemonConfig::load_from(&path).unwrap();
        config.voice_id = Some("voice-7".into());
        config.vad_threshold = 0.05;
        config.debug_recording = true;
        config.save().unwrap();

        let reloaded = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(reloaded.voice_id.as_deref(), Some("voice-7"));
        assert_eq!(reloaded.vad_threshold, 0.05);
        assert!(reloaded.debug_recording);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "vad_required_consecutive = 5\n").unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.vad_required_consecutive, 5);
        assert_eq!(config.vad_cooldown_ms, 1000);
        assert!(config.interruption_enabled);
    }

    #[test]
    fn test_connection_options_seeded() {
        let config = DaemonConfig {
            voice_id: Some("v".into()),
            first_message: Some("Hello there".into()),
            llm_temperature: Some(0.3),
            ..DaemonConfig::default()
        };

        let options = config.connection_options();
        assert_eq!(options.voice_id(), Some("v"));
        assert_eq!(options.agent().first_message.as_deref(), Some("Hello there"));
        assert_eq!(options.llm().temperature, Some(0.3));
        assert_eq!(options.llm().prompt, None);
    }
}
