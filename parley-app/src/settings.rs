//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{
    CaptureConfig, PlaybackConfig, SessionConfig, TransportConfig, VadConfig,
};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER_URL: &str = "ws://localhost:5050/ws";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub server_url: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub vad_threshold: f32,
    pub vad_debounce_ms: u64,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    pub noise_gate_floor: f32,
    pub playback_sample_rate: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// 0 disables the heartbeat.
    pub heartbeat_interval_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            vad_threshold: 30.0,
            vad_debounce_ms: 500,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            noise_gate_floor: 0.002,
            playback_sample_rate: 24_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_secs: 20,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.server_url = normalize_server_url(&self.server_url);
        self.preferred_input_device = normalize_device(self.preferred_input_device.as_deref());
        self.preferred_output_device = normalize_device(self.preferred_output_device.as_deref());
        self.vad_threshold = if self.vad_threshold.is_finite() {
            self.vad_threshold.clamp(1.0, 255.0)
        } else {
            30.0
        };
        self.vad_debounce_ms = self.vad_debounce_ms.clamp(50, 5_000);
        self.noise_gate_floor = if self.noise_gate_floor.is_finite() {
            self.noise_gate_floor.clamp(0.0, 0.1)
        } else {
            0.002
        };
        self.playback_sample_rate = self.playback_sample_rate.clamp(8_000, 96_000);
        self.max_reconnect_attempts = self.max_reconnect_attempts.min(20);
        self.reconnect_base_delay_ms = self.reconnect_base_delay_ms.clamp(100, 60_000);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(500, 120_000);
        self.heartbeat_interval_secs = self.heartbeat_interval_secs.min(600);
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            transport: TransportConfig {
                url: self.server_url.clone(),
                max_reconnect_attempts: self.max_reconnect_attempts,
                reconnect_base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                heartbeat_interval: (self.heartbeat_interval_secs > 0)
                    .then(|| Duration::from_secs(self.heartbeat_interval_secs)),
            },
            capture: CaptureConfig {
                echo_cancellation: self.echo_cancellation,
                noise_suppression: self.noise_suppression,
                auto_gain_control: self.auto_gain_control,
                noise_gate_floor: self.noise_gate_floor,
                preferred_device: self.preferred_input_device.clone(),
                ..CaptureConfig::default()
            },
            vad: VadConfig {
                threshold: self.vad_threshold,
                debounce: Duration::from_millis(self.vad_debounce_ms),
                ..VadConfig::default()
            },
            playback: PlaybackConfig {
                default_sample_rate: self.playback_sample_rate,
                preferred_device: self.preferred_output_device.clone(),
            },
        }
    }
}

pub fn normalize_server_url(raw: &str) -> String {
    let url = raw.trim();
    if url.starts_with("ws://") || url.starts_with("wss://") {
        url.into()
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        DEFAULT_SERVER_URL.into()
    }
}

fn normalize_device(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("default"))
        .map(str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
