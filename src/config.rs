use serde::{Deserialize, Serialize};
use std::fs;
use std::collections::HashMap;
use std::path::PathBuf;
use crate::errors::{Result, EdgeError};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub credentials: Vec<Credentials>,
    pub vision: Option<VisionConfig>,
    pub gateway: Option<GatewayConfig>,
    pub mqtt: Option<MqttConfig>,
    #[serde(default)]
    pub ffmpeg: FfmpegConfig,
    /// Seed values for the runtime configuration store, inserted only when missing
    #[serde(default)]
    pub defaults: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub database_path: String,
    /// Root for client directories (faces, raw recording, clips) and kiosk sessions
    pub media_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64, // per socket, capped at 1000
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64, // whole reachability check, capped at 3000
    #[serde(default = "default_multicast_wait_ms")]
    pub multicast_wait_ms: u64,
    #[serde(default = "default_scan_concurrency")]
    pub scan_concurrency: usize,
    /// Local IPv4 address of the interface facing the cameras (multicast egress)
    pub interface: Option<String>,
}

fn default_ports() -> Vec<u16> { vec![80, 554, 8000, 8080, 8899] }
fn default_connect_timeout_ms() -> u64 { 1000 }
fn default_probe_timeout_ms() -> u64 { 3000 }
fn default_multicast_wait_ms() -> u64 { 3000 }
fn default_scan_concurrency() -> usize { 64 }

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            subnets: Vec::new(),
            ports: default_ports(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            multicast_wait_ms: default_multicast_wait_ms(),
            scan_concurrency: default_scan_concurrency(),
            interface: None,
        }
    }
}

impl NetworkConfig {
    pub fn socket_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.connect_timeout_ms.min(1000))
    }

    pub fn probe_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.probe_timeout_ms.min(3000))
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &format!("[{} chars]", self.password.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub base_url: String,
    #[serde(default = "default_vision_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_vision_timeout_ms() -> u64 { 2000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// go2rtc-compatible API base, e.g. http://127.0.0.1:1984
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_url: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub publish_interval_secs: u64,
    pub max_packet_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfmpegConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_silence_noise")]
    pub silence_noise: String, // silencedetect noise floor, e.g. "-30dB"
    #[serde(default = "default_silence_min_duration")]
    pub silence_min_duration: f64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default)]
    pub log_stderr: bool,
}

fn default_ffmpeg_path() -> String { "ffmpeg".to_string() }
fn default_ffprobe_path() -> String { "ffprobe".to_string() }
fn default_rtsp_transport() -> String { "tcp".to_string() }
fn default_silence_noise() -> String { "-30dB".to_string() }
fn default_silence_min_duration() -> f64 { 0.5 }
fn default_stop_grace_secs() -> u64 { 5 }

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            rtsp_transport: default_rtsp_transport(),
            silence_noise: default_silence_noise(),
            silence_min_duration: default_silence_min_duration(),
            stop_grace_secs: default_stop_grace_secs(),
            log_stderr: false,
        }
    }
}

/// Per-camera tuning persisted with the camera record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraTuning {
    pub crop: Option<CropRect>,
    pub scale: Option<f32>,
    #[serde(default)]
    pub rotation: u16, // 0, 90, 180 or 270 degrees clockwise
    #[serde(default)]
    pub frame_skip: u32,
    pub target_width: Option<u32>,
    pub fps: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl MqttConfig {
    pub fn substitute_variables(&mut self) {
        let hostname = gethostname::gethostname()
            .to_string_lossy()
            .to_string();

        self.base_topic = self.base_topic.replace("${hostname}", &hostname);
        self.client_id = self.client_id.replace("${hostname}", &hostname);

        info!("MQTT config substituted: base_topic = {}, client_id = {}",
              self.base_topic, self.client_id);
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content, path.ends_with(".json"))
    }

    pub fn parse(content: &str, is_json: bool) -> Result<Self> {
        let mut config: Config = if is_json {
            serde_json::from_str(content)?
        } else {
            toml::from_str(content)?
        };

        if let Some(ref mut mqtt) = config.mqtt {
            mqtt.substitute_variables();
        }

        config.validate()?;
        Ok(config)
    }

    /// Only the coordinator's own paths are fatal; everything per-camera degrades at runtime
    fn validate(&self) -> Result<()> {
        if self.server.database_path.trim().is_empty() {
            return Err(EdgeError::config("server.database_path is required"));
        }
        if self.server.media_root.trim().is_empty() {
            return Err(EdgeError::config("server.media_root is required"));
        }
        for subnet in &self.network.subnets {
            crate::utils::parse_cidr(subnet)?;
        }
        Ok(())
    }

    pub fn media_root(&self) -> PathBuf {
        PathBuf::from(&self.server.media_root)
    }

    /// Defaults flattened to the string form stored in the runtime store
    pub fn default_entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = self.defaults.iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        credentials = [
            { username = "admin", password = "admin" },
            { username = "admin", password = "12345" },
        ]

        [server]
        database_path = "data/edge.db"
        media_root = "media"

        [network]
        subnets = ["192.168.1.0/24"]

        [defaults]
        "detection.min_start_faces" = 20
        "recognition.threshold" = 0.6
        "probe.interval" = "30s"
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = Config::parse(SAMPLE, false).unwrap();
        assert_eq!(config.credentials.len(), 2);
        assert_eq!(config.network.ports, default_ports());
        assert_eq!(config.ffmpeg.ffmpeg_path, "ffmpeg");
        assert!(config.mqtt.is_none());

        let entries = config.default_entries();
        assert!(entries.contains(&("detection.min_start_faces".to_string(), "20".to_string())));
        assert!(entries.contains(&("probe.interval".to_string(), "30s".to_string())));
    }

    #[test]
    fn test_missing_media_root_is_fatal() {
        let content = r#"
            [server]
            database_path = "edge.db"
            media_root = ""
        "#;
        assert!(Config::parse(content, false).is_err());
    }

    #[test]
    fn test_timeouts_are_capped() {
        let network = NetworkConfig {
            connect_timeout_ms: 5000,
            probe_timeout_ms: 9000,
            ..NetworkConfig::default()
        };
        assert_eq!(network.socket_timeout(), std::time::Duration::from_secs(1));
        assert_eq!(network.probe_timeout(), std::time::Duration::from_secs(3));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let creds = Credentials { username: "admin".into(), password: "secret".into() };
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("secret"));
    }
}
