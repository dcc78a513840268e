use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub ports: PortsConfig,
    pub recording: RecordingConfig,
    pub engine: EngineConfig,
    pub rooms: RoomsConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest signaling frame accepted from a client, in bytes
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Loopback ports handed to recorder processes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub min: u16,
    pub max: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: 20000,
            max: 29998,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub ffmpeg_path: String,
    pub output_dir: String,
    /// Container extension of the recorded files
    pub container: String,
    /// Delay before relay consumers are resumed, giving the recorder time to bind
    pub resume_delay_ms: u64,
    /// Value passed to the recorder's `-loglevel`
    pub log_level: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            output_dir: std::env::var("RECORD_FILE_LOCATION_PATH")
                .unwrap_or_else(|_| "./files".to_string()),
            container: "webm".to_string(),
            resume_delay_ms: 1000,
            log_level: "warning".to_string(),
        }
    }
}

/// Media engine (worker pool) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of media workers (0 = one per CPU)
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ip: String,
    /// Address announced in ICE candidates (public IP behind NAT)
    pub announced_address: Option<String>,
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
    /// Grace period before the process exits after a worker died
    pub worker_death_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            rtc_min_port: 10000,
            rtc_max_port: 10100,
            listen_ip: "0.0.0.0".to_string(),
            announced_address: Some("127.0.0.1".to_string()),
            max_incoming_bitrate: 1_500_000,
            initial_available_outgoing_bitrate: 1_000_000,
            worker_death_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomsConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Rooms nobody joined are dropped after this many seconds
    pub empty_room_ttl_secs: u64,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            empty_room_ttl_secs: 300,
        }
    }
}

/// Where finished recording reports are delivered
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Redis URL of the render queue; reports are only logged when empty
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            key_prefix: "debate:".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    ///
    /// Priority order:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Defaults
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // Override with environment variables (DEBATE_SERVER__PORT, etc.)
        builder = builder.add_source(
            Environment::with_prefix("DEBATE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check cross-field constraints, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if self.ports.min == 0 || self.ports.min > self.ports.max {
            errors.push(format!(
                "ports range {}..={} is empty or starts at 0",
                self.ports.min, self.ports.max
            ));
        }
        if self.engine.rtc_min_port > self.engine.rtc_max_port {
            errors.push(format!(
                "engine rtc port range {}..={} is empty",
                self.engine.rtc_min_port, self.engine.rtc_max_port
            ));
        }
        let recorder = self.ports.min..=self.ports.max;
        if recorder.contains(&self.engine.rtc_min_port) || recorder.contains(&self.engine.rtc_max_port) {
            errors.push("recorder ports overlap the engine rtc port range".to_string());
        }
        if self.recording.ffmpeg_path.trim().is_empty() {
            errors.push("recording.ffmpeg_path must not be empty".to_string());
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!("logging.format '{}' is not json or pretty", self.logging.format));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ports.min, 20000);
        assert_eq!(config.recording.container, "webm");
        assert_eq!(config.engine.worker_death_grace_ms, 2000);
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_message_size: 1024,
            },
            ..Default::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_collects_errors() {
        let mut config = Config::default();
        config.ports.min = 30000;
        config.ports.max = 20000;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_validate_rejects_overlapping_ranges() {
        let mut config = Config::default();
        config.engine.rtc_min_port = 20010;
        config.engine.rtc_max_port = 20100;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "server:\n  port: 4443\nports:\n  min: 21000\n  max: 21010").unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.port, 4443);
        assert_eq!(config.ports.min, 21000);
        assert_eq!(config.ports.max, 21010);
        // untouched sections keep their defaults
        assert_eq!(config.recording.resume_delay_ms, 1000);
    }
}
