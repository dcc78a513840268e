//! SFU Configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Empty rooms older than this are swept
    pub empty_room_ttl_secs: u64,
    /// First loopback port handed to recorders
    pub recorder_port_min: u16,
    /// Last loopback port handed to recorders (inclusive)
    pub recorder_port_max: u16,
    /// Wait before resuming relay consumers so the recorder can bind its sockets
    pub resume_delay_ms: u64,
    pub recorder: RecorderSettings,
}

/// How recorder processes are invoked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderSettings {
    pub ffmpeg_path: String,
    pub output_dir: PathBuf,
    pub container: String,
    pub log_level: String,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            output_dir: PathBuf::from("./files"),
            container: "webm".to_string(),
            log_level: "warning".to_string(),
        }
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self {
            max_rooms: 0,
            empty_room_ttl_secs: 300,
            recorder_port_min: 20000,
            recorder_port_max: 29998,
            resume_delay_ms: 1000,
            recorder: RecorderSettings::default(),
        }
    }
}

impl SfuConfig {
    #[must_use]
    pub const fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.resume_delay_ms)
    }

    #[must_use]
    pub const fn empty_room_ttl(&self) -> Duration {
        Duration::from_secs(self.empty_room_ttl_secs)
    }
}

impl From<&debate_core::Config> for SfuConfig {
    fn from(config: &debate_core::Config) -> Self {
        Self {
            max_rooms: config.rooms.max_rooms,
            empty_room_ttl_secs: config.rooms.empty_room_ttl_secs,
            recorder_port_min: config.ports.min,
            recorder_port_max: config.ports.max,
            resume_delay_ms: config.recording.resume_delay_ms,
            recorder: RecorderSettings {
                ffmpeg_path: config.recording.ffmpeg_path.clone(),
                output_dir: PathBuf::from(&config.recording.output_dir),
                container: config.recording.container.clone(),
                log_level: config.recording.log_level.clone(),
            },
        }
    }
}
