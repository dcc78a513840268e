//! FFmpeg recorder
//!
//! FFmpeg reads the SDP from stdin, listens on the relay ports it names and
//! remuxes the streams into one container per peer without transcoding.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::process::{RecorderChild, RecorderExit, RecorderLauncher};
use super::RecordingDescription;
use crate::config::RecorderSettings;
use crate::error::{Result, SfuError};

/// Builds the ffmpeg argument list for one recording
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    settings: RecorderSettings,
}

impl FfmpegCommand {
    #[must_use]
    pub const fn new(settings: RecorderSettings) -> Self {
        Self { settings }
    }

    #[must_use]
    pub fn output_path(&self, description: &RecordingDescription) -> PathBuf {
        self.settings
            .output_dir
            .join(format!("{}.{}", description.file_name, self.settings.container))
    }

    #[must_use]
    pub fn args(&self, description: &RecordingDescription) -> Vec<String> {
        let mut args: Vec<String> = [
            "-loglevel",
            self.settings.log_level.as_str(),
            "-protocol_whitelist",
            "pipe,udp,rtp",
            "-fflags",
            "+discardcorrupt+genpts",
            "-use_wallclock_as_timestamps",
            "1",
            "-f",
            "sdp",
            "-i",
            "pipe:0",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        if description.video.is_some() {
            args.extend(["-map", "0:v:0", "-c:v", "copy"].map(String::from));
        }
        if description.audio.is_some() {
            args.extend(["-map", "0:a:0", "-strict", "-2", "-c:a", "copy"].map(String::from));
        }

        args.extend(["-flags", "+global_header"].map(String::from));
        args.push(self.output_path(description).to_string_lossy().into_owned());
        args
    }
}

/// Spawns ffmpeg through `tokio::process`
pub struct FfmpegLauncher {
    ffmpeg_path: String,
    output_dir: PathBuf,
    command: FfmpegCommand,
}

impl FfmpegLauncher {
    #[must_use]
    pub fn new(settings: RecorderSettings) -> Self {
        Self {
            ffmpeg_path: settings.ffmpeg_path.clone(),
            output_dir: settings.output_dir.clone(),
            command: FfmpegCommand::new(settings),
        }
    }
}

impl RecorderLauncher for FfmpegLauncher {
    fn output_path(&self, description: &RecordingDescription) -> PathBuf {
        self.command.output_path(description)
    }

    fn launch(&self, description: &RecordingDescription, sdp: String) -> Result<Box<dyn RecorderChild>> {
        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            SfuError::Process(format!(
                "Failed to create recording directory {}: {e}",
                self.output_dir.display()
            ))
        })?;

        let args = self.command.args(description);
        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SfuError::Process(format!("Failed to start {}: {e}", self.ffmpeg_path)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| SfuError::Process("Failed to capture FFmpeg stdin".to_string()))?;

        let file_name = description.file_name.clone();
        info!(
            file_name = %file_name,
            pid = ?child.id(),
            output = %self.command.output_path(description).display(),
            "Recorder started"
        );

        tokio::spawn(async move {
            // Dropping stdin afterwards closes the pipe so ffmpeg stops reading the SDP
            if let Err(e) = stdin.write_all(sdp.as_bytes()).await {
                warn!(error = %e, "Failed to write SDP to recorder");
            }
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "recorder", file_name = %file_name, "{line}");
                }
            });
        }

        Ok(Box::new(FfmpegChild { child }))
    }
}

struct FfmpegChild {
    child: Child,
}

#[async_trait]
impl RecorderChild for FfmpegChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<RecorderExit> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| SfuError::Process(format!("Failed to wait for recorder: {e}")))?;
        Ok(RecorderExit {
            success: status.success(),
            code: status.code(),
        })
    }

    /// SIGINT lets ffmpeg write the container trailer before exiting
    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|_| SfuError::Process(format!("pid {pid} out of range")))?;
        kill(Pid::from_raw(pid), Signal::SIGINT)
            .map_err(|e| SfuError::Process(format!("Failed to signal recorder: {e}")))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        self.child
            .start_kill()
            .map_err(|e| SfuError::Process(format!("Failed to kill recorder: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, RtpCodecInfo};
    use crate::recording::RelayDescriptor;
    use crate::types::ConsumerId;

    fn settings() -> RecorderSettings {
        RecorderSettings {
            ffmpeg_path: "ffmpeg".into(),
            output_dir: PathBuf::from("/data/files"),
            container: "webm".into(),
            log_level: "warning".into(),
        }
    }

    fn relay(kind: MediaKind) -> RelayDescriptor {
        RelayDescriptor {
            kind,
            port: 20000,
            rtcp_port: None,
            codec: RtpCodecInfo {
                payload_type: 100,
                codec_name: "opus".into(),
                clock_rate: 48000,
                channels: Some(2),
            },
            consumer_id: ConsumerId::from("c"),
        }
    }

    #[test]
    fn test_args_map_only_present_kinds() {
        let command = FfmpegCommand::new(settings());
        let mut description = RecordingDescription::new("peer-a");
        description.insert(relay(MediaKind::Audio));

        let args = command.args(&description);
        assert!(args.windows(2).any(|w| w == ["-map", "0:a:0"]));
        assert!(!args.iter().any(|a| a == "0:v:0"));
        assert!(args.windows(2).any(|w| w == ["-i", "pipe:0"]));
        assert!(args.windows(2).any(|w| w == ["-loglevel", "warning"]));
        assert_eq!(args.last().map(String::as_str), Some("/data/files/peer-a.webm"));
    }

    #[test]
    fn test_args_with_video_and_audio() {
        let command = FfmpegCommand::new(settings());
        let mut description = RecordingDescription::new("peer-b");
        description.insert(relay(MediaKind::Audio));
        description.insert(relay(MediaKind::Video));

        let args = command.args(&description);
        let video = args.iter().position(|a| a == "0:v:0").unwrap();
        let audio = args.iter().position(|a| a == "0:a:0").unwrap();
        assert!(video < audio);
        assert!(args.windows(2).any(|w| w == ["-c:v", "copy"]));
        assert!(args.windows(2).any(|w| w == ["-flags", "+global_header"]));
    }

    #[test]
    fn test_output_path_uses_container() {
        let mut custom = settings();
        custom.container = "mkv".into();
        let command = FfmpegCommand::new(custom);
        let description = RecordingDescription::new("x");
        assert_eq!(command.output_path(&description), PathBuf::from("/data/files/x.mkv"));
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = FfmpegLauncher::new(RecorderSettings {
            ffmpeg_path: "/nonexistent/ffmpeg-binary".into(),
            output_dir: dir.path().to_path_buf(),
            container: "webm".into(),
            log_level: "warning".into(),
        });
        let mut description = RecordingDescription::new("peer");
        description.insert(relay(MediaKind::Audio));

        let result = launcher.launch(&description, "v=0\r\n".into());
        assert!(matches!(result, Err(SfuError::Process(_))));
    }
}
