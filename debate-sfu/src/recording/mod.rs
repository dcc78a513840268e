//! Per-peer recording: relay descriptions, the SDP handed to the recorder,
//! the recorder command line and the supervised recorder process.

pub mod ffmpeg;
pub mod process;
pub mod sdp;

pub use ffmpeg::{FfmpegCommand, FfmpegLauncher};
pub use process::{RecorderChild, RecorderExit, RecorderLauncher, RecordingProcess};
pub use sdp::create_sdp_text;

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;

use crate::media::{MediaKind, RtpCodecInfo};
use crate::ports::PortAllocator;
use crate::types::{ConsumerId, PeerId, RoomId};

/// Process-wide recording resources shared by every peer
#[derive(Clone)]
pub struct RecordingServices {
    pub ports: Arc<PortAllocator>,
    pub launcher: Arc<dyn RecorderLauncher>,
    /// Wait before resuming relay consumers so the recorder has bound its sockets
    pub resume_delay: Duration,
    /// Recorder supervisors and report deliveries, awaited on shutdown
    pub tasks: TaskTracker,
}

impl std::fmt::Debug for RecordingServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingServices")
            .field("ports_in_use", &self.ports.in_use())
            .field("resume_delay", &self.resume_delay)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

/// One relayed stream: where the recorder listens and what it receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayDescriptor {
    pub kind: MediaKind,
    pub port: u16,
    pub rtcp_port: Option<u16>,
    pub codec: RtpCodecInfo,
    pub consumer_id: ConsumerId,
}

/// Everything a recorder needs for one peer: at most one stream per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordingDescription {
    /// Output file stem, the peer id
    pub file_name: String,
    pub audio: Option<RelayDescriptor>,
    pub video: Option<RelayDescriptor>,
}

impl RecordingDescription {
    #[must_use]
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    /// Slot a relay under its kind, returning the one it displaced
    pub fn insert(&mut self, relay: RelayDescriptor) -> Option<RelayDescriptor> {
        match relay.kind {
            MediaKind::Audio => self.audio.replace(relay),
            MediaKind::Video => self.video.replace(relay),
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

/// How a peer's recording ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordingOutcome {
    Completed { file_path: PathBuf },
    Failed { reason: String },
    /// Torn down because the peer left mid-recording
    Aborted,
}

impl RecordingOutcome {
    #[must_use]
    pub const fn is_recorded(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Context handed to a completion handler
#[derive(Debug, Clone)]
pub struct RecordingDone {
    pub room_id: RoomId,
    pub peer_id: PeerId,
    pub outcome: RecordingOutcome,
}

type CompletionFn = Box<dyn FnOnce(RecordingDone) + Send>;

/// Fires its handler at most once, whichever path (process exit, setup
/// failure, teardown) gets there first.
#[derive(Clone)]
pub struct CompletionHandle {
    room_id: RoomId,
    peer_id: PeerId,
    handler: Arc<Mutex<Option<CompletionFn>>>,
}

impl CompletionHandle {
    pub fn new(
        room_id: RoomId,
        peer_id: PeerId,
        handler: impl FnOnce(RecordingDone) + Send + 'static,
    ) -> Self {
        Self {
            room_id,
            peer_id,
            handler: Arc::new(Mutex::new(Some(Box::new(handler)))),
        }
    }

    /// Returns false if the handler already ran
    pub fn fire(&self, outcome: RecordingOutcome) -> bool {
        let handler = self.handler.lock().take();
        match handler {
            Some(handler) => {
                handler(RecordingDone {
                    room_id: self.room_id.clone(),
                    peer_id: self.peer_id.clone(),
                    outcome,
                });
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_fired(&self) -> bool {
        self.handler.lock().is_none()
    }
}

impl std::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("room_id", &self.room_id)
            .field("peer_id", &self.peer_id)
            .field("fired", &self.is_fired())
            .finish()
    }
}
