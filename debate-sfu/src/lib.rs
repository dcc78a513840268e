//! Debate SFU (Selective Forwarding Unit)
//!
//! Control plane of a debate media server: participants join a room, are
//! seated on a team/order grid, publish audio and video through a shared
//! router, and once the owner starts the debate every seated participant is
//! recorded while the turn script plays out. When the last recording has
//! finished, a report is handed to the render pipeline.
//!
//! ## Architecture
//!
//! - **`RoomRegistry`**: process-wide map of rooms, creation and deletion
//! - **`Room`**: seat grid, phase, turn playback and the completion barrier
//! - **`Peer`**: one participant's transports, producers, consumers and recording
//! - **`RecordingProcess`**: a supervised recorder fed over loopback RTP relays
//! - **`PortAllocator`**: loopback ports shared by all relays
//!
//! The media engine sits behind the traits in [`media`]; with the `mediasoup`
//! feature a mediasoup worker pool backs them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use debate_sfu::{RoomRegistry, SfuConfig, FfmpegLauncher, LogReportSink};
//!
//! let config = SfuConfig::default();
//! let launcher = Arc::new(FfmpegLauncher::new(config.recorder.clone()));
//! let registry = RoomRegistry::new(config, engine, launcher, Arc::new(LogReportSink));
//! let room = registry.create_room(RoomId::from("final"), "owner-socket", None).await?;
//! let joined = registry.join(room.id(), peer_id, "alice", channel)?;
//! ```

pub mod barrier;
pub mod config;
pub mod error;
pub mod manager;
pub mod media;
pub mod peer;
pub mod ports;
pub mod recording;
pub mod report;
pub mod room;
pub mod rule;
pub mod signal;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod test_helpers;

#[cfg(test)]
mod scenario_tests;

pub use barrier::RecordingBarrier;
pub use config::{RecorderSettings, SfuConfig};
pub use error::{ErrorCode, Result, SfuError};
pub use manager::{JoinResponse, RegistryStats, RoomRegistry};
pub use media::{MediaEngine, MediaKind, MediaRouter};
pub use peer::{ConsumerParams, Peer, PeerSnapshot};
pub use ports::PortAllocator;
pub use recording::{FfmpegLauncher, RecordingOutcome, RecordingProcess, RecordingServices};
pub use report::{LogReportSink, RecordReport, RedisReportQueue, ReportSink};
pub use room::{Room, RoomPhase, RoomSnapshot};
pub use rule::{Debate, RuleEntry};
pub use signal::{PeerChannel, ProducerAnnouncement, ServerEvent};
pub use types::{ConsumerId, PeerId, ProducerId, RoomId, Seat, TransportId};

#[cfg(feature = "mediasoup")]
pub use media::mediasoup_engine::{MediasoupEngine, MediasoupSettings};
