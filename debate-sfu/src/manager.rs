//! Room registry - process-wide orchestration of debate rooms
//!
//! This module provides:
//! - Room creation and lookup with concurrent access
//! - Join / leave, deleting rooms once their last peer leaves
//! - Room limit enforcement
//! - Periodic sweep of rooms nobody joined
//! - Global statistics for health reporting

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::media::MediaEngine;
use crate::peer::Peer;
use crate::ports::PortAllocator;
use crate::recording::{RecorderLauncher, RecordingServices};
use crate::report::ReportSink;
use crate::room::{Room, RoomPhase, RoomSnapshot};
use crate::rule::Debate;
use crate::signal::PeerChannel;
use crate::types::{PeerId, RoomId};

/// Interval of the empty-room sweep
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Global registry statistics
#[derive(Debug, Clone, Serialize, Default)]
pub struct RegistryStats {
    /// Number of live rooms
    pub rooms: usize,
    /// Rooms whose debate is playing
    pub running_rooms: usize,
    /// Total number of peers across all rooms
    pub peers: usize,
    /// Recorder ports currently held
    pub recorder_ports_in_use: usize,
}

/// Answer to a successful join
#[derive(Debug, Clone, Serialize)]
pub struct JoinResponse {
    pub room: RoomSnapshot,
    pub team: usize,
    pub order: usize,
}

pub struct RoomRegistry {
    config: Arc<SfuConfig>,

    engine: Arc<dyn MediaEngine>,

    recording: RecordingServices,

    report_sink: Arc<dyn ReportSink>,

    /// Live rooms by external id
    rooms: DashMap<RoomId, Arc<Room>>,

    shutdown: CancellationToken,
}

impl RoomRegistry {
    /// Registry with a port allocator over the configured recorder range
    pub fn new(
        config: SfuConfig,
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn RecorderLauncher>,
        report_sink: Arc<dyn ReportSink>,
    ) -> Arc<Self> {
        let recording = RecordingServices {
            ports: Arc::new(PortAllocator::new(config.recorder_port_min, config.recorder_port_max)),
            launcher,
            resume_delay: config.resume_delay(),
            tasks: TaskTracker::new(),
        };
        Self::with_services(config, engine, recording, report_sink)
    }

    pub fn with_services(
        config: SfuConfig,
        engine: Arc<dyn MediaEngine>,
        recording: RecordingServices,
        report_sink: Arc<dyn ReportSink>,
    ) -> Arc<Self> {
        let registry = Arc::new(Self {
            config: Arc::new(config),
            engine,
            recording,
            report_sink,
            rooms: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        info!(
            max_rooms = registry.config.max_rooms,
            recorder_ports = registry.recording.ports.capacity(),
            "Room registry initialized"
        );
        registry
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Create a room owned by `owner`; `debate` defaults to the sample debate
    pub async fn create_room(&self, room_id: RoomId, owner: &str, debate: Option<Debate>) -> Result<Arc<Room>> {
        if self.rooms.contains_key(&room_id) {
            return Err(SfuError::AlreadyExists(room_id));
        }

        // Enforce room limit (0 = unlimited)
        if self.config.max_rooms > 0 && self.rooms.len() >= self.config.max_rooms {
            warn!(
                current_rooms = self.rooms.len(),
                max_rooms = self.config.max_rooms,
                "Room limit reached"
            );
            return Err(SfuError::Capacity("Maximum number of rooms reached".to_string()));
        }

        let debate = debate.unwrap_or_default();
        debate.validate()?;

        let router = self.engine.create_router().await?;

        // Another request may have created the room while the router was being made
        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(_) => {
                router.close();
                Err(SfuError::AlreadyExists(room_id))
            }
            Entry::Vacant(vacant) => {
                let room = match Room::new(
                    room_id.clone(),
                    owner,
                    debate,
                    Arc::clone(&router),
                    self.recording.clone(),
                    Arc::clone(&self.report_sink),
                ) {
                    Ok(room) => room,
                    Err(e) => {
                        router.close();
                        return Err(e);
                    }
                };
                vacant.insert(Arc::clone(&room));
                info!(room_id = %room_id, total_rooms = self.rooms.len(), "Created room");
                Ok(room)
            }
        }
    }

    pub fn get(&self, room_id: &RoomId) -> Result<Arc<Room>> {
        self.rooms
            .get(room_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SfuError::RoomNotFound(room_id.clone()))
    }

    /// Seat a new peer for connection `peer_id`
    pub fn join(&self, room_id: &RoomId, peer_id: PeerId, name: &str, channel: PeerChannel) -> Result<JoinResponse> {
        let room = self.get(room_id)?;
        let peer = Arc::new(Peer::new(
            peer_id,
            name,
            room_id.clone(),
            channel,
            self.recording.clone(),
        ));

        let seat = room
            .add_peer(peer)
            .map_err(|e| match e {
                // deleted between lookup and seating
                SfuError::Closed => SfuError::RoomNotFound(room_id.clone()),
                other => other,
            })
            .inspect_err(|e| {
                info!(room_id = %room_id, name = %name, error = %e, "User join failed");
            })?;

        Ok(JoinResponse {
            room: room.snapshot(),
            team: seat.team,
            order: seat.order,
        })
    }

    /// Remove a peer; the room goes away with its last peer
    pub fn leave(&self, room_id: &RoomId, peer_id: &PeerId) -> Result<Option<Arc<Peer>>> {
        let room = self.get(room_id)?;
        let removed = room.remove_peer(peer_id);
        self.remove_if_empty(room_id);
        Ok(removed)
    }

    /// Delete and close the room if nobody is in it. The room is marked
    /// closed under its own lock, so no join can slip in once it is chosen.
    pub fn remove_if_empty(&self, room_id: &RoomId) -> bool {
        match self.rooms.remove_if(room_id, |_, room| room.close_if_empty()) {
            Some((_, room)) => {
                room.close();
                info!(room_id = %room_id, remaining_rooms = self.rooms.len(), "Removed empty room");
                true
            }
            None => false,
        }
    }

    /// Get number of active rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            rooms: self.rooms.len(),
            recorder_ports_in_use: self.recording.ports.in_use(),
            ..Default::default()
        };
        for entry in &self.rooms {
            let room = entry.value();
            stats.peers += room.count();
            if room.phase() == RoomPhase::Running {
                stats.running_rooms += 1;
            }
        }
        stats
    }

    /// Remove empty rooms older than `min_age`
    pub fn cleanup_empty_rooms(&self, min_age: Duration) -> usize {
        let stale: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().is_empty() && entry.value().age() >= min_age)
            .map(|entry| entry.key().clone())
            .collect();

        let removed = stale.iter().filter(|room_id| self.remove_if_empty(room_id)).count();
        if removed > 0 {
            info!(removed, remaining_rooms = self.rooms.len(), "Cleaned up empty rooms");
        }
        removed
    }

    /// Periodically sweep rooms that were created but never joined
    pub fn spawn_cleanup_task(self: &Arc<Self>) {
        let registry: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let ttl = self.config.empty_room_ttl();

        tokio::spawn(async move {
            let mut ticker = interval(CLEANUP_INTERVAL);
            info!(interval_secs = CLEANUP_INTERVAL.as_secs(), "Starting cleanup task");
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.cleanup_empty_rooms(ttl);
            }
            debug!("Cleanup task stopped");
        });
    }

    /// Close every room
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let room_ids = self.room_ids();
        for room_id in &room_ids {
            if let Some((_, room)) = self.rooms.remove(room_id) {
                room.close();
            }
        }
        info!(closed_rooms = room_ids.len(), "Room registry shut down");
    }

    /// Wait for recorders to finalise and reports to be delivered, at most
    /// `timeout`. Returns false if something was still running.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let tasks = &self.recording.tasks;
        tasks.close();
        if tasks.is_empty() {
            return true;
        }
        info!(pending = tasks.len(), timeout_secs = timeout.as_secs(), "Waiting for recorders and reports");
        match tokio::time::timeout(timeout, tasks.wait()).await {
            Ok(()) => {
                info!("Recorders and reports drained");
                true
            }
            Err(_) => {
                warn!(pending = tasks.len(), "Drain timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::rule::{MAX_ORDER_SIZE, MAX_TURN_SECS, RuleEntry};
    use crate::test_helpers::{
        audio_rtp_parameters, test_registry, test_services, ChannelReportSink, FakeEngine, FakeLauncher,
    };

    #[tokio::test]
    async fn test_room_lifecycle() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());

        let room_id = RoomId::from("test-room");
        let room = registry.create_room(room_id.clone(), "owner", None).await.unwrap();
        assert_eq!(registry.room_count(), 1);
        assert_eq!(room.max_count(), 6);

        let again = registry.create_room(room_id.clone(), "other", None).await;
        assert!(matches!(again, Err(SfuError::AlreadyExists(_))));

        let fetched = registry.get(&room_id).unwrap();
        assert!(Arc::ptr_eq(&room, &fetched));
        assert!(matches!(
            registry.get(&RoomId::from("missing")),
            Err(SfuError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = SfuConfig {
            max_rooms: 2,
            ..SfuConfig::default()
        };
        let (registry, engine, _reports) = test_registry(config);

        registry.create_room(RoomId::from("room1"), "o", None).await.unwrap();
        registry.create_room(RoomId::from("room2"), "o", None).await.unwrap();

        let result = registry.create_room(RoomId::from("room3"), "o", None).await;
        assert!(matches!(result, Err(SfuError::Capacity(_))));
        assert_eq!(engine.router_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_debate_creates_no_router() {
        let (registry, engine, _reports) = test_registry(SfuConfig::default());
        let mut debate = Debate::sample();
        debate.team_size = 0;

        let result = registry.create_room(RoomId::from("r"), "o", Some(debate)).await;
        assert!(matches!(result, Err(SfuError::InvalidDebate(_))));
        assert_eq!(engine.router_count(), 0);
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_debate_is_rejected_before_router() {
        let (registry, engine, _reports) = test_registry(SfuConfig::default());

        let huge = Debate {
            team_size: usize::MAX / 2,
            order_size: 1,
            ..Debate::sample()
        };
        let result = registry.create_room(RoomId::from("huge"), "owner", Some(huge)).await;
        assert!(matches!(result, Err(SfuError::InvalidDebate(_))));

        let wide = Debate {
            order_size: MAX_ORDER_SIZE + 1,
            ..Debate::sample()
        };
        let result = registry.create_room(RoomId::from("wide"), "owner", Some(wide)).await;
        assert!(matches!(result, Err(SfuError::InvalidDebate(_))));

        let endless = Debate {
            rules: vec![RuleEntry::new("team_a_1", "", MAX_TURN_SECS + 1)].into(),
            ..Debate::sample()
        };
        let result = registry.create_room(RoomId::from("endless"), "owner", Some(endless)).await;
        assert!(matches!(result, Err(SfuError::InvalidDebate(_))));

        assert_eq!(engine.router_count(), 0);
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_join_racing_last_leave_never_lands_in_deleted_room() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());

        for i in 0..200 {
            let room_id = RoomId::from(format!("race-{i}"));
            registry.create_room(room_id.clone(), "owner", None).await.unwrap();
            let (host_channel, _host_rx) = PeerChannel::new();
            registry
                .join(&room_id, PeerId::from("host"), "host", host_channel)
                .unwrap();

            let leaving = {
                let registry = Arc::clone(&registry);
                let room_id = room_id.clone();
                tokio::spawn(async move { registry.leave(&room_id, &PeerId::from("host")) })
            };
            let joining = {
                let registry = Arc::clone(&registry);
                let room_id = room_id.clone();
                tokio::spawn(async move {
                    let (channel, rx) = PeerChannel::new();
                    (registry.join(&room_id, PeerId::from("guest"), "guest", channel), rx)
                })
            };
            leaving.await.unwrap().unwrap();
            let (joined, _guest_rx) = joining.await.unwrap();

            match joined {
                Ok(_) => {
                    let room = registry.get(&room_id).unwrap();
                    assert!(!room.is_closed());
                    assert!(room.seat_of(&PeerId::from("guest")).is_some());
                    registry.leave(&room_id, &PeerId::from("guest")).unwrap();
                }
                Err(e) => assert!(matches!(e, SfuError::RoomNotFound(_)), "unexpected join error: {e}"),
            }
            assert!(registry.get(&room_id).is_err());
        }
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_recorders_and_report() {
        let launcher = FakeLauncher::new();
        let (sink, mut reports) = ChannelReportSink::new();
        let registry = RoomRegistry::with_services(
            SfuConfig::default(),
            Arc::new(FakeEngine::new()),
            test_services(launcher.clone(), 32000, 32010),
            sink,
        );
        let room_id = RoomId::from("live");
        let room = registry.create_room(room_id.clone(), "owner", None).await.unwrap();
        let (channel, _rx) = PeerChannel::new();
        registry.join(&room_id, PeerId::from("a"), "alice", channel).unwrap();
        let transport = room.create_transport(&PeerId::from("a")).await.unwrap();
        room.produce(&PeerId::from("a"), &transport.id, MediaKind::Audio, audio_rtp_parameters())
            .await
            .unwrap();
        room.start("owner").await.unwrap();
        assert_eq!(launcher.launched().len(), 1);

        registry.shutdown();
        assert!(registry.drain(Duration::from_secs(5)).await);

        // recorder was asked to stop, not killed, and the report went out
        assert_eq!(launcher.terminations(), 1);
        let report = reports.try_recv().unwrap();
        assert_eq!(report.members.len(), 1);
        assert_eq!(registry.stats().recorder_ports_in_use, 0);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_running() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());
        registry.shutdown();
        assert!(registry.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_join_and_leave_deletes_empty_room() {
        let (registry, engine, _reports) = test_registry(SfuConfig::default());
        let room_id = RoomId::from("room");
        registry.create_room(room_id.clone(), "owner", None).await.unwrap();

        let (channel, _rx) = PeerChannel::new();
        let joined = registry.join(&room_id, PeerId::from("p1"), "alice", channel).unwrap();
        assert_eq!((joined.team, joined.order), (0, 0));
        assert_eq!(joined.room.count, 1);
        assert_eq!(registry.stats().peers, 1);

        let removed = registry.leave(&room_id, &PeerId::from("p1")).unwrap();
        assert!(removed.is_some_and(|peer| peer.is_closed()));
        assert_eq!(registry.room_count(), 0);
        assert!(engine.routers()[0].is_closed());
        assert!(matches!(
            registry.leave(&room_id, &PeerId::from("p1")),
            Err(SfuError::RoomNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_join_unknown_room() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());
        let (channel, _rx) = PeerChannel::new();
        let result = registry.join(&RoomId::from("nope"), PeerId::from("p"), "bob", channel);
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_cleanup_only_empty_rooms() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());
        registry.create_room(RoomId::from("empty"), "o", None).await.unwrap();
        registry.create_room(RoomId::from("busy"), "o", None).await.unwrap();
        let (channel, _rx) = PeerChannel::new();
        registry
            .join(&RoomId::from("busy"), PeerId::from("p"), "p", channel)
            .unwrap();

        assert_eq!(registry.cleanup_empty_rooms(Duration::from_secs(3600)), 0);
        assert_eq!(registry.cleanup_empty_rooms(Duration::ZERO), 1);
        assert_eq!(registry.room_ids(), vec![RoomId::from("busy")]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms() {
        let (registry, _engine, _reports) = test_registry(SfuConfig::default());
        let room = registry.create_room(RoomId::from("r"), "o", None).await.unwrap();
        registry.spawn_cleanup_task();

        registry.shutdown();
        assert!(room.is_closed());
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_surfaces() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_next_router();
        let (registry, _reports) = crate::test_helpers::test_registry_with(SfuConfig::default(), engine);

        let result = registry.create_room(RoomId::from("r"), "o", None).await;
        assert!(matches!(result, Err(SfuError::Engine(_))));
        assert_eq!(registry.room_count(), 0);
    }
}
