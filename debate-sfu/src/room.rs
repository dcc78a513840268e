//! Debate room
//!
//! A room seats peers on a `team_size x order_size` grid, relays their media
//! through one router, and once the owner starts the debate records every
//! seated peer while the turn script plays out.
//!
//! Phases move one way: `Forming` (join, swap) to `Running` (script playing,
//! recordings active) to `Finished` (script over, recordings stopping).

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::barrier::RecordingBarrier;
use crate::error::{Result, SfuError};
use crate::media::{DtlsParameters, MediaKind, MediaRouter, RtpCapabilities, RtpParameters, TransportParams};
use crate::peer::{ConsumerParams, Peer, PeerSnapshot};
use crate::recording::{CompletionHandle, RecordingDescription, RecordingServices};
use crate::report::{RecordReport, ReportMember, ReportSink};
use crate::rule::{Debate, RuleEntry};
use crate::signal::{ProducerAnnouncement, ServerEvent};
use crate::types::{PeerId, ProducerId, RoomId, Seat, TransportId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomPhase {
    Forming,
    Running,
    Finished,
}

/// Public view of a room
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub id: RoomId,
    pub global_id: Uuid,
    pub owner: String,
    pub name: String,
    pub team_size: usize,
    pub order_size: usize,
    pub max_count: usize,
    pub count: usize,
    pub started: bool,
    pub phase: RoomPhase,
    pub peers: Vec<PeerSnapshot>,
}

struct RoomState {
    phase: RoomPhase,
    /// `grid[team][order]`
    grid: Vec<Vec<Option<PeerId>>>,
    peers: HashMap<PeerId, Arc<Peer>>,
    barrier: Option<Arc<RecordingBarrier>>,
}

impl RoomState {
    fn seat_of(&self, peer_id: &PeerId) -> Option<Seat> {
        self.grid.iter().enumerate().find_map(|(team, row)| {
            row.iter()
                .position(|cell| cell.as_ref() == Some(peer_id))
                .map(|order| Seat::new(team, order))
        })
    }

    fn first_free_seat(&self) -> Option<Seat> {
        self.grid.iter().enumerate().find_map(|(team, row)| {
            row.iter()
                .position(Option::is_none)
                .map(|order| Seat::new(team, order))
        })
    }

    fn seated(&self) -> Vec<(Seat, Arc<Peer>)> {
        let mut seated = Vec::with_capacity(self.peers.len());
        for (team, row) in self.grid.iter().enumerate() {
            for (order, cell) in row.iter().enumerate() {
                if let Some(peer) = cell.as_ref().and_then(|id| self.peers.get(id)) {
                    seated.push((Seat::new(team, order), Arc::clone(peer)));
                }
            }
        }
        seated
    }

    fn occupied(&self) -> usize {
        self.grid.iter().flatten().filter(|cell| cell.is_some()).count()
    }
}

pub struct Room {
    id: RoomId,

    /// Unique per room instance, carried into the report
    global_id: Uuid,

    /// Name of the participant allowed to start the debate
    owner: String,

    debate: Debate,

    router: Arc<dyn MediaRouter>,

    recording: RecordingServices,

    report_sink: Arc<dyn ReportSink>,

    state: Mutex<RoomState>,

    /// Cancelled when the room closes; stops turn playback
    playback: CancellationToken,

    /// Set before teardown; joins check it under the state lock
    closed: AtomicBool,

    torn_down: AtomicBool,

    created_at: Instant,
}

impl Room {
    pub fn new(
        id: RoomId,
        owner: impl Into<String>,
        debate: Debate,
        router: Arc<dyn MediaRouter>,
        recording: RecordingServices,
        report_sink: Arc<dyn ReportSink>,
    ) -> Result<Arc<Self>> {
        debate.validate()?;
        let grid = vec![vec![None; debate.order_size]; debate.team_size];
        let room = Arc::new(Self {
            id,
            global_id: Uuid::new_v4(),
            owner: owner.into(),
            debate,
            router,
            recording,
            report_sink,
            state: Mutex::new(RoomState {
                phase: RoomPhase::Forming,
                grid,
                peers: HashMap::new(),
                barrier: None,
            }),
            playback: CancellationToken::new(),
            closed: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            created_at: Instant::now(),
        });
        info!(
            room_id = %room.id,
            global_id = %room.global_id,
            owner = %room.owner,
            max_count = room.max_count(),
            "Room created"
        );
        Ok(room)
    }

    #[must_use]
    pub const fn id(&self) -> &RoomId {
        &self.id
    }

    #[must_use]
    pub const fn global_id(&self) -> Uuid {
        self.global_id
    }

    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    #[must_use]
    pub const fn debate(&self) -> &Debate {
        &self.debate
    }

    #[must_use]
    pub const fn max_count(&self) -> usize {
        self.debate.max_count()
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.state.lock().peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().peers.is_empty()
    }

    #[must_use]
    pub fn phase(&self) -> RoomPhase {
        self.state.lock().phase
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.state.lock().peers.get(peer_id).cloned()
    }

    fn require_peer(&self, peer_id: &PeerId) -> Result<Arc<Peer>> {
        self.peer(peer_id).ok_or_else(|| SfuError::PeerNotFound(peer_id.clone()))
    }

    #[must_use]
    pub fn seat_of(&self, peer_id: &PeerId) -> Option<Seat> {
        self.state.lock().seat_of(peer_id)
    }

    /// Recordings still outstanding, if the debate has started
    #[must_use]
    pub fn pending_recordings(&self) -> Option<usize> {
        self.state.lock().barrier.as_ref().map(|barrier| barrier.pending())
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> RtpCapabilities {
        self.router.rtp_capabilities()
    }

    /// Seat `peer` in the first free cell, scanning team by team
    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<Seat> {
        let (seat, others) = {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(SfuError::Closed);
            }
            if state.phase != RoomPhase::Forming {
                return Err(SfuError::AlreadyStarted);
            }
            if state.peers.contains_key(peer.id()) {
                return Err(SfuError::PeerExists(peer.id().clone()));
            }
            let seat = state.first_free_seat().ok_or(SfuError::RoomFull)?;

            state.grid[seat.team][seat.order] = Some(peer.id().clone());
            let others: Vec<Arc<Peer>> = state.peers.values().cloned().collect();
            state.peers.insert(peer.id().clone(), Arc::clone(&peer));
            debug_assert_eq!(state.occupied(), state.peers.len());
            (seat, others)
        };

        info!(room_id = %self.id, peer_id = %peer.id(), name = %peer.name(), %seat, "User joined");
        let event = ServerEvent::Add {
            id: peer.id().clone(),
            name: peer.name().to_string(),
            team: seat.team,
            order: seat.order,
        };
        for other in others {
            other.send(event.clone());
        }
        Ok(seat)
    }

    /// Start the debate: record every seated peer and play the turn script.
    pub async fn start(self: &Arc<Self>, requester: &str) -> Result<()> {
        let (seated, barrier) = {
            let mut state = self.state.lock();
            if self.is_closed() {
                return Err(SfuError::Closed);
            }
            if requester != self.owner {
                return Err(SfuError::NotOwner);
            }
            if state.phase != RoomPhase::Forming {
                return Err(SfuError::AlreadyStarted);
            }
            state.phase = RoomPhase::Running;

            let seated = state.seated();
            let barrier = RecordingBarrier::new(
                self.report_draft(&seated),
                Arc::clone(&self.report_sink),
                self.recording.tasks.clone(),
            );
            state.barrier.clone_from(&barrier);
            (seated, barrier)
        };

        info!(
            room_id = %self.id,
            global_id = %self.global_id,
            seated = seated.len(),
            duration_secs = self.debate.total_duration().as_secs(),
            "Debate start"
        );

        if let Some(barrier) = barrier {
            let recordings = seated.iter().map(|(_, peer)| {
                let barrier = Arc::clone(&barrier);
                let on_done = CompletionHandle::new(self.id.clone(), peer.id().clone(), move |done| {
                    barrier.arrive(done);
                });
                let router = Arc::clone(&self.router);
                let peer = Arc::clone(peer);
                async move {
                    // Failures are logged by the peer and reported through the barrier
                    let _ = peer.start_recording(router.as_ref(), on_done).await;
                }
            });
            join_all(recordings).await;
        }

        if self.is_closed() {
            return Ok(());
        }
        self.spawn_playback();
        Ok(())
    }

    fn report_draft(&self, seated: &[(Seat, Arc<Peer>)]) -> RecordReport {
        let members = seated
            .iter()
            .map(|(seat, peer)| ReportMember {
                id: peer.id().clone(),
                name: peer.name().to_string(),
                role: seat.role(),
                file_path: self
                    .recording
                    .launcher
                    .output_path(&RecordingDescription::new(peer.id().as_str())),
                recorded: false,
            })
            .collect();

        RecordReport {
            room_id: self.id.clone(),
            global_id: self.global_id,
            debate_name: self.debate.name.clone(),
            description: self.debate.description.clone(),
            team_size: self.debate.team_size,
            order_size: self.debate.order_size,
            members,
            rules: Arc::clone(&self.debate.rules),
            finished_at: None,
        }
    }

    fn spawn_playback(self: &Arc<Self>) {
        let room: Weak<Self> = Arc::downgrade(self);
        let rules = Arc::clone(&self.debate.rules);
        let cancel = self.playback.clone();
        let room_id = self.id.clone();

        tokio::spawn(async move {
            let mut cursor = 0;
            while let Some(entry) = rules.get(cursor) {
                match room.upgrade() {
                    Some(room) if !room.is_closed() => room.broadcast(None, &ServerEvent::Rule(entry.clone())),
                    _ => return,
                }
                debug!(room_id = %room_id, cursor, debater = %entry.debater, "Turn");

                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(room_id = %room_id, "Turn playback cancelled");
                        return;
                    }
                    () = tokio::time::sleep(entry.duration()) => {}
                }
                cursor += 1;
            }

            if let Some(room) = room.upgrade() {
                room.finish();
            }
        });
    }

    /// Script over: announce the end once and stop every recording
    fn finish(&self) {
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.lock();
            if self.is_closed() || state.phase != RoomPhase::Running {
                return;
            }
            state.phase = RoomPhase::Finished;
            state.peers.values().cloned().collect()
        };

        info!(room_id = %self.id, "Debate finished");
        let end = ServerEvent::Rule(RuleEntry::end());
        for peer in &peers {
            peer.send(end.clone());
        }
        for peer in &peers {
            peer.stop_recording();
        }
    }

    /// Exchange two grid cells; either may be empty
    pub fn swap_locate_peer(&self, team_0: usize, order_0: usize, team_1: usize, order_1: usize) -> Result<()> {
        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.lock();
            for (team, order) in [(team_0, order_0), (team_1, order_1)] {
                if team >= self.debate.team_size || order >= self.debate.order_size {
                    return Err(SfuError::InvalidSeat { team, order });
                }
            }
            if state.phase != RoomPhase::Forming {
                return Err(SfuError::AlreadyStarted);
            }

            let first = state.grid[team_0][order_0].take();
            let second = std::mem::replace(&mut state.grid[team_1][order_1], first);
            state.grid[team_0][order_0] = second;
            state.peers.values().cloned().collect()
        };

        debug!(room_id = %self.id, team_0, order_0, team_1, order_1, "Seats swapped");
        let event = ServerEvent::Swap {
            team_0,
            order_0,
            team_1,
            order_1,
        };
        for peer in peers {
            peer.send(event.clone());
        }
        Ok(())
    }

    /// Close and unseat a peer. A recording it still had running counts as
    /// finished for the barrier.
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        let (peer, seat) = {
            let mut state = self.state.lock();
            let peer = state.peers.remove(peer_id)?;
            let seat = state.seat_of(peer_id);
            if let Some(seat) = seat {
                state.grid[seat.team][seat.order] = None;
            }
            debug_assert_eq!(state.occupied(), state.peers.len());
            (peer, seat)
        };

        let closed_producers = peer.close();
        info!(room_id = %self.id, peer_id = %peer_id, name = %peer.name(), "User left");

        if let Some(seat) = seat {
            self.broadcast(
                Some(peer_id),
                &ServerEvent::Remove {
                    id: peer_id.clone(),
                    team: seat.team,
                    order: seat.order,
                },
            );
        }
        for producer_id in &closed_producers {
            self.notify_producer_closed(producer_id);
        }
        Some(peer)
    }

    pub async fn create_transport(&self, peer_id: &PeerId) -> Result<TransportParams> {
        let peer = self.require_peer(peer_id)?;
        let transport = self.router.create_webrtc_transport().await?;
        let params = transport.params();
        peer.add_transport(transport)?;
        debug!(room_id = %self.id, peer_id = %peer_id, transport_id = %params.id, "Adding transport");
        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let peer = self.require_peer(peer_id)?;
        peer.connect_transport(transport_id, dtls_parameters).await
    }

    /// Create a producer and announce it to everyone else
    pub async fn produce(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let peer = self.require_peer(peer_id)?;
        let producer_id = peer.create_producer(transport_id, kind, rtp_parameters).await?;

        self.broadcast(
            Some(peer_id),
            &ServerEvent::NewProducers(vec![ProducerAnnouncement {
                producer_id: producer_id.clone(),
                producer_socket_id: Some(peer_id.clone()),
            }]),
        );
        Ok(producer_id)
    }

    /// `Ok(None)` when the router cannot serve `producer_id` to these capabilities
    pub async fn consume(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Option<ConsumerParams>> {
        let peer = self.require_peer(peer_id)?;
        if !self.router.can_consume(producer_id, &rtp_capabilities) {
            warn!(room_id = %self.id, peer_id = %peer_id, producer_id = %producer_id, "Can not consume");
            return Ok(None);
        }
        peer.create_consumer(transport_id, producer_id, rtp_capabilities)
            .await
            .map(Some)
    }

    pub fn close_producer(&self, peer_id: &PeerId, producer_id: &ProducerId) -> Result<()> {
        let peer = self.require_peer(peer_id)?;
        if peer.close_producer(producer_id) {
            self.notify_producer_closed(producer_id);
        }
        Ok(())
    }

    /// Drop consumers of a closed producer and tell their owners
    fn notify_producer_closed(&self, producer_id: &ProducerId) {
        let peers: Vec<Arc<Peer>> = self.state.lock().peers.values().cloned().collect();
        for peer in peers {
            for consumer_id in peer.remove_consumers_of(producer_id) {
                peer.send(ServerEvent::ConsumerClosed { consumer_id });
            }
        }
    }

    #[must_use]
    pub fn producer_list(&self) -> Vec<ProducerAnnouncement> {
        let peers: Vec<Arc<Peer>> = self.state.lock().peers.values().cloned().collect();
        peers
            .iter()
            .flat_map(|peer| peer.producer_ids())
            .map(|producer_id| ProducerAnnouncement {
                producer_id,
                producer_socket_id: None,
            })
            .collect()
    }

    /// Push `event` to every peer except `except`
    pub fn broadcast(&self, except: Option<&PeerId>, event: &ServerEvent) {
        let peers: Vec<Arc<Peer>> = self
            .state
            .lock()
            .peers
            .values()
            .filter(|peer| Some(peer.id()) != except)
            .cloned()
            .collect();
        for peer in peers {
            peer.send(event.clone());
        }
    }

    /// Send to a single peer
    pub fn send(&self, peer_id: &PeerId, event: ServerEvent) -> bool {
        self.peer(peer_id).is_some_and(|peer| peer.send(event))
    }

    #[must_use]
    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock();
        let peers = state
            .seated()
            .into_iter()
            .map(|(seat, peer)| peer.snapshot(seat))
            .collect();
        RoomSnapshot {
            id: self.id.clone(),
            global_id: self.global_id,
            owner: self.owner.clone(),
            name: self.debate.name.clone(),
            team_size: self.debate.team_size,
            order_size: self.debate.order_size,
            max_count: self.max_count(),
            count: state.peers.len(),
            started: state.phase != RoomPhase::Forming,
            phase: state.phase,
            peers,
        }
    }

    /// Mark the room closed if it has no peers. Checked and set under the
    /// state lock, so a concurrent `add_peer` either lands first (and the
    /// room stays open) or sees the room closed.
    pub fn close_if_empty(&self) -> bool {
        let state = self.state.lock();
        if !state.peers.is_empty() {
            return false;
        }
        self.closed.store(true, Ordering::Release);
        true
    }

    /// Stop playback and close every peer. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.playback.cancel();

        let peers: Vec<Arc<Peer>> = {
            let mut state = self.state.lock();
            for cell in state.grid.iter_mut().flatten() {
                *cell = None;
            }
            state.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in &peers {
            peer.close();
        }
        self.router.close();
        info!(room_id = %self.id, global_id = %self.global_id, peers = peers.len(), "Room closed");
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("global_id", &self.global_id)
            .field("owner", &self.owner)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::PeerChannel;
    use crate::test_helpers::{
        audio_rtp_parameters, test_services, ChannelReportSink, FakeLauncher, FakeRouter,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    fn debate(team_size: usize, order_size: usize, turns: &[(&str, u64)]) -> Debate {
        Debate {
            name: "test".into(),
            description: "topic".into(),
            team_size,
            order_size,
            rules: turns
                .iter()
                .map(|(debater, time)| RuleEntry::new(*debater, format!("{debater} speaks"), *time))
                .collect::<Vec<_>>()
                .into(),
        }
    }

    struct Fixture {
        room: Arc<Room>,
        router: Arc<FakeRouter>,
        services: RecordingServices,
        reports: mpsc::UnboundedReceiver<RecordReport>,
    }

    fn fixture(debate: Debate) -> Fixture {
        let router = Arc::new(FakeRouter::new());
        let services = test_services(FakeLauncher::new(), 20000, 20100);
        let (sink, reports) = ChannelReportSink::new();
        let room = Room::new(
            RoomId::from("room"),
            "owner",
            debate,
            router.clone(),
            services.clone(),
            sink,
        )
        .unwrap();
        Fixture {
            room,
            router,
            services,
            reports,
        }
    }

    fn join(fx: &Fixture, id: &str) -> (Arc<Peer>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (channel, rx) = PeerChannel::new();
        let peer = Arc::new(Peer::new(
            PeerId::from(id),
            id,
            fx.room.id().clone(),
            channel,
            fx.services.clone(),
        ));
        fx.room.add_peer(Arc::clone(&peer)).unwrap();
        (peer, rx)
    }

    async fn publish_audio(fx: &Fixture, peer: &Peer) -> ProducerId {
        let params = fx.room.create_transport(peer.id()).await.unwrap();
        fx.room
            .produce(peer.id(), &params.id, MediaKind::Audio, audio_rtp_parameters())
            .await
            .unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_seats_fill_row_major() {
        let fx = fixture(debate(2, 2, &[]));
        let ids = ["a", "b", "c", "d"];
        let mut seats = Vec::new();
        for id in ids {
            let (peer, _rx) = join(&fx, id);
            seats.push(fx.room.seat_of(peer.id()).unwrap());
        }
        assert_eq!(
            seats,
            vec![Seat::new(0, 0), Seat::new(0, 1), Seat::new(1, 0), Seat::new(1, 1)]
        );
        assert_eq!(fx.room.count(), 4);
    }

    #[tokio::test]
    async fn test_room_full_does_not_mutate() {
        let fx = fixture(debate(1, 1, &[]));
        let (_a, _rx) = join(&fx, "a");

        let (channel, _rx2) = PeerChannel::new();
        let extra = Arc::new(Peer::new(PeerId::from("b"), "b", RoomId::from("room"), channel, fx.services.clone()));
        assert!(matches!(fx.room.add_peer(extra), Err(SfuError::RoomFull)));
        assert_eq!(fx.room.count(), 1);
        assert_eq!(fx.room.snapshot().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_join_broadcasts_add_to_others() {
        let fx = fixture(debate(2, 1, &[]));
        let (_a, mut rx_a) = join(&fx, "a");
        let (_b, mut rx_b) = join(&fx, "b");

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::Add {
                id: PeerId::from("b"),
                name: "b".into(),
                team: 1,
                order: 0,
            }]
        );
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_only_owner_starts_once() {
        let fx = fixture(debate(1, 1, &[]));
        assert!(matches!(fx.room.start("intruder").await, Err(SfuError::NotOwner)));
        assert_eq!(fx.room.phase(), RoomPhase::Forming);

        fx.room.start("owner").await.unwrap();
        assert!(matches!(fx.room.start("owner").await, Err(SfuError::AlreadyStarted)));
        assert!(fx.room.snapshot().started);
    }

    #[tokio::test]
    async fn test_no_joins_or_swaps_after_start() {
        let fx = fixture(debate(2, 1, &[("team_a_1", 5)]));
        let (_a, _rx) = join(&fx, "a");
        fx.room.start("owner").await.unwrap();

        let (channel, _rx2) = PeerChannel::new();
        let late = Arc::new(Peer::new(PeerId::from("b"), "b", RoomId::from("room"), channel, fx.services.clone()));
        assert!(matches!(fx.room.add_peer(late), Err(SfuError::AlreadyStarted)));
        assert!(matches!(
            fx.room.swap_locate_peer(0, 0, 1, 0),
            Err(SfuError::AlreadyStarted)
        ));
        fx.room.close();
    }

    #[tokio::test]
    async fn test_swap_with_empty_cell() {
        let fx = fixture(debate(2, 2, &[]));
        let (a, mut rx) = join(&fx, "a");

        fx.room.swap_locate_peer(0, 0, 1, 1).unwrap();
        assert_eq!(fx.room.seat_of(a.id()), Some(Seat::new(1, 1)));
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Swap {
                team_0: 0,
                order_0: 0,
                team_1: 1,
                order_1: 1,
            }]
        );

        assert!(matches!(
            fx.room.swap_locate_peer(2, 0, 0, 0),
            Err(SfuError::InvalidSeat { team: 2, order: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turns_play_in_order_then_end_once() {
        let fx = fixture(debate(1, 1, &[("team_a_1", 3), ("team_b_1", 2)]));
        let (_a, mut rx) = join(&fx, "a");
        fx.room.start("owner").await.unwrap();

        let mut debaters = Vec::new();
        let started = tokio::time::Instant::now();
        while let Some(event) = rx.recv().await {
            if let ServerEvent::Rule(entry) = event {
                let done = entry.is_end();
                debaters.push((entry.debater, started.elapsed().as_secs()));
                if done {
                    break;
                }
            }
        }
        assert_eq!(
            debaters,
            vec![("team_a_1".to_string(), 0), ("team_b_1".to_string(), 3), ("end".to_string(), 5)]
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(drain(&mut rx).iter().all(|e| !matches!(e, ServerEvent::Rule(_))));
        assert_eq!(fx.room.phase(), RoomPhase::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_after_all_recordings_stop() {
        let mut fx = fixture(debate(2, 1, &[("team_a_1", 1), ("team_b_1", 1)]));
        let (a, _rx_a) = join(&fx, "a");
        let (b, _rx_b) = join(&fx, "b");
        publish_audio(&fx, &a).await;
        publish_audio(&fx, &b).await;

        fx.room.start("owner").await.unwrap();
        assert_eq!(fx.room.pending_recordings(), Some(2));
        assert_eq!(fx.services.ports.in_use(), 2);

        let report = fx.reports.recv().await.unwrap();
        assert_eq!(report.global_id, fx.room.global_id());
        assert_eq!(report.members.len(), 2);
        assert_eq!(report.members[0].role, "team_a_1");
        assert_eq!(report.members[1].role, "team_b_1");
        assert!(report.members.iter().all(|m| m.recorded));
        assert_eq!(fx.room.pending_recordings(), Some(0));
        assert_eq!(fx.services.ports.in_use(), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fx.reports.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_nobody_seated_sends_no_report() {
        let mut fx = fixture(debate(2, 1, &[("team_a_1", 1)]));
        fx.room.start("owner").await.unwrap();
        assert_eq!(fx.room.pending_recordings(), None);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fx.room.phase(), RoomPhase::Finished);
        assert!(fx.reports.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_recording_is_reported_not_recorded() {
        let mut fx = fixture(debate(2, 1, &[("team_a_1", 1)]));
        let (a, _rx_a) = join(&fx, "a");
        let (_b, _rx_b) = join(&fx, "b");
        publish_audio(&fx, &a).await;

        fx.room.start("owner").await.unwrap();
        // b had nothing to record and arrived right away
        assert_eq!(fx.room.pending_recordings(), Some(1));

        let report = fx.reports.recv().await.unwrap();
        let recorded: Vec<(String, bool)> = report
            .members
            .iter()
            .map(|m| (m.id.to_string(), m.recorded))
            .collect();
        assert_eq!(recorded, vec![("a".to_string(), true), ("b".to_string(), false)]);
        assert!(!fx.room.snapshot().peers[1].recorded);
    }

    #[tokio::test]
    async fn test_produce_announces_and_close_producer_notifies_consumers() {
        let fx = fixture(debate(2, 1, &[]));
        let (a, mut rx_a) = join(&fx, "a");
        let (b, mut rx_b) = join(&fx, "b");
        drain(&mut rx_a);

        let producer_id = publish_audio(&fx, &a).await;
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::NewProducers(vec![ProducerAnnouncement {
                producer_id: producer_id.clone(),
                producer_socket_id: Some(a.id().clone()),
            }])]
        );
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(fx.room.producer_list().len(), 1);

        let transport = fx.room.create_transport(b.id()).await.unwrap();
        let params = fx
            .room
            .consume(b.id(), &transport.id, &producer_id, fx.room.rtp_capabilities())
            .await
            .unwrap()
            .unwrap();

        fx.room.close_producer(a.id(), &producer_id).unwrap();
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerEvent::ConsumerClosed { consumer_id: params.id }]
        );
        assert!(fx.room.producer_list().is_empty());
    }

    #[tokio::test]
    async fn test_consume_unconsumable_is_silent() {
        let fx = fixture(debate(2, 1, &[]));
        let (a, _rx_a) = join(&fx, "a");
        let transport = fx.room.create_transport(a.id()).await.unwrap();
        fx.router.set_can_consume(false);

        let result = fx
            .room
            .consume(a.id(), &transport.id, &ProducerId::from("p"), json!({}))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_peer_operations() {
        let fx = fixture(debate(2, 1, &[]));
        let ghost = PeerId::from("ghost");
        assert!(matches!(fx.room.create_transport(&ghost).await, Err(SfuError::PeerNotFound(_))));
        assert!(fx.room.remove_peer(&ghost).is_none());
    }

    #[tokio::test]
    async fn test_remove_peer_clears_cell_and_notifies() {
        let fx = fixture(debate(2, 1, &[]));
        let (a, mut rx_a) = join(&fx, "a");
        let (b, _rx_b) = join(&fx, "b");
        drain(&mut rx_a);

        let removed = fx.room.remove_peer(b.id()).unwrap();
        assert!(removed.is_closed());
        assert_eq!(fx.room.count(), 1);
        assert_eq!(fx.room.seat_of(a.id()), Some(Seat::new(0, 0)));
        assert_eq!(
            drain(&mut rx_a),
            vec![ServerEvent::Remove {
                id: PeerId::from("b"),
                team: 1,
                order: 0,
            }]
        );

        // the freed seat is reused
        let (c, _rx_c) = join(&fx, "c");
        assert_eq!(fx.room.seat_of(c.id()), Some(Seat::new(1, 0)));
    }

    #[tokio::test]
    async fn test_close_stops_everything() {
        let fx = fixture(debate(2, 1, &[("team_a_1", 100)]));
        let (a, _rx_a) = join(&fx, "a");
        publish_audio(&fx, &a).await;
        fx.room.start("owner").await.unwrap();

        fx.room.close();
        fx.room.close();
        assert!(a.is_closed());
        assert!(fx.room.is_empty());
        assert!(fx.router.is_closed());
        assert_eq!(fx.services.ports.in_use(), 0);
    }

    #[tokio::test]
    async fn test_close_if_empty_shuts_the_door() {
        let fx = fixture(debate(2, 1, &[("team_a_1", 10)]));
        let (_a, _rx_a) = join(&fx, "a");
        assert!(!fx.room.close_if_empty());
        assert!(!fx.room.is_closed());

        fx.room.remove_peer(&PeerId::from("a")).unwrap();
        assert!(fx.room.close_if_empty());
        assert!(fx.room.is_closed());

        let (channel, _rx) = PeerChannel::new();
        let late = Arc::new(Peer::new(
            PeerId::from("late"),
            "late",
            fx.room.id().clone(),
            channel,
            fx.services.clone(),
        ));
        assert!(matches!(fx.room.add_peer(late), Err(SfuError::Closed)));
        assert!(fx.room.is_empty());

        // teardown still runs after the room was marked
        fx.room.close();
        assert!(fx.router.is_closed());
    }
}
