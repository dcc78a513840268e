//! End-to-end room scenarios over the in-memory engine

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::SfuConfig;
use crate::error::SfuError;
use crate::media::MediaKind;
use crate::peer::Peer;
use crate::recording::RecorderExit;
use crate::room::{Room, RoomPhase};
use crate::rule::{Debate, RuleEntry};
use crate::signal::{PeerChannel, ServerEvent};
use crate::test_helpers::{
    audio_rtp_parameters, test_registry, test_services, video_rtp_parameters, ChannelReportSink, FakeLauncher,
    FakeRouter,
};
use crate::types::{PeerId, RoomId, Seat};

fn two_by_one() -> Debate {
    Debate {
        name: "final".into(),
        description: "motion".into(),
        team_size: 2,
        order_size: 1,
        rules: vec![
            RuleEntry::new("team_a_1", "opening", 1),
            RuleEntry::new("team_b_1", "rebuttal", 1),
        ]
        .into(),
    }
}

fn rules_seen(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<String> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|event| match event {
            ServerEvent::Rule(entry) => Some(entry.debater),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_seat_debate_runs_to_end() {
    let (registry, _engine, mut reports) = test_registry(SfuConfig::default());
    let room_id = RoomId::from("final");
    registry
        .create_room(room_id.clone(), "owner", Some(two_by_one()))
        .await
        .unwrap();

    let (channel_a, mut rx_a) = PeerChannel::new();
    let (channel_b, mut rx_b) = PeerChannel::new();
    let (channel_c, _rx_c) = PeerChannel::new();
    let a = registry.join(&room_id, PeerId::from("a"), "alice", channel_a).unwrap();
    let b = registry.join(&room_id, PeerId::from("b"), "bob", channel_b).unwrap();
    assert_eq!((a.team, a.order), (0, 0));
    assert_eq!((b.team, b.order), (1, 0));
    assert!(matches!(
        registry.join(&room_id, PeerId::from("c"), "carol", channel_c),
        Err(SfuError::RoomFull)
    ));

    let room = registry.get(&room_id).unwrap();
    assert_eq!(room.count(), 2);
    room.start("owner").await.unwrap();

    tokio::time::sleep(Duration::from_millis(2100)).await;
    let expected = vec!["team_a_1".to_string(), "team_b_1".to_string(), "end".to_string()];
    assert_eq!(rules_seen(&mut rx_a), expected);
    assert_eq!(rules_seen(&mut rx_b), expected);
    assert_eq!(room.phase(), RoomPhase::Finished);

    // nobody published, so both arrive unrecorded and the report still fires
    let report = reports.recv().await.unwrap();
    assert_eq!(report.debate_name, "final");
    assert!(report.members.iter().all(|m| !m.recorded));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(reports.try_recv().is_err());
}

#[tokio::test]
async fn test_swap_exchanges_cells_and_tells_everyone() {
    let (registry, _engine, _reports) = test_registry(SfuConfig::default());
    let room_id = RoomId::from("swap");
    let room = registry
        .create_room(room_id.clone(), "owner", Some(two_by_one()))
        .await
        .unwrap();

    let (channel_a, mut rx_a) = PeerChannel::new();
    let (channel_b, mut rx_b) = PeerChannel::new();
    registry.join(&room_id, PeerId::from("a"), "alice", channel_a).unwrap();
    registry.join(&room_id, PeerId::from("b"), "bob", channel_b).unwrap();
    while rx_a.try_recv().is_ok() {}

    room.swap_locate_peer(0, 0, 1, 0).unwrap();
    let swap = ServerEvent::Swap {
        team_0: 0,
        order_0: 0,
        team_1: 1,
        order_1: 0,
    };
    assert_eq!(rx_a.try_recv().unwrap(), swap);
    assert_eq!(rx_b.try_recv().unwrap(), swap);
    assert_eq!(room.seat_of(&PeerId::from("a")), Some(Seat::new(1, 0)));
    assert_eq!(room.seat_of(&PeerId::from("b")), Some(Seat::new(0, 0)));
}

#[tokio::test]
async fn test_disconnect_mid_recording_frees_ports_and_advances_barrier() {
    let router = Arc::new(FakeRouter::new());
    let services = test_services(FakeLauncher::new(), 30000, 30010);
    let (sink, mut reports) = ChannelReportSink::new();
    let mut debate = two_by_one();
    debate.rules = vec![RuleEntry::new("team_a_1", "long turn", 600)].into();
    let room = Room::new(RoomId::from("r"), "owner", debate, router, services.clone(), sink).unwrap();

    let mut peers = Vec::new();
    for id in ["a", "b"] {
        let (channel, rx) = PeerChannel::new();
        let peer = Arc::new(Peer::new(PeerId::from(id), id, room.id().clone(), channel, services.clone()));
        room.add_peer(Arc::clone(&peer)).unwrap();
        peers.push((peer, rx));
    }

    let a = Arc::clone(&peers[0].0);
    let transport = room.create_transport(a.id()).await.unwrap();
    room.produce(a.id(), &transport.id, MediaKind::Audio, audio_rtp_parameters())
        .await
        .unwrap();
    room.produce(a.id(), &transport.id, MediaKind::Video, video_rtp_parameters())
        .await
        .unwrap();
    let b = Arc::clone(&peers[1].0);
    let transport = room.create_transport(b.id()).await.unwrap();
    room.produce(b.id(), &transport.id, MediaKind::Audio, audio_rtp_parameters())
        .await
        .unwrap();

    room.start("owner").await.unwrap();
    let held = a.recording_ports();
    assert_eq!(held.len(), 2);
    assert_eq!(room.pending_recordings(), Some(2));

    room.remove_peer(a.id()).unwrap();
    assert!(held.iter().all(|port| !services.ports.is_held(*port)));
    assert_eq!(services.ports.in_use(), 1);
    // the aborted arrival is synchronous with the removal
    assert_eq!(room.pending_recordings(), Some(1));

    room.close();
    let report = reports.recv().await.unwrap();
    assert_eq!(report.members.len(), 2);
    assert!(!report.members[0].recorded);
    assert_eq!(services.ports.in_use(), 0);
}

#[tokio::test]
async fn test_report_fires_once_when_every_recorder_crashes() {
    let router = Arc::new(FakeRouter::new());
    let launcher = FakeLauncher::new();
    let services = test_services(launcher.clone(), 31000, 31010);
    let (sink, mut reports) = ChannelReportSink::new();
    let mut debate = two_by_one();
    debate.rules = vec![RuleEntry::new("team_a_1", "long turn", 600)].into();
    let room = Room::new(RoomId::from("r"), "owner", debate, router, services.clone(), sink).unwrap();

    let mut receivers = Vec::new();
    for id in ["a", "b"] {
        let (channel, rx) = PeerChannel::new();
        let peer = Arc::new(Peer::new(PeerId::from(id), id, room.id().clone(), channel, services.clone()));
        room.add_peer(Arc::clone(&peer)).unwrap();
        let transport = room.create_transport(peer.id()).await.unwrap();
        room.produce(peer.id(), &transport.id, MediaKind::Audio, audio_rtp_parameters())
            .await
            .unwrap();
        receivers.push(rx);
    }

    room.start("owner").await.unwrap();
    assert_eq!(launcher.launched().len(), 2);

    // both recorders crash on their own
    launcher.exit_all(RecorderExit {
        success: false,
        code: Some(1),
    });
    let report = reports.recv().await.unwrap();
    assert!(report.members.iter().all(|m| !m.recorded));
    assert_eq!(room.pending_recordings(), Some(0));

    room.close();
    tokio::task::yield_now().await;
    assert!(reports.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_never_share_a_cell() {
    let (registry, _engine, _reports) = test_registry(SfuConfig::default());
    let room_id = RoomId::from("crowd");
    let debate = Debate {
        team_size: 3,
        order_size: 4,
        ..Debate::sample()
    };
    let room = registry
        .create_room(room_id.clone(), "owner", Some(debate))
        .await
        .unwrap();

    let handles: Vec<_> = (0..20)
        .map(|i| {
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tokio::spawn(async move {
                let (channel, rx) = PeerChannel::new();
                let result = registry.join(&room_id, PeerId::from(format!("p{i}")), "p", channel);
                (result, rx)
            })
        })
        .collect();

    let mut seats = HashSet::new();
    let mut full = 0;
    let mut receivers = Vec::new();
    for handle in handles {
        let (result, rx) = handle.await.unwrap();
        receivers.push(rx);
        match result {
            Ok(joined) => assert!(seats.insert((joined.team, joined.order))),
            Err(SfuError::RoomFull) => full += 1,
            Err(e) => panic!("unexpected join error: {e}"),
        }
    }
    assert_eq!(seats.len(), 12);
    assert_eq!(full, 8);
    assert_eq!(room.count(), 12);
}
