//! Server-pushed events and the per-peer channel that carries them

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::rule::RuleEntry;
use crate::types::{ConsumerId, PeerId, ProducerId};

/// A producer announced to the other peers of a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProducerAnnouncement {
    pub producer_id: ProducerId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub producer_socket_id: Option<PeerId>,
}

/// Push frames, serialized as `{"event": <name>, "data": <payload>}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    Rule(RuleEntry),
    Add {
        id: PeerId,
        name: String,
        team: usize,
        order: usize,
    },
    Remove {
        id: PeerId,
        team: usize,
        order: usize,
    },
    Swap {
        team_0: usize,
        order_0: usize,
        team_1: usize,
        order_1: usize,
    },
    NewProducers(Vec<ProducerAnnouncement>),
    ConsumerClosed {
        consumer_id: ConsumerId,
    },
}

impl ServerEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Rule(_) => "rule",
            Self::Add { .. } => "add",
            Self::Remove { .. } => "remove",
            Self::Swap { .. } => "swap",
            Self::NewProducers(_) => "newProducers",
            Self::ConsumerClosed { .. } => "consumerClosed",
        }
    }
}

/// Outbound half of a peer's signaling connection
#[derive(Debug, Clone)]
pub struct PeerChannel {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl PeerChannel {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    #[must_use]
    pub const fn from_sender(tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self { tx }
    }

    /// Queue an event; false once the connection is gone
    pub fn send(&self, event: ServerEvent) -> bool {
        let name = event.name();
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!(event = name, "Dropping event for closed connection");
                false
            }
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_frame_shape() {
        let event = ServerEvent::Swap {
            team_0: 0,
            order_0: 0,
            team_1: 1,
            order_1: 0,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "event": "swap", "data": { "team_0": 0, "order_0": 0, "team_1": 1, "order_1": 0 } })
        );

        let event = ServerEvent::NewProducers(vec![ProducerAnnouncement {
            producer_id: ProducerId::from("p1"),
            producer_socket_id: None,
        }]);
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "event": "newProducers", "data": [{ "producer_id": "p1" }] })
        );
        assert_eq!(event.name(), "newProducers");
    }

    #[test]
    fn test_rule_push() {
        let value = serde_json::to_value(ServerEvent::Rule(RuleEntry::end())).unwrap();
        assert_eq!(value, json!({ "event": "rule", "data": { "debater": "end" } }));
    }

    #[tokio::test]
    async fn test_channel_reports_closed_receiver() {
        let (channel, mut rx) = PeerChannel::new();
        assert!(channel.send(ServerEvent::ConsumerClosed {
            consumer_id: ConsumerId::from("c"),
        }));
        assert!(matches!(rx.recv().await, Some(ServerEvent::ConsumerClosed { .. })));

        drop(rx);
        assert!(channel.is_closed());
        assert!(!channel.send(ServerEvent::Rule(RuleEntry::end())));
    }
}
