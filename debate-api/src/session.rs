//! One signaling connection's view of the SFU
//!
//! A session maps client requests onto the room registry. It remembers the
//! room its peer sits in; everything media-related goes through that room.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use debate_sfu::{PeerChannel, PeerId, Room, RoomId, RoomRegistry, ServerEvent, SfuError};

use crate::protocol::ClientRequest;

pub struct Session {
    peer_id: PeerId,
    registry: Arc<RoomRegistry>,
    channel: PeerChannel,
    room_id: Option<RoomId>,
}

impl Session {
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, channel: PeerChannel) -> Self {
        Self {
            peer_id: PeerId::generate(),
            registry,
            channel,
            room_id: None,
        }
    }

    #[must_use]
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    #[must_use]
    pub const fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    fn current_room(&self) -> Result<Arc<Room>, SfuError> {
        let room_id = self
            .room_id
            .as_ref()
            .ok_or_else(|| SfuError::PeerNotFound(self.peer_id.clone()))?;
        self.registry.get(room_id)
    }

    /// Run one request. `Ok(None)` for fire-and-forget events, which log
    /// their own failures.
    pub async fn handle(&mut self, request: ClientRequest) -> Result<Option<Value>, SfuError> {
        debug!(peer_id = %self.peer_id, event = request.name(), "Signaling request");
        match request {
            ClientRequest::CreateRoom { room_id, name, debate } => {
                let room = self.registry.create_room(room_id, &name, debate).await?;
                Ok(Some(json!({ "room_id": room.id() })))
            }
            ClientRequest::Join { room_id, name } => {
                if let Some(current) = &self.room_id {
                    warn!(peer_id = %self.peer_id, room_id = %current, "Join while already in a room");
                    return Err(SfuError::PeerExists(self.peer_id.clone()));
                }
                let joined = self
                    .registry
                    .join(&room_id, self.peer_id.clone(), &name, self.channel.clone())?;
                debug!(room_id = %room_id, peer_id = %self.peer_id, team = joined.team, order = joined.order, "Join answered");
                self.room_id = Some(room_id);
                Ok(Some(to_json(&joined)))
            }
            ClientRequest::Start { room_id, name } => {
                self.registry.get(&room_id)?.start(&name).await?;
                Ok(Some(json!({})))
            }
            ClientRequest::SwapUser {
                team_0,
                order_0,
                team_1,
                order_1,
            } => {
                if let Err(e) = self
                    .current_room()
                    .and_then(|room| room.swap_locate_peer(team_0, order_0, team_1, order_1))
                {
                    warn!(peer_id = %self.peer_id, error = %e, "Swap rejected");
                }
                Ok(None)
            }
            ClientRequest::GetRouterRtpCapabilities => Ok(Some(self.current_room()?.rtp_capabilities())),
            ClientRequest::CreateWebRtcTransport => {
                let params = self.current_room()?.create_transport(&self.peer_id).await?;
                Ok(Some(to_json(&params)))
            }
            ClientRequest::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.current_room()?
                    .connect_transport(&self.peer_id, &transport_id, dtls_parameters)
                    .await?;
                Ok(Some(json!("success")))
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let producer_id = self
                    .current_room()?
                    .produce(&self.peer_id, &transport_id, kind, rtp_parameters)
                    .await?;
                Ok(Some(json!({ "producer_id": producer_id })))
            }
            ClientRequest::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let params = self
                    .current_room()?
                    .consume(&self.peer_id, &transport_id, &producer_id, rtp_capabilities)
                    .await?;
                Ok(Some(params.map_or(Value::Null, |params| to_json(&params))))
            }
            ClientRequest::GetProducers => {
                let producers = self.current_room()?.producer_list();
                let listed = to_json(&producers);
                self.channel.send(ServerEvent::NewProducers(producers));
                Ok(Some(listed))
            }
            ClientRequest::GetMyRoomInfo => Ok(Some(to_json(&self.current_room()?.snapshot()))),
            ClientRequest::ProducerClosed { producer_id } => {
                if let Err(e) = self
                    .current_room()
                    .and_then(|room| room.close_producer(&self.peer_id, &producer_id))
                {
                    debug!(peer_id = %self.peer_id, producer_id = %producer_id, error = %e, "Producer close ignored");
                }
                Ok(None)
            }
            ClientRequest::ExitRoom => {
                let room_id = self
                    .room_id
                    .take()
                    .ok_or_else(|| SfuError::PeerNotFound(self.peer_id.clone()))?;
                self.registry.leave(&room_id, &self.peer_id)?;
                info!(room_id = %room_id, peer_id = %self.peer_id, "User exited room");
                Ok(Some(json!("successfully exited room")))
            }
        }
    }

    /// Leave the current room, if any, when the connection goes away
    pub fn disconnect(&mut self) {
        let Some(room_id) = self.room_id.take() else {
            return;
        };
        match self.registry.leave(&room_id, &self.peer_id) {
            Ok(_) => info!(room_id = %room_id, peer_id = %self.peer_id, "User disconnected"),
            Err(e) => debug!(room_id = %room_id, peer_id = %self.peer_id, error = %e, "Room already gone on disconnect"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn to_json(value: &impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
