//! JSON signaling frames
//!
//! Client → server: `{"id": 7, "event": "join", "data": {...}}`. The `id` is
//! optional; requests without one get no response frame.
//!
//! Server → client:
//! - response `{"id": 7, "ok": true, "data": ...}`
//! - error `{"id": 7, "ok": false, "error": {"code": "...", "message": "..."}}`
//! - push `{"event": "rule", "data": {...}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use debate_sfu::media::{DtlsParameters, RtpCapabilities, RtpParameters};
use debate_sfu::{Debate, MediaKind, ProducerId, RoomId, SfuError, TransportId};

/// Raw client frame before its payload is interpreted
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, ErrorBody> {
        serde_json::from_str(text).map_err(|e| ErrorBody::bad_request(format!("malformed frame: {e}")))
    }

    /// Interpret `event`/`data` as a request
    pub fn request(&self) -> Result<ClientRequest, ErrorBody> {
        let tagged = if self.data.is_null() {
            serde_json::json!({ "event": self.event })
        } else {
            serde_json::json!({ "event": self.event, "data": self.data })
        };
        serde_json::from_value(tagged)
            .map_err(|e| ErrorBody::bad_request(format!("invalid {} request: {e}", self.event)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientRequest {
    CreateRoom {
        room_id: RoomId,
        name: String,
        #[serde(default)]
        debate: Option<Debate>,
    },
    Join {
        room_id: RoomId,
        name: String,
    },
    Start {
        room_id: RoomId,
        name: String,
    },
    SwapUser {
        team_0: usize,
        order_0: usize,
        team_1: usize,
        order_1: usize,
    },
    GetRouterRtpCapabilities,
    CreateWebRtcTransport,
    ConnectTransport {
        transport_id: TransportId,
        #[serde(rename = "dtlsParameters")]
        dtls_parameters: DtlsParameters,
    },
    Produce {
        #[serde(rename = "producerTransportId")]
        transport_id: TransportId,
        kind: MediaKind,
        #[serde(rename = "rtpParameters")]
        rtp_parameters: RtpParameters,
    },
    Consume {
        #[serde(rename = "consumerTransportId")]
        transport_id: TransportId,
        #[serde(rename = "producerId")]
        producer_id: ProducerId,
        #[serde(rename = "rtpCapabilities")]
        rtp_capabilities: RtpCapabilities,
    },
    GetProducers,
    GetMyRoomInfo,
    ProducerClosed {
        producer_id: ProducerId,
    },
    ExitRoom,
}

impl ClientRequest {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom { .. } => "createRoom",
            Self::Join { .. } => "join",
            Self::Start { .. } => "start",
            Self::SwapUser { .. } => "swapUser",
            Self::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Self::CreateWebRtcTransport => "createWebRtcTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::GetProducers => "getProducers",
            Self::GetMyRoomInfo => "getMyRoomInfo",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::ExitRoom => "exitRoom",
        }
    }
}

/// Structured failure returned to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ErrorBody {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            code: "BadRequest".to_string(),
            message: message.into(),
        }
    }
}

impl From<&SfuError> for ErrorBody {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Answer to a request that carried an id
#[derive(Debug, Clone, Serialize)]
pub struct ResponseFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseFrame {
    #[must_use]
    pub const fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub const fn error(id: u64, error: ErrorBody) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debate_sfu::ServerEvent;

    #[test]
    fn test_parse_join() {
        let frame = ClientFrame::parse(r#"{"id": 3, "event": "join", "data": {"room_id": "r1", "name": "alice"}}"#).unwrap();
        assert_eq!(frame.id, Some(3));
        match frame.request().unwrap() {
            ClientRequest::Join { room_id, name } => {
                assert_eq!(room_id.as_str(), "r1");
                assert_eq!(name, "alice");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_parse_requests_without_data() {
        let frame = ClientFrame::parse(r#"{"event": "getRouterRtpCapabilities"}"#).unwrap();
        assert!(frame.id.is_none());
        assert!(matches!(frame.request().unwrap(), ClientRequest::GetRouterRtpCapabilities));

        let frame = ClientFrame::parse(r#"{"id": 1, "event": "exitRoom", "data": null}"#).unwrap();
        assert!(matches!(frame.request().unwrap(), ClientRequest::ExitRoom));
    }

    #[test]
    fn test_parse_media_requests_use_client_field_names() {
        let frame = ClientFrame::parse(
            r#"{"id": 9, "event": "produce", "data": {
                "producerTransportId": "t1",
                "kind": "video",
                "rtpParameters": {"codecs": []}
            }}"#,
        )
        .unwrap();
        match frame.request().unwrap() {
            ClientRequest::Produce {
                transport_id, kind, ..
            } => {
                assert_eq!(transport_id.as_str(), "t1");
                assert_eq!(kind, MediaKind::Video);
            }
            other => panic!("unexpected request {other:?}"),
        }

        let frame = ClientFrame::parse(
            r#"{"event": "consume", "data": {"consumerTransportId": "t2", "producerId": "p", "rtpCapabilities": {}}}"#,
        )
        .unwrap();
        assert_eq!(frame.request().unwrap().name(), "consume");
    }

    #[test]
    fn test_create_room_with_custom_debate() {
        let frame = ClientFrame::parse(
            r#"{"event": "createRoom", "data": {"room_id": "r", "name": "host", "debate": {
                "name": "quick", "team_size": 2, "order_size": 1,
                "rules": [{"debater": "team_a_1", "msg": "go", "time": 5}]
            }}}"#,
        )
        .unwrap();
        match frame.request().unwrap() {
            ClientRequest::CreateRoom { debate: Some(debate), .. } => {
                assert_eq!(debate.max_count(), 2);
                assert_eq!(debate.rules.len(), 1);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_bad_request() {
        let frame = ClientFrame::parse(r#"{"id": 1, "event": "dance"}"#).unwrap();
        let err = frame.request().unwrap_err();
        assert_eq!(err.code, "BadRequest");
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn test_response_frames() {
        let ok = serde_json::to_value(ResponseFrame::ok(1, serde_json::json!("success"))).unwrap();
        assert_eq!(ok, serde_json::json!({"id": 1, "ok": true, "data": "success"}));

        let err = ResponseFrame::error(2, ErrorBody::from(&SfuError::RoomFull));
        let value = serde_json::to_value(err).unwrap();
        assert_eq!(value["ok"], false);
        assert_eq!(value["error"]["code"], "Capacity");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_push_frame_shape() {
        let value = serde_json::to_value(ServerEvent::Swap {
            team_0: 0,
            order_0: 0,
            team_1: 1,
            order_1: 0,
        })
        .unwrap();
        assert_eq!(value["event"], "swap");
        assert_eq!(value["data"]["team_1"], 1);
    }
}
