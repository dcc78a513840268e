//! Media engine capability surface
//!
//! The SFU core never speaks to the media engine directly; it goes through
//! these traits. Negotiation documents (DTLS parameters, RTP parameters, RTP
//! capabilities, transport connection parameters) are carried as opaque JSON
//! and only interpreted by the engine implementation, except for the few
//! codec fields a recorder needs.

#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::{Result, SfuError};
use crate::types::{ConsumerId, ProducerId, TransportId};

pub type DtlsParameters = Value;
pub type RtpParameters = Value;
pub type RtpCapabilities = Value;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

/// Consumer delivery type as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
    Pipe,
}

/// Parameters a client needs to set up its side of a WebRTC transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: Value,
    pub ice_candidates: Value,
    pub dtls_parameters: Value,
}

/// The codec fields a recorder needs to describe one RTP stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpCodecInfo {
    pub payload_type: u8,
    /// Codec name without the kind prefix, e.g. `opus` or `VP8`
    pub codec_name: String,
    pub clock_rate: u32,
    /// Channel count, audio only
    pub channels: Option<u8>,
}

impl RtpCodecInfo {
    /// Read the first codec of a consumer's RTP parameters
    pub fn from_rtp_parameters(kind: MediaKind, rtp_parameters: &RtpParameters) -> Result<Self> {
        let codec = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .ok_or_else(|| SfuError::InvalidDescription("rtp parameters carry no codec".into()))?;

        let payload_type = codec
            .get("payloadType")
            .and_then(Value::as_u64)
            .and_then(|pt| u8::try_from(pt).ok())
            .ok_or_else(|| SfuError::InvalidDescription("codec without payload type".into()))?;
        let mime_type = codec
            .get("mimeType")
            .and_then(Value::as_str)
            .ok_or_else(|| SfuError::InvalidDescription("codec without mime type".into()))?;
        let clock_rate = codec
            .get("clockRate")
            .and_then(Value::as_u64)
            .and_then(|rate| u32::try_from(rate).ok())
            .ok_or_else(|| SfuError::InvalidDescription("codec without clock rate".into()))?;

        let prefix = format!("{}/", kind.as_str());
        let codec_name = mime_type
            .get(..prefix.len())
            .filter(|head| head.eq_ignore_ascii_case(&prefix))
            .and_then(|_| mime_type.get(prefix.len()..))
            .unwrap_or(mime_type)
            .to_string();

        let channels = match kind {
            MediaKind::Audio => codec
                .get("channels")
                .and_then(Value::as_u64)
                .and_then(|c| u8::try_from(c).ok()),
            MediaKind::Video => None,
        };

        Ok(Self {
            payload_type,
            codec_name,
            clock_rate,
            channels,
        })
    }
}

/// Entry point of a media engine: hands out routers, one per room
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>>;
}

#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> String;

    /// Codec/header-extension capabilities clients negotiate against
    fn rtp_capabilities(&self) -> RtpCapabilities;

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn MediaTransport>>;

    /// Plain RTP transport that sends to a recorder listening on `127.0.0.1:port`
    async fn create_relay_transport(&self, port: u16) -> Result<Arc<dyn MediaTransport>>;

    fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    async fn produce(&self, kind: MediaKind, rtp_parameters: RtpParameters) -> Result<Arc<dyn MediaProducer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>>;

    /// Idempotent
    fn close(&self);
}

pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    /// Idempotent
    fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;
    fn producer_id(&self) -> ProducerId;
    fn kind(&self) -> MediaKind;
    fn rtp_parameters(&self) -> RtpParameters;
    fn consumer_type(&self) -> ConsumerType;
    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> Result<()>;
    async fn request_key_frame(&self) -> Result<()>;
    async fn set_preferred_layers(&self, spatial_layer: u8, temporal_layer: Option<u8>) -> Result<()>;

    /// Idempotent
    fn close(&self);
}

/// Capabilities restricted to the router codec of one kind, as handed to a
/// relay transport so the recorder receives exactly one codec per stream.
#[must_use]
pub fn relay_capabilities(router_capabilities: &RtpCapabilities, kind: MediaKind) -> Option<RtpCapabilities> {
    let codec = router_capabilities
        .get("codecs")
        .and_then(Value::as_array)?
        .iter()
        .find(|codec| codec.get("kind").and_then(Value::as_str) == Some(kind.as_str()))?
        .clone();

    Some(serde_json::json!({
        "codecs": [codec],
        "headerExtensions": [],
    }))
}
