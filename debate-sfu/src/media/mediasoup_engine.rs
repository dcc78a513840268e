//! mediasoup-backed media engine
//!
//! Workers are created once at startup and handed out round-robin, one
//! router per room. A dead worker cannot be replaced in place, so its death
//! cancels the engine's fatal token and the binary exits after a grace period.

use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::{MediaKind as EngineMediaKind, RtpCodecParametersParameters};
use mediasoup::consumer::ConsumerType;
use mediasoup::worker::WorkerLogLevel;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ConsumerType as SfuConsumerType, DtlsParameters as DtlsValue, MediaConsumer, MediaEngine, MediaKind,
    MediaProducer, MediaRouter, MediaTransport, RtpCapabilities as CapabilitiesValue,
    RtpParameters as ParametersValue, TransportParams,
};
use crate::error::{Result, SfuError};
use crate::types::{ConsumerId as SfuConsumerId, ProducerId as SfuProducerId, TransportId as SfuTransportId};

const OPUS_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(48000) {
    Some(rate) => rate,
    None => panic!("zero clock rate"),
};
const VIDEO_CLOCK_RATE: NonZeroU32 = match NonZeroU32::new(90000) {
    Some(rate) => rate,
    None => panic!("zero clock rate"),
};
const STEREO: NonZeroU8 = match NonZeroU8::new(2) {
    Some(channels) => channels,
    None => panic!("zero channels"),
};

/// Worker pool and transport settings
#[derive(Debug, Clone)]
pub struct MediasoupSettings {
    /// 0 = one worker per CPU
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub max_incoming_bitrate: u32,
    pub initial_available_outgoing_bitrate: u32,
}

impl TryFrom<&debate_core::config::EngineConfig> for MediasoupSettings {
    type Error = SfuError;

    fn try_from(config: &debate_core::config::EngineConfig) -> Result<Self> {
        let listen_ip = config
            .listen_ip
            .parse()
            .map_err(|e| SfuError::Engine(format!("invalid listen ip {}: {e}", config.listen_ip)))?;
        Ok(Self {
            num_workers: config.num_workers,
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            listen_ip,
            announced_address: config.announced_address.clone(),
            max_incoming_bitrate: config.max_incoming_bitrate,
            initial_available_outgoing_bitrate: config.initial_available_outgoing_bitrate,
        })
    }
}

fn engine_error(context: &str, e: impl std::fmt::Display) -> SfuError {
    SfuError::Engine(format!("{context}: {e}"))
}

fn from_value<T: DeserializeOwned>(what: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| SfuError::Negotiation(format!("invalid {what}: {e}")))
}

fn to_value(value: &impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: OPUS_CLOCK_RATE,
            channels: STEREO,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([("x-google-start-bitrate", 1000_u32.into())]),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp9,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("profile-id", 2_u32.into()),
                ("x-google-start-bitrate", 1000_u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "4d0032".into()),
                ("level-asymmetry-allowed", 1_u32.into()),
                ("x-google-start-bitrate", 1000_u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
                ("level-asymmetry-allowed", 1_u32.into()),
                ("x-google-start-bitrate", 1000_u32.into()),
            ]),
            rtcp_feedback: vec![],
        },
    ]
}

const fn to_engine_kind(kind: MediaKind) -> EngineMediaKind {
    match kind {
        MediaKind::Audio => EngineMediaKind::Audio,
        MediaKind::Video => EngineMediaKind::Video,
    }
}

const fn from_engine_kind(kind: EngineMediaKind) -> MediaKind {
    match kind {
        EngineMediaKind::Audio => MediaKind::Audio,
        EngineMediaKind::Video => MediaKind::Video,
    }
}

fn parse_producer_id(producer_id: &SfuProducerId) -> Result<ProducerId> {
    producer_id
        .as_str()
        .parse()
        .map_err(|_| SfuError::ProducerNotFound(producer_id.clone()))
}

pub struct MediasoupEngine {
    _worker_manager: WorkerManager,
    workers: Vec<Worker>,
    next: AtomicUsize,
    settings: Arc<MediasoupSettings>,
    fatal: CancellationToken,
}

impl MediasoupEngine {
    /// Spawn the worker pool
    pub async fn start(settings: MediasoupSettings) -> Result<Self> {
        let count = if settings.num_workers == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            settings.num_workers
        };

        let worker_manager = WorkerManager::new();
        let fatal = CancellationToken::new();
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let mut worker_settings = WorkerSettings::default();
            worker_settings.log_level = WorkerLogLevel::Warn;
            let worker = worker_manager
                .create_worker(worker_settings)
                .await
                .map_err(|e| engine_error("failed to create worker", e))?;

            let token = fatal.clone();
            let worker_id = worker.id();
            worker
                .on_dead(move |reason| {
                    error!(index, worker_id = %worker_id, reason = ?reason, "Media worker died");
                    token.cancel();
                })
                .detach();
            debug!(index, worker_id = %worker.id(), "Media worker started");
            workers.push(worker);
        }

        info!(workers = workers.len(), "Media engine started");
        Ok(Self {
            _worker_manager: worker_manager,
            workers,
            next: AtomicUsize::new(0),
            settings: Arc::new(settings),
            fatal,
        })
    }

    /// Cancelled once any worker dies
    #[must_use]
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    fn next_worker(&self) -> Result<&Worker> {
        if self.workers.is_empty() {
            return Err(SfuError::Engine("no media workers".into()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers
            .get(index)
            .ok_or_else(|| SfuError::Engine("no media workers".into()))
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>> {
        if self.fatal.is_cancelled() {
            return Err(SfuError::Engine("media worker pool is dead".into()));
        }
        let router = self
            .next_worker()?
            .create_router(RouterOptions::new(media_codecs()))
            .await
            .map_err(|e| engine_error("failed to create router", e))?;
        debug!(router_id = %router.id(), "Router created");
        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            router: Mutex::new(Some(router)),
            settings: Arc::clone(&self.settings),
        }))
    }
}

struct MediasoupRouter {
    id: String,
    router: Mutex<Option<Router>>,
    settings: Arc<MediasoupSettings>,
}

impl MediasoupRouter {
    fn router(&self) -> Result<Router> {
        self.router.lock().clone().ok_or(SfuError::Closed)
    }

    fn listen_info(&self, ip: IpAddr, announced_address: Option<String>) -> ListenInfo {
        ListenInfo {
            protocol: Protocol::Udp,
            ip,
            announced_address,
            port: None,
            port_range: Some(self.settings.rtc_min_port..=self.settings.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> CapabilitiesValue {
        self.router
            .lock()
            .as_ref()
            .map_or(Value::Null, |router| to_value(router.rtp_capabilities()))
    }

    fn can_consume(&self, producer_id: &SfuProducerId, rtp_capabilities: &CapabilitiesValue) -> bool {
        let Ok(producer_id) = parse_producer_id(producer_id) else {
            return false;
        };
        let Ok(capabilities) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return false;
        };
        self.router
            .lock()
            .as_ref()
            .is_some_and(|router| router.can_consume(&producer_id, &capabilities))
    }

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn MediaTransport>> {
        let router = self.router()?;
        let udp = self.listen_info(self.settings.listen_ip, self.settings.announced_address.clone());
        let tcp = ListenInfo {
            protocol: Protocol::Tcp,
            ..self.listen_info(self.settings.listen_ip, self.settings.announced_address.clone())
        };

        let mut options = WebRtcTransportOptions::new(WebRtcTransportListenInfos::new(udp).insert(tcp));
        options.enable_udp = true;
        options.enable_tcp = true;
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate = self.settings.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| engine_error("failed to create webrtc transport", e))?;

        if let Err(e) = transport.set_max_incoming_bitrate(self.settings.max_incoming_bitrate).await {
            warn!(transport_id = %transport.id(), error = %e, "Failed to cap incoming bitrate");
        }

        Ok(Arc::new(MediasoupTransport {
            id: SfuTransportId::from(transport.id().to_string()),
            inner: Mutex::new(Some(TransportKind::WebRtc(transport))),
        }))
    }

    async fn create_relay_transport(&self, port: u16) -> Result<Arc<dyn MediaTransport>> {
        let router = self.router()?;
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut options = PlainTransportOptions::new(ListenInfo {
            port_range: None,
            ..self.listen_info(loopback, None)
        });
        options.rtcp_mux = true;
        options.comedia = false;

        let transport = router
            .create_plain_transport(options)
            .await
            .map_err(|e| engine_error("failed to create relay transport", e))?;
        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(loopback),
                port: Some(port),
                rtcp_port: None,
                srtp_parameters: None,
            })
            .await
            .map_err(|e| engine_error("failed to connect relay transport", e))?;
        debug!(transport_id = %transport.id(), port, "Relay transport connected");

        Ok(Arc::new(MediasoupTransport {
            id: SfuTransportId::from(transport.id().to_string()),
            inner: Mutex::new(Some(TransportKind::Plain(transport))),
        }))
    }

    fn close(&self) {
        if self.router.lock().take().is_some() {
            debug!(router_id = %self.id, "Router closed");
        }
    }
}

#[derive(Clone)]
enum TransportKind {
    WebRtc(WebRtcTransport),
    Plain(PlainTransport),
}

struct MediasoupTransport {
    id: SfuTransportId,
    inner: Mutex<Option<TransportKind>>,
}

impl MediasoupTransport {
    fn transport(&self) -> Result<TransportKind> {
        self.inner.lock().clone().ok_or(SfuError::Closed)
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
    fn id(&self) -> SfuTransportId {
        self.id.clone()
    }

    fn params(&self) -> TransportParams {
        let (ice_parameters, ice_candidates, dtls_parameters) = match self.inner.lock().as_ref() {
            Some(TransportKind::WebRtc(transport)) => (
                to_value(transport.ice_parameters()),
                to_value(transport.ice_candidates()),
                to_value(&transport.dtls_parameters()),
            ),
            _ => (Value::Null, Value::Null, Value::Null),
        };
        TransportParams {
            id: self.id.clone(),
            ice_parameters,
            ice_candidates,
            dtls_parameters,
        }
    }

    async fn connect(&self, dtls_parameters: DtlsValue) -> Result<()> {
        let TransportKind::WebRtc(transport) = self.transport()? else {
            return Err(SfuError::Negotiation("relay transports are connected on creation".into()));
        };
        let dtls_parameters: DtlsParameters = from_value("dtls parameters", dtls_parameters)?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| SfuError::Negotiation(e.to_string()))
    }

    async fn produce(&self, kind: MediaKind, rtp_parameters: ParametersValue) -> Result<Arc<dyn MediaProducer>> {
        let rtp_parameters: RtpParameters = from_value("rtp parameters", rtp_parameters)?;
        let options = ProducerOptions::new(to_engine_kind(kind), rtp_parameters);
        let producer = match self.transport()? {
            TransportKind::WebRtc(transport) => transport.produce(options).await,
            TransportKind::Plain(transport) => transport.produce(options).await,
        }
        .map_err(|e| SfuError::Negotiation(e.to_string()))?;

        Ok(Arc::new(MediasoupProducer {
            id: SfuProducerId::from(producer.id().to_string()),
            kind,
            inner: Mutex::new(Some(producer)),
        }))
    }

    async fn consume(
        &self,
        producer_id: &SfuProducerId,
        rtp_capabilities: CapabilitiesValue,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        let engine_producer_id = parse_producer_id(producer_id)?;
        let rtp_capabilities: RtpCapabilities = from_value("rtp capabilities", rtp_capabilities)?;
        let mut options = ConsumerOptions::new(engine_producer_id, rtp_capabilities);
        options.paused = paused;

        let consumer = match self.transport()? {
            TransportKind::WebRtc(transport) => transport.consume(options).await,
            TransportKind::Plain(transport) => transport.consume(options).await,
        }
        .map_err(|e| SfuError::Negotiation(e.to_string()))?;

        Ok(Arc::new(MediasoupConsumer {
            id: SfuConsumerId::from(consumer.id().to_string()),
            producer_id: producer_id.clone(),
            inner: Mutex::new(Some(consumer)),
        }))
    }

    fn close(&self) {
        if self.inner.lock().take().is_some() {
            debug!(transport_id = %self.id, "Transport closed");
        }
    }
}

struct MediasoupProducer {
    id: SfuProducerId,
    kind: MediaKind,
    inner: Mutex<Option<Producer>>,
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> SfuProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.inner.lock().take();
    }
}

struct MediasoupConsumer {
    id: SfuConsumerId,
    producer_id: SfuProducerId,
    inner: Mutex<Option<Consumer>>,
}

impl MediasoupConsumer {
    fn consumer(&self) -> Result<Consumer> {
        self.inner
            .lock()
            .clone()
            .ok_or_else(|| SfuError::ConsumerNotFound(self.id.clone()))
    }
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
    fn id(&self) -> SfuConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> SfuProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.inner
            .lock()
            .as_ref()
            .map_or(MediaKind::Audio, |consumer| from_engine_kind(consumer.kind()))
    }

    fn rtp_parameters(&self) -> ParametersValue {
        self.inner
            .lock()
            .as_ref()
            .map_or(Value::Null, |consumer| to_value(consumer.rtp_parameters()))
    }

    fn consumer_type(&self) -> SfuConsumerType {
        match self.inner.lock().as_ref().map(Consumer::r#type) {
            Some(ConsumerType::Simulcast) => SfuConsumerType::Simulcast,
            Some(ConsumerType::Svc) => SfuConsumerType::Svc,
            Some(ConsumerType::Pipe) => SfuConsumerType::Pipe,
            _ => SfuConsumerType::Simple,
        }
    }

    fn producer_paused(&self) -> bool {
        self.inner.lock().as_ref().is_some_and(Consumer::producer_paused)
    }

    async fn resume(&self) -> Result<()> {
        self.consumer()?
            .resume()
            .await
            .map_err(|e| engine_error("failed to resume consumer", e))
    }

    async fn request_key_frame(&self) -> Result<()> {
        self.consumer()?
            .request_key_frame()
            .await
            .map_err(|e| engine_error("failed to request key frame", e))
    }

    async fn set_preferred_layers(&self, spatial_layer: u8, temporal_layer: Option<u8>) -> Result<()> {
        self.consumer()?
            .set_preferred_layers(ConsumerLayers {
                spatial_layer,
                temporal_layer,
            })
            .await
            .map_err(|e| engine_error("failed to set preferred layers", e))
    }

    fn close(&self) {
        self.inner.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_list() {
        let codecs = media_codecs();
        assert_eq!(codecs.len(), 5);
        assert!(matches!(
            codecs[0],
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                ..
            }
        ));
    }

    #[test]
    fn test_settings_from_config() {
        let config = debate_core::config::EngineConfig::default();
        let settings = MediasoupSettings::try_from(&config).unwrap();
        assert_eq!(settings.max_incoming_bitrate, 1_500_000);
        assert_eq!(settings.rtc_min_port, 10000);

        let bad = debate_core::config::EngineConfig {
            listen_ip: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(MediasoupSettings::try_from(&bad).is_err());
    }
}
