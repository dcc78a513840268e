//! In-memory media engine, recorder launcher and report sink for tests

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;

use crate::config::SfuConfig;
use crate::error::{Result, SfuError};
use crate::manager::RoomRegistry;
use crate::media::{
    ConsumerType, DtlsParameters, MediaConsumer, MediaEngine, MediaKind, MediaProducer, MediaRouter, MediaTransport,
    RtpCapabilities, RtpParameters, TransportParams,
};
use crate::ports::PortAllocator;
use crate::recording::{RecorderChild, RecorderExit, RecorderLauncher, RecordingDescription, RecordingServices};
use crate::report::{RecordReport, ReportSink};
use crate::types::{ConsumerId, ProducerId, TransportId};

fn next_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[must_use]
pub fn audio_rtp_parameters() -> RtpParameters {
    json!({
        "codecs": [{ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2 }],
        "encodings": [{ "ssrc": 1111 }]
    })
}

#[must_use]
pub fn video_rtp_parameters() -> RtpParameters {
    json!({
        "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }],
        "encodings": [{ "ssrc": 2222 }]
    })
}

fn parameters_for(kind: MediaKind) -> RtpParameters {
    match kind {
        MediaKind::Audio => audio_rtp_parameters(),
        MediaKind::Video => video_rtp_parameters(),
    }
}

/// Recording services over `min..=max` with a one second resume delay
#[must_use]
pub fn test_services(launcher: FakeLauncher, min: u16, max: u16) -> RecordingServices {
    RecordingServices {
        ports: Arc::new(PortAllocator::new(min, max)),
        launcher: Arc::new(launcher),
        resume_delay: Duration::from_secs(1),
        tasks: TaskTracker::new(),
    }
}

/// Registry over a fresh fake engine
#[must_use]
pub fn test_registry(
    config: SfuConfig,
) -> (Arc<RoomRegistry>, Arc<FakeEngine>, mpsc::UnboundedReceiver<RecordReport>) {
    let engine = Arc::new(FakeEngine::new());
    let (registry, reports) = test_registry_with(config, Arc::clone(&engine));
    (registry, engine, reports)
}

#[must_use]
pub fn test_registry_with(
    config: SfuConfig,
    engine: Arc<FakeEngine>,
) -> (Arc<RoomRegistry>, mpsc::UnboundedReceiver<RecordReport>) {
    let (sink, reports) = ChannelReportSink::new();
    let registry = RoomRegistry::new(config, engine, Arc::new(FakeLauncher::new()), sink);
    (registry, reports)
}

// Engine

#[derive(Default)]
pub struct FakeEngine {
    routers: Mutex<Vec<Arc<FakeRouter>>>,
    fail_next: AtomicBool,
}

impl FakeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_router(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn routers(&self) -> Vec<Arc<FakeRouter>> {
        self.routers.lock().clone()
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers.lock().len()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_router(&self) -> Result<Arc<dyn MediaRouter>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SfuError::Engine("worker unavailable".into()));
        }
        let router = Arc::new(FakeRouter::new());
        self.routers.lock().push(Arc::clone(&router));
        Ok(router)
    }
}

// Router

struct RouterState {
    consumer_type: Mutex<ConsumerType>,
    can_consume: AtomicBool,
    fail_relay_consume: AtomicBool,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    producers: Mutex<HashMap<ProducerId, Arc<FakeProducer>>>,
    consumers: Mutex<HashMap<ConsumerId, Arc<FakeConsumer>>>,
    relay_consumers: Mutex<Vec<Arc<FakeConsumer>>>,
}

pub struct FakeRouter {
    id: String,
    state: Arc<RouterState>,
    closed: AtomicBool,
}

impl Default for FakeRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRouter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: next_id(),
            state: Arc::new(RouterState {
                consumer_type: Mutex::new(ConsumerType::Simple),
                can_consume: AtomicBool::new(true),
                fail_relay_consume: AtomicBool::new(false),
                transports: Mutex::new(Vec::new()),
                producers: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                relay_consumers: Mutex::new(Vec::new()),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Delivery type of consumers created from now on
    pub fn set_consumer_type(&self, consumer_type: ConsumerType) {
        *self.state.consumer_type.lock() = consumer_type;
    }

    pub fn set_can_consume(&self, can_consume: bool) {
        self.state.can_consume.store(can_consume, Ordering::SeqCst);
    }

    /// Make consumes on relay transports fail
    pub fn fail_relay_consume(&self, fail: bool) {
        self.state.fail_relay_consume.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn consumer(&self, id: &ConsumerId) -> Option<Arc<FakeConsumer>> {
        self.state.consumers.lock().get(id).cloned()
    }

    #[must_use]
    pub fn producer_closed(&self, id: &ProducerId) -> bool {
        self.state.producers.lock().get(id).is_some_and(|p| p.is_closed())
    }

    #[must_use]
    pub fn relay_consumers(&self) -> Vec<Arc<FakeConsumer>> {
        self.state.relay_consumers.lock().clone()
    }

    #[must_use]
    pub fn relay_transports(&self) -> Vec<Arc<FakeTransport>> {
        self.state
            .transports
            .lock()
            .iter()
            .filter(|t| t.relay_port.is_some())
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn transport(&self, id: &TransportId) -> Option<Arc<FakeTransport>> {
        self.state.transports.lock().iter().find(|t| &t.id == id).cloned()
    }

    fn add_transport(&self, relay_port: Option<u16>) -> Result<Arc<dyn MediaTransport>> {
        if self.is_closed() {
            return Err(SfuError::Engine("router closed".into()));
        }
        let transport = Arc::new(FakeTransport {
            id: TransportId::from(next_id()),
            relay_port,
            router: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        });
        self.state.transports.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[async_trait]
impl MediaRouter for FakeRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        json!({
            "codecs": [
                { "kind": "audio", "mimeType": "audio/opus", "preferredPayloadType": 100, "clockRate": 48000, "channels": 2 },
                { "kind": "video", "mimeType": "video/VP8", "preferredPayloadType": 101, "clockRate": 90000 }
            ],
            "headerExtensions": []
        })
    }

    fn can_consume(&self, producer_id: &ProducerId, _rtp_capabilities: &RtpCapabilities) -> bool {
        self.state.can_consume.load(Ordering::SeqCst)
            && self
                .state
                .producers
                .lock()
                .get(producer_id)
                .is_some_and(|p| !p.is_closed())
    }

    async fn create_webrtc_transport(&self) -> Result<Arc<dyn MediaTransport>> {
        self.add_transport(None)
    }

    async fn create_relay_transport(&self, port: u16) -> Result<Arc<dyn MediaTransport>> {
        self.add_transport(Some(port))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for transport in self.state.transports.lock().iter() {
            transport.close();
        }
    }
}

// Transport

pub struct FakeTransport {
    id: TransportId,
    relay_port: Option<u16>,
    router: Arc<RouterState>,
    closed: AtomicBool,
}

impl FakeTransport {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub const fn relay_port(&self) -> Option<u16> {
        self.relay_port
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::Engine(format!("transport {} closed", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaTransport for FakeTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn params(&self) -> TransportParams {
        TransportParams {
            id: self.id.clone(),
            ice_parameters: json!({ "usernameFragment": "u", "password": "p" }),
            ice_candidates: json!([]),
            dtls_parameters: json!({ "role": "auto", "fingerprints": [] }),
        }
    }

    async fn connect(&self, _dtls_parameters: DtlsParameters) -> Result<()> {
        self.ensure_open()
    }

    async fn produce(&self, kind: MediaKind, _rtp_parameters: RtpParameters) -> Result<Arc<dyn MediaProducer>> {
        self.ensure_open()?;
        let producer = Arc::new(FakeProducer {
            id: ProducerId::from(next_id()),
            kind,
            closed: AtomicBool::new(false),
        });
        self.router
            .producers
            .lock()
            .insert(producer.id.clone(), Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>> {
        self.ensure_open()?;
        if self.relay_port.is_some() && self.router.fail_relay_consume.load(Ordering::SeqCst) {
            return Err(SfuError::Engine("relay consume rejected".into()));
        }
        let kind = self
            .router
            .producers
            .lock()
            .get(producer_id)
            .filter(|p| !p.is_closed())
            .map(|p| p.kind)
            .ok_or_else(|| SfuError::Engine(format!("cannot consume producer {producer_id}")))?;

        let consumer = Arc::new(FakeConsumer {
            id: ConsumerId::from(next_id()),
            producer_id: producer_id.clone(),
            kind,
            consumer_type: *self.router.consumer_type.lock(),
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            key_frame_requests: AtomicUsize::new(0),
            preferred_layers: Mutex::new(None),
        });
        self.router
            .consumers
            .lock()
            .insert(consumer.id.clone(), Arc::clone(&consumer));
        if self.relay_port.is_some() {
            self.router.relay_consumers.lock().push(Arc::clone(&consumer));
        }
        Ok(consumer)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// Producer

pub struct FakeProducer {
    id: ProducerId,
    kind: MediaKind,
    closed: AtomicBool,
}

impl FakeProducer {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MediaProducer for FakeProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// Consumer

pub struct FakeConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    consumer_type: ConsumerType,
    paused: AtomicBool,
    closed: AtomicBool,
    key_frame_requests: AtomicUsize,
    preferred_layers: Mutex<Option<(u8, Option<u8>)>>,
}

impl FakeConsumer {
    #[must_use]
    pub fn preferred_layers(&self) -> Option<(u8, Option<u8>)> {
        *self.preferred_layers.lock()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn key_frame_requests(&self) -> usize {
        self.key_frame_requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaConsumer for FakeConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        parameters_for(self.kind)
    }

    fn consumer_type(&self) -> ConsumerType {
        self.consumer_type
    }

    fn producer_paused(&self) -> bool {
        false
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request_key_frame(&self) -> Result<()> {
        self.key_frame_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, spatial_layer: u8, temporal_layer: Option<u8>) -> Result<()> {
        *self.preferred_layers.lock() = Some((spatial_layer, temporal_layer));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// Recorder

type ExitSender = Arc<Mutex<Option<oneshot::Sender<RecorderExit>>>>;

#[derive(Default)]
struct LauncherState {
    launched: Mutex<Vec<(String, String)>>,
    exits: Mutex<Vec<ExitSender>>,
    terminations: AtomicUsize,
}

/// Launches fake recorders that run until terminated or told to exit
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<LauncherState>,
}

impl FakeLauncher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `(file_name, sdp)` of every launch so far
    #[must_use]
    pub fn launched(&self) -> Vec<(String, String)> {
        self.state.launched.lock().clone()
    }

    #[must_use]
    pub fn terminations(&self) -> usize {
        self.state.terminations.load(Ordering::SeqCst)
    }

    /// Make every running recorder exit with `exit`
    pub fn exit_all(&self, exit: RecorderExit) {
        for sender in self.state.exits.lock().iter() {
            if let Some(tx) = sender.lock().take() {
                let _ = tx.send(exit);
            }
        }
    }
}

impl RecorderLauncher for FakeLauncher {
    fn output_path(&self, description: &RecordingDescription) -> PathBuf {
        PathBuf::from(format!("/recordings/{}.webm", description.file_name))
    }

    fn launch(&self, description: &RecordingDescription, sdp: String) -> Result<Box<dyn RecorderChild>> {
        let (tx, rx) = oneshot::channel();
        let sender: ExitSender = Arc::new(Mutex::new(Some(tx)));
        self.state
            .launched
            .lock()
            .push((description.file_name.clone(), sdp));
        self.state.exits.lock().push(Arc::clone(&sender));
        Ok(Box::new(FakeChild {
            sender,
            receiver: rx,
            exited: None,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeChild {
    sender: ExitSender,
    receiver: oneshot::Receiver<RecorderExit>,
    exited: Option<RecorderExit>,
    state: Arc<LauncherState>,
}

impl FakeChild {
    fn exit_with(&self, exit: RecorderExit) {
        if let Some(tx) = self.sender.lock().take() {
            let _ = tx.send(exit);
        }
    }
}

#[async_trait]
impl RecorderChild for FakeChild {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait(&mut self) -> Result<RecorderExit> {
        if let Some(exit) = self.exited {
            return Ok(exit);
        }
        let exit = (&mut self.receiver)
            .await
            .map_err(|_| SfuError::Process("recorder vanished".into()))?;
        self.exited = Some(exit);
        Ok(exit)
    }

    fn terminate(&mut self) -> Result<()> {
        self.state.terminations.fetch_add(1, Ordering::SeqCst);
        // interrupted ffmpeg exits with 255
        self.exit_with(RecorderExit {
            success: false,
            code: Some(255),
        });
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.exit_with(RecorderExit {
            success: false,
            code: None,
        });
        Ok(())
    }
}

/// Launcher whose recorder binary is missing
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingLauncher;

impl RecorderLauncher for FailingLauncher {
    fn output_path(&self, description: &RecordingDescription) -> PathBuf {
        PathBuf::from(format!("/recordings/{}.webm", description.file_name))
    }

    fn launch(&self, _description: &RecordingDescription, _sdp: String) -> Result<Box<dyn RecorderChild>> {
        Err(SfuError::Process("recorder binary not found".into()))
    }
}

// Reports

/// Forwards published reports to a channel
pub struct ChannelReportSink {
    tx: mpsc::UnboundedSender<RecordReport>,
}

impl ChannelReportSink {
    #[must_use]
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RecordReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ReportSink for ChannelReportSink {
    async fn publish(&self, report: &RecordReport) -> Result<()> {
        self.tx
            .send(report.clone())
            .map_err(|_| SfuError::Report("report receiver dropped".into()))
    }
}
