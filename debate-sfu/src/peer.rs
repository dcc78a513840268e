//! Debate participant
//!
//! A peer owns its media engine objects:
//! - client transports with the producers and consumers created on them
//! - the recording slot: relay transports, relay consumers, loopback ports
//!   and the recorder process fed by them
//!
//! Closing a transport closes everything created on it. Closing the peer
//! closes every transport and stops the recording.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{Result, SfuError};
use crate::media::{
    relay_capabilities, ConsumerType, DtlsParameters, MediaConsumer, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, RtpCapabilities, RtpCodecInfo, RtpParameters,
};
use crate::recording::{
    CompletionHandle, RecordingDescription, RecordingOutcome, RecordingProcess, RecordingServices, RelayDescriptor,
};
use crate::signal::{PeerChannel, ServerEvent};
use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, Seat, TransportId};

/// Layers requested for simulcast consumers
const PREFERRED_SPATIAL_LAYER: u8 = 2;
const PREFERRED_TEMPORAL_LAYER: u8 = 2;

/// Parameters a client needs to attach a consumer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub producer_id: ProducerId,
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

/// Public view of a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub name: String,
    pub team: usize,
    pub order: usize,
    pub recorded: bool,
}

struct ProducerEntry {
    producer: Arc<dyn MediaProducer>,
    transport_id: TransportId,
}

struct ConsumerEntry {
    consumer: Arc<dyn MediaConsumer>,
    transport_id: TransportId,
}

/// Relay carrying one producer to the recorder
pub struct RecordingRelay {
    pub descriptor: RelayDescriptor,
    transport: Arc<dyn MediaTransport>,
    consumer: Arc<dyn MediaConsumer>,
}

#[derive(Default)]
struct RecordingSlot {
    relays: Vec<RecordingRelay>,
    process: Option<RecordingProcess>,
    completion: Option<CompletionHandle>,
}

#[derive(Default)]
struct PeerState {
    transports: HashMap<TransportId, Arc<dyn MediaTransport>>,
    producers: HashMap<ProducerId, ProducerEntry>,
    consumers: HashMap<ConsumerId, ConsumerEntry>,
    recording: RecordingSlot,
}

pub struct Peer {
    /// Connection id
    id: PeerId,

    /// Display name
    name: String,

    room_id: RoomId,

    channel: PeerChannel,

    recording_services: RecordingServices,

    state: Mutex<PeerState>,

    /// Set once, before the state is torn down
    closed: AtomicBool,

    /// False once a recording setup failed
    recorded: AtomicBool,
}

impl Peer {
    pub fn new(
        id: PeerId,
        name: impl Into<String>,
        room_id: RoomId,
        channel: PeerChannel,
        recording_services: RecordingServices,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            room_id,
            channel,
            recording_services,
            state: Mutex::new(PeerState::default()),
            closed: AtomicBool::new(false),
            recorded: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_recorded(&self) -> bool {
        self.recorded.load(Ordering::Acquire)
    }

    /// Push an event to this peer's connection
    pub fn send(&self, event: ServerEvent) -> bool {
        self.channel.send(event)
    }

    #[must_use]
    pub fn snapshot(&self, seat: Seat) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            team: seat.team,
            order: seat.order,
            recorded: self.is_recorded(),
        }
    }

    #[must_use]
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.state.lock().producers.keys().cloned().collect()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state.lock().transports.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Ports currently held by this peer's recording relays
    #[must_use]
    pub fn recording_ports(&self) -> Vec<u16> {
        self.state
            .lock()
            .recording
            .relays
            .iter()
            .map(|relay| relay.descriptor.port)
            .collect()
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.state.lock().recording.process.is_some()
    }

    /// Register a transport. Closed peers close it right away.
    pub fn add_transport(&self, transport: Arc<dyn MediaTransport>) -> Result<()> {
        let mut state = self.state.lock();
        if self.is_closed() {
            drop(state);
            transport.close();
            return Err(SfuError::Closed);
        }
        debug!(peer_id = %self.id, transport_id = %transport.id(), "Adding transport");
        state.transports.insert(transport.id(), transport);
        Ok(())
    }

    fn transport(&self, transport_id: &TransportId) -> Result<Arc<dyn MediaTransport>> {
        self.state
            .lock()
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))
    }

    pub async fn connect_transport(&self, transport_id: &TransportId, dtls_parameters: DtlsParameters) -> Result<()> {
        let transport = self.transport(transport_id)?;
        transport.connect(dtls_parameters).await?;
        debug!(peer_id = %self.id, transport_id = %transport_id, "Transport connected");
        Ok(())
    }

    pub async fn create_producer(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let transport = self.transport(transport_id)?;
        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id();

        let mut state = self.state.lock();
        // The peer or the transport may have gone away while the engine was busy
        if self.is_closed() || !state.transports.contains_key(transport_id) {
            drop(state);
            producer.close();
            return Err(SfuError::Closed);
        }
        state.producers.insert(
            producer_id.clone(),
            ProducerEntry {
                producer,
                transport_id: transport_id.clone(),
            },
        );
        drop(state);

        info!(peer_id = %self.id, producer_id = %producer_id, kind = kind.as_str(), "Producer created");
        Ok(producer_id)
    }

    /// Consume `producer_id` on one of this peer's transports.
    ///
    /// An engine refusal surfaces as `Negotiation` and leaves the peer untouched.
    pub async fn create_consumer(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        let transport = self.transport(transport_id)?;
        let consumer = transport
            .consume(producer_id, rtp_capabilities, false)
            .await
            .map_err(|e| {
                warn!(peer_id = %self.id, producer_id = %producer_id, error = %e, "Consume failed");
                SfuError::Negotiation(e.to_string())
            })?;

        if consumer.consumer_type() == ConsumerType::Simulcast {
            if let Err(e) = consumer
                .set_preferred_layers(PREFERRED_SPATIAL_LAYER, Some(PREFERRED_TEMPORAL_LAYER))
                .await
            {
                warn!(consumer_id = %consumer.id(), error = %e, "Failed to set preferred layers");
            }
        }

        let params = ConsumerParams {
            producer_id: producer_id.clone(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
            consumer_type: consumer.consumer_type(),
            producer_paused: consumer.producer_paused(),
        };

        let mut state = self.state.lock();
        if self.is_closed() || !state.transports.contains_key(transport_id) {
            drop(state);
            consumer.close();
            return Err(SfuError::Closed);
        }
        state.consumers.insert(
            params.id.clone(),
            ConsumerEntry {
                consumer,
                transport_id: transport_id.clone(),
            },
        );
        drop(state);

        debug!(peer_id = %self.id, consumer_id = %params.id, producer_id = %producer_id, "Consumer created");
        Ok(params)
    }

    /// Idempotent; returns whether the producer was still open
    pub fn close_producer(&self, producer_id: &ProducerId) -> bool {
        let entry = self.state.lock().producers.remove(producer_id);
        match entry {
            Some(entry) => {
                entry.producer.close();
                info!(peer_id = %self.id, producer_id = %producer_id, "Producer closed");
                true
            }
            None => false,
        }
    }

    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> bool {
        let entry = self.state.lock().consumers.remove(consumer_id);
        entry.is_some_and(|entry| {
            entry.consumer.close();
            true
        })
    }

    /// Drop every consumer fed by `producer_id`, returning their ids
    pub fn remove_consumers_of(&self, producer_id: &ProducerId) -> Vec<ConsumerId> {
        let removed: Vec<ConsumerEntry> = {
            let mut state = self.state.lock();
            let ids: Vec<ConsumerId> = state
                .consumers
                .iter()
                .filter(|(_, entry)| &entry.consumer.producer_id() == producer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| state.consumers.remove(id)).collect()
        };

        removed
            .into_iter()
            .map(|entry| {
                entry.consumer.close();
                debug!(peer_id = %self.id, consumer_id = %entry.consumer.id(), "Consumer closed with its producer");
                entry.consumer.id()
            })
            .collect()
    }

    /// Close a transport and everything created on it. Returns the ids of
    /// the producers that went down with it.
    pub fn close_transport(&self, transport_id: &TransportId) -> Result<Vec<ProducerId>> {
        let (transport, producers, consumers) = {
            let mut state = self.state.lock();
            let transport = state
                .transports
                .remove(transport_id)
                .ok_or_else(|| SfuError::TransportNotFound(transport_id.clone()))?;
            let producers = drain_where(&mut state.producers, |entry| &entry.transport_id == transport_id);
            let consumers = drain_where(&mut state.consumers, |entry| &entry.transport_id == transport_id);
            (transport, producers, consumers)
        };

        for entry in &consumers {
            entry.consumer.close();
        }
        let closed: Vec<ProducerId> = producers
            .iter()
            .map(|entry| {
                entry.producer.close();
                entry.producer.id()
            })
            .collect();
        transport.close();

        debug!(
            peer_id = %self.id,
            transport_id = %transport_id,
            producers = closed.len(),
            consumers = consumers.len(),
            "Transport closed"
        );
        Ok(closed)
    }

    /// Create a relay for one producer: a loopback port, a plain transport
    /// sending to it, and a paused consumer restricted to the router codec.
    ///
    /// Nothing created here survives a failure.
    pub async fn publish_recording_relay(
        &self,
        router: &dyn MediaRouter,
        producer: &dyn MediaProducer,
    ) -> Result<RecordingRelay> {
        let kind = producer.kind();
        let rtp_capabilities = relay_capabilities(&router.rtp_capabilities(), kind)
            .ok_or_else(|| SfuError::Negotiation(format!("router has no {} codec", kind.as_str())))?;

        let ports = &self.recording_services.ports;
        let port = ports.acquire()?;

        let transport = match router.create_relay_transport(port).await {
            Ok(transport) => transport,
            Err(e) => {
                ports.release(port);
                return Err(e);
            }
        };

        let consumer = match transport.consume(&producer.id(), rtp_capabilities, true).await {
            Ok(consumer) => consumer,
            Err(e) => {
                transport.close();
                ports.release(port);
                return Err(e);
            }
        };

        let codec = match RtpCodecInfo::from_rtp_parameters(kind, &consumer.rtp_parameters()) {
            Ok(codec) => codec,
            Err(e) => {
                consumer.close();
                transport.close();
                ports.release(port);
                return Err(e);
            }
        };

        debug!(
            peer_id = %self.id,
            producer_id = %producer.id(),
            port,
            codec = %codec.codec_name,
            "Recording relay published"
        );

        Ok(RecordingRelay {
            descriptor: RelayDescriptor {
                kind,
                port,
                rtcp_port: None,
                codec,
                consumer_id: consumer.id(),
            },
            transport,
            consumer,
        })
    }

    /// Record this peer's current producers, one stream per kind.
    ///
    /// `on_done` fires exactly once: when the recorder exits, when setup
    /// fails, or when the peer is closed first.
    pub async fn start_recording(&self, router: &dyn MediaRouter, on_done: CompletionHandle) -> Result<()> {
        let registered = {
            let mut state = self.state.lock();
            if self.is_closed() {
                false
            } else if state.recording.completion.is_some() {
                drop(state);
                return Err(SfuError::AlreadyStarted);
            } else {
                state.recording.completion = Some(on_done.clone());
                true
            }
        };
        if !registered {
            on_done.fire(RecordingOutcome::Aborted);
            return Err(SfuError::Closed);
        }

        info!(peer_id = %self.id, name = %self.name, "Start record");
        match self.setup_recording(router, &on_done).await {
            Ok(consumers) => {
                let delay = self.recording_services.resume_delay;
                let peer_id = self.id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    for consumer in consumers {
                        if let Err(e) = consumer.resume().await {
                            debug!(peer_id = %peer_id, consumer_id = %consumer.id(), error = %e, "Relay resume failed");
                            continue;
                        }
                        if let Err(e) = consumer.request_key_frame().await {
                            debug!(peer_id = %peer_id, consumer_id = %consumer.id(), error = %e, "Key frame request failed");
                        }
                    }
                });
                Ok(())
            }
            Err(e) => {
                warn!(peer_id = %self.id, name = %self.name, error = %e, "Record fail");
                self.recorded.store(false, Ordering::Release);
                self.stop_recording();
                on_done.fire(RecordingOutcome::Failed { reason: e.to_string() });
                Err(e)
            }
        }
    }

    async fn setup_recording(
        &self,
        router: &dyn MediaRouter,
        on_done: &CompletionHandle,
    ) -> Result<Vec<Arc<dyn MediaConsumer>>> {
        // First producer of each kind
        let producers: Vec<Arc<dyn MediaProducer>> = {
            let state = self.state.lock();
            let mut by_kind: HashMap<MediaKind, Arc<dyn MediaProducer>> = HashMap::new();
            for entry in state.producers.values() {
                by_kind
                    .entry(entry.producer.kind())
                    .or_insert_with(|| Arc::clone(&entry.producer));
            }
            by_kind.into_values().collect()
        };

        if producers.is_empty() {
            return Err(SfuError::InvalidDescription(format!("{} has nothing to record", self.id)));
        }

        let mut description = RecordingDescription::new(self.id.as_str());

        let mut consumers = Vec::with_capacity(producers.len());
        for producer in producers {
            let relay = self.publish_recording_relay(router, producer.as_ref()).await?;
            description.insert(relay.descriptor.clone());
            consumers.push(Arc::clone(&relay.consumer));

            let mut state = self.state.lock();
            if self.is_closed() {
                drop(state);
                teardown_relays(vec![relay], &self.recording_services);
                return Err(SfuError::Closed);
            }
            state.recording.relays.push(relay);
        }

        let process = RecordingProcess::start(
            self.recording_services.launcher.as_ref(),
            &description,
            on_done.clone(),
            &self.recording_services.tasks,
        )?;

        let mut state = self.state.lock();
        if self.is_closed() {
            drop(state);
            process.stop();
            return Err(SfuError::Closed);
        }
        state.recording.process = Some(process);
        Ok(consumers)
    }

    /// Stop recording: relay consumers first, then the recorder, then the
    /// relay transports, then the ports.
    pub fn stop_recording(&self) {
        let (relays, process) = {
            let mut state = self.state.lock();
            let slot = &mut state.recording;
            (std::mem::take(&mut slot.relays), slot.process.take())
        };
        if relays.is_empty() && process.is_none() {
            return;
        }

        info!(peer_id = %self.id, name = %self.name, "Stop record");
        for relay in &relays {
            relay.consumer.close();
        }
        if let Some(process) = &process {
            process.stop();
        }
        teardown_relays(relays, &self.recording_services);
    }

    /// Tear the peer down. Idempotent; returns the producers that closed.
    pub fn close(&self) -> Vec<ProducerId> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        // A recording still running counts as torn down, not as finished
        let completion = self.state.lock().recording.completion.take();
        let aborted = completion.is_some_and(|completion| completion.fire(RecordingOutcome::Aborted));
        self.stop_recording();

        let transport_ids: Vec<TransportId> = self.state.lock().transports.keys().cloned().collect();
        let closed: Vec<ProducerId> = transport_ids
            .iter()
            .filter_map(|id| self.close_transport(id).ok())
            .flatten()
            .collect();

        info!(peer_id = %self.id, name = %self.name, aborted, "Peer closed");
        closed
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn drain_where<K, V>(map: &mut HashMap<K, V>, predicate: impl Fn(&V) -> bool) -> Vec<V>
where
    K: std::hash::Hash + Eq + Clone,
{
    let keys: Vec<K> = map.iter().filter(|(_, v)| predicate(v)).map(|(k, _)| k.clone()).collect();
    keys.iter().filter_map(|k| map.remove(k)).collect()
}

fn teardown_relays(relays: Vec<RecordingRelay>, services: &RecordingServices) {
    for relay in relays {
        relay.consumer.close();
        relay.transport.close();
        services.ports.release(relay.descriptor.port);
    }
}
