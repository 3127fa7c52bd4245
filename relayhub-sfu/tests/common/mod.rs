//! In-memory transport and signaling doubles

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use relayhub_sfu::{
    CodecCapability, ConnectionState, FanoutTrack, FeedbackSource, Hub, IceCandidate,
    InboundLeg, InboundTrack, Packet, SessionDescription, SessionId, Session, SignalMessage,
    SignalSink, SignalSource, SignalingError, StreamKey, TrackKind, Transport, TransportError,
    TransportEvent, TransportEvents, TransportFactory,
};

pub struct FakeFanout {
    key: StreamKey,
    kind: TrackKind,
    written: Mutex<Vec<Packet>>,
}

impl FakeFanout {
    pub fn new(key: StreamKey, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            key,
            kind,
            written: Mutex::new(Vec::new()),
        })
    }

    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl FanoutTrack for FakeFanout {
    fn key(&self) -> &StreamKey {
        &self.key
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError> {
        self.written.lock().push(packet.clone());
        Ok(())
    }
}

pub struct FakeFeedback;

#[async_trait]
impl FeedbackSource for FakeFeedback {
    async fn drain(&mut self) -> Result<(), TransportError> {
        std::future::pending().await
    }
}

/// Inbound stream fed from a channel; ends when the sender is dropped
pub struct FakeInbound {
    key: StreamKey,
    kind: TrackKind,
    ssrc: u32,
    codec: CodecCapability,
    fanout: Arc<FakeFanout>,
    packets: mpsc::UnboundedReceiver<Packet>,
}

impl FakeInbound {
    pub fn new(key: StreamKey, kind: TrackKind, ssrc: u32) -> (Self, mpsc::UnboundedSender<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let codec = match kind {
            TrackKind::Audio => CodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48_000,
                channels: 2,
                sdp_fmtp_line: String::new(),
            },
            TrackKind::Video => CodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: String::new(),
            },
        };
        let inbound = Self {
            fanout: FakeFanout::new(key.clone(), kind),
            key,
            kind,
            ssrc,
            codec,
            packets: rx,
        };
        (inbound, tx)
    }

    pub fn fanout(&self) -> Arc<FakeFanout> {
        Arc::clone(&self.fanout)
    }
}

#[async_trait]
impl InboundTrack for FakeInbound {
    type Fanout = FakeFanout;
    type Feedback = FakeFeedback;

    fn key(&self) -> &StreamKey {
        &self.key
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn ssrc(&self) -> u32 {
        self.ssrc
    }

    fn codec(&self) -> &CodecCapability {
        &self.codec
    }

    fn create_fanout(&self) -> Result<Arc<FakeFanout>, TransportError> {
        Ok(Arc::clone(&self.fanout))
    }

    fn feedback(&self) -> FakeFeedback {
        FakeFeedback
    }

    async fn read_rtp(&mut self) -> Result<Packet, TransportError> {
        self.packets.recv().await.ok_or(TransportError::EndOfStream)
    }
}

pub struct FakeTransport {
    pub id: SessionId,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Vec<Arc<FakeFanout>>>,
    inbound: Mutex<Vec<InboundLeg>>,
    offers: AtomicUsize,
    add_calls: AtomicUsize,
    fail_next_adds: AtomicUsize,
    fail_adds: AtomicBool,
    close_calls: AtomicUsize,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    plis: Mutex<Vec<u32>>,
}

impl FakeTransport {
    pub fn new(id: impl Into<SessionId>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            state: Mutex::new(ConnectionState::New),
            outbound: Mutex::new(Vec::new()),
            inbound: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
            fail_next_adds: AtomicUsize::new(0),
            fail_adds: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            plis: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn add_inbound(&self, stream: StreamKey, ssrc: u32) {
        self.inbound.lock().push(InboundLeg { stream, ssrc });
    }

    pub fn outbound(&self) -> HashSet<StreamKey> {
        self.outbound.lock().iter().map(|t| t.key().clone()).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    pub fn fail_next_adds(&self, count: usize) {
        self.fail_next_adds.store(count, Ordering::SeqCst);
    }

    pub fn fail_adds(&self, fail: bool) {
        self.fail_adds.store(fail, Ordering::SeqCst);
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn offers_created(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn plis(&self) -> Vec<u32> {
        self.plis.lock().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Fanout = FakeFanout;
    type Inbound = FakeInbound;

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn outbound_legs(&self) -> Vec<StreamKey> {
        self.outbound.lock().iter().map(|t| t.key().clone()).collect()
    }

    async fn inbound_legs(&self) -> Vec<InboundLeg> {
        self.inbound.lock().clone()
    }

    async fn add_outbound_leg(&self, track: Arc<FakeFanout>) -> Result<(), TransportError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_adds.load(Ordering::SeqCst) {
            return Err(TransportError::Engine("add refused".to_string()));
        }
        let pending = self.fail_next_adds.load(Ordering::SeqCst);
        if pending > 0 {
            self.fail_next_adds.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Engine("add refused".to_string()));
        }
        self.outbound.lock().push(track);
        Ok(())
    }

    async fn remove_outbound_leg(&self, stream: &StreamKey) -> Result<(), TransportError> {
        self.outbound.lock().retain(|t| t.key() != stream);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("v=0 {} {n}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<(), TransportError> {
        if self.connection_state() == ConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        self.plis.lock().push(media_ssrc);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent<FakeInbound>>;

/// Hands out fake transports and keeps their event senders
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<(Arc<FakeTransport>, EventSender)>>,
    fail: AtomicBool,
}

impl FakeFactory {
    pub fn failing() -> Self {
        let factory = Self::default();
        factory.fail.store(true, Ordering::SeqCst);
        factory
    }

    pub fn created(&self) -> Vec<(Arc<FakeTransport>, EventSender)> {
        self.created.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    type Transport = FakeTransport;

    async fn create(
        &self,
        session: &SessionId,
    ) -> Result<(Arc<FakeTransport>, TransportEvents<FakeTransport>), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Engine("no engine".to_string()));
        }
        let transport = FakeTransport::new(session.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        self.created.lock().push((Arc::clone(&transport), tx));
        Ok((transport, rx))
    }
}

pub type MessageLog = Arc<Mutex<Vec<SignalMessage>>>;

pub struct RecordingSink {
    log: MessageLog,
    failures: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new() -> (Self, MessageLog) {
        Self::with_failures(Arc::default())
    }

    /// Sink whose next `failures` sends fail before anything is recorded
    pub fn with_failures(failures: Arc<AtomicUsize>) -> (Self, MessageLog) {
        let log: MessageLog = Arc::default();
        (
            Self {
                log: Arc::clone(&log),
                failures,
            },
            log,
        )
    }
}

#[async_trait]
impl SignalSink for RecordingSink {
    async fn send(&mut self, message: SignalMessage) -> Result<(), SignalingError> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SignalingError::Write("connection reset".to_string()));
        }
        self.log.lock().push(message);
        Ok(())
    }
}

pub struct FailingSink;

#[async_trait]
impl SignalSink for FailingSink {
    async fn send(&mut self, _message: SignalMessage) -> Result<(), SignalingError> {
        Err(SignalingError::Write("connection reset".to_string()))
    }
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Result<SignalMessage, SignalingError>>,
}

impl ChannelSource {
    pub fn new() -> (Self, mpsc::UnboundedSender<Result<SignalMessage, SignalingError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, tx)
    }
}

#[async_trait]
impl SignalSource for ChannelSource {
    async fn recv(&mut self) -> Option<Result<SignalMessage, SignalingError>> {
        self.rx.recv().await
    }
}

pub fn count_events(log: &MessageLog, event: &str) -> usize {
    log.lock().iter().filter(|m| m.event == event).count()
}

/// A registered session backed by a fake transport
pub struct Peer {
    pub session: Arc<Session<FakeTransport>>,
    pub transport: Arc<FakeTransport>,
    pub log: MessageLog,
    sink_failures: Arc<AtomicUsize>,
}

impl Peer {
    pub fn offers(&self) -> usize {
        count_events(&self.log, "offer")
    }

    /// Make the next `n` signaling writes to this peer fail
    pub fn fail_next_sends(&self, n: usize) {
        self.sink_failures.store(n, Ordering::SeqCst);
    }
}

pub async fn join(hub: &Hub<FakeTransport>, id: &str) -> Peer {
    let transport = FakeTransport::new(id);
    let sink_failures = Arc::new(AtomicUsize::new(0));
    let (sink, log) = RecordingSink::with_failures(Arc::clone(&sink_failures));
    let session = Arc::new(Session::new(
        SessionId::from(id),
        Arc::clone(&transport),
        Box::new(sink),
    ));
    hub.add_session(Arc::clone(&session)).await.unwrap();
    Peer {
        session,
        transport,
        log,
        sink_failures,
    }
}

/// Register a stream as published by `peer`
pub async fn publish(hub: &Hub<FakeTransport>, peer: &Peer, track: &str, ssrc: u32) -> StreamKey {
    let key = StreamKey::new(peer.session.id().clone(), track);
    peer.transport.add_inbound(key.clone(), ssrc);
    hub.publish(FakeFanout::new(key.clone(), TrackKind::Video))
        .await
        .unwrap();
    key
}

pub fn packet(sequence_number: u16, timestamp: u32) -> Packet {
    use bytes::Bytes;
    use webrtc::rtp::header::{Extension, Header};

    Packet {
        header: Header {
            version: 2,
            payload_type: 96,
            sequence_number,
            timestamp,
            ssrc: 1111,
            extension: true,
            extension_profile: 0xBEDE,
            extensions: vec![Extension {
                id: 3,
                payload: Bytes::from_static(&[0xAB, 0xCD]),
            }],
            ..Default::default()
        },
        payload: Bytes::from_static(&[0u8; 100]),
    }
}
