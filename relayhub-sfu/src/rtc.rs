//! Transport backed by the `webrtc` crate
//!
//! Every connection gets its own `MediaEngine` with Opus, H264 (baseline,
//! packetization-mode 1) and VP8, the default interceptors, and one recvonly
//! transceiver per media kind so the browser can publish right away.
//!
//! Fan-out tracks carry the origin session as stream id and the publisher's
//! track id as track id, which is how outbound senders map back to
//! [`StreamKey`]s.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry as InterceptorRegistry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtcp::payload_feedbacks::receiver_estimated_maximum_bitrate::ReceiverEstimatedMaximumBitrate;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::SfuConfig;
use crate::error::TransportError;
use crate::signal::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    FanoutTrack, FeedbackSource, InboundTrack, Transport, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::types::{CodecCapability, ConnectionState, InboundLeg, SessionId, StreamKey, TrackKind};

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        match e {
            webrtc::Error::ErrConnectionClosed => Self::Closed,
            other => Self::Engine(other.to_string()),
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(TransportError::Unsupported("rollback".to_string()));
        }
    };
    Ok(parsed?)
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(TransportError::Engine("unspecified description type".to_string()));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn video_feedback() -> Vec<RTCPFeedback> {
    [("goog-remb", ""), ("ccm", "fir"), ("nack", ""), ("nack", "pli")]
        .into_iter()
        .map(|(typ, parameter)| RTCPFeedback {
            typ: typ.to_string(),
            parameter: parameter.to_string(),
        })
        .collect()
}

/// Codecs offered to every participant
fn media_engine() -> Result<MediaEngine, TransportError> {
    let mut engine = MediaEngine::default();

    engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line:
                    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
                        .to_owned(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 102,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: video_feedback(),
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;

    Ok(engine)
}

/// Builds one peer connection per participant
pub struct RtcTransportFactory {
    ice_servers: Vec<String>,
}

impl RtcTransportFactory {
    #[must_use]
    pub fn new(config: &SfuConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    type Transport = RtcTransport;

    async fn create(
        &self,
        session: &SessionId,
    ) -> Result<(Arc<RtcTransport>, TransportEvents<RtcTransport>), TransportError> {
        let mut engine = media_engine()?;
        let registry = register_default_interceptors(InterceptorRegistry::new(), &mut engine)?;
        let api = APIBuilder::new()
            .with_media_engine(engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = Arc::new(Mutex::new(Vec::new()));

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = state_tx.send(TransportEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        let candidate_tx = tx.clone();
        let id = session.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(TransportEvent::LocalCandidate(init.into()));
                    }
                    Err(e) => warn!(session_id = %id, error = %e, "Failed to encode local candidate"),
                }
            }
            Box::pin(async {})
        }));

        let track_tx = tx;
        let id = session.clone();
        let legs = Arc::clone(&inbound);
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, receiver: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let inbound = RtcInbound::new(&id, track, receiver, Arc::clone(&legs));
                let _ = track_tx.send(TransportEvent::Track(inbound));
                Box::pin(async {})
            },
        ));

        debug!(session_id = %session, "Peer connection created");
        let transport = RtcTransport {
            id: session.clone(),
            pc,
            inbound,
            target_bitrate: Arc::new(AtomicU64::new(0)),
        };
        Ok((Arc::new(transport), rx))
    }
}

pub struct RtcTransport {
    id: SessionId,
    pc: Arc<RTCPeerConnection>,
    inbound: Arc<Mutex<Vec<InboundLeg>>>,
    /// Latest REMB from the subscriber in bits/s, 0 until one arrives
    target_bitrate: Arc<AtomicU64>,
}

/// Bitrate of the last REMB in a feedback batch
fn remb_bitrate(packets: &[Box<dyn RtcpPacket + Send + Sync>]) -> Option<u64> {
    packets
        .iter()
        .rev()
        .find_map(|p| p.as_any().downcast_ref::<ReceiverEstimatedMaximumBitrate>())
        .map(|remb| remb.bitrate.max(0.0) as u64)
}

#[async_trait]
impl Transport for RtcTransport {
    type Fanout = RtcFanout;
    type Inbound = RtcInbound;

    fn connection_state(&self) -> ConnectionState {
        self.pc.connection_state().into()
    }

    async fn outbound_legs(&self) -> Vec<StreamKey> {
        let mut legs = Vec::new();
        for sender in self.pc.get_senders().await {
            if let Some(track) = sender.track().await {
                legs.push(StreamKey::new(track.stream_id(), track.id()));
            }
        }
        legs
    }

    async fn inbound_legs(&self) -> Vec<InboundLeg> {
        self.inbound.lock().clone()
    }

    async fn add_outbound_leg(&self, track: Arc<RtcFanout>) -> Result<(), TransportError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::clone(&track.track) as _;
        let sender = self.pc.add_track(local).await?;

        // Interceptors only see feedback that is read.
        let target = Arc::clone(&self.target_bitrate);
        tokio::spawn(async move {
            while let Ok((packets, _)) = sender.read_rtcp().await {
                if let Some(bitrate) = remb_bitrate(&packets) {
                    target.store(bitrate, Ordering::Relaxed);
                }
            }
        });
        Ok(())
    }

    async fn remove_outbound_leg(&self, stream: &StreamKey) -> Result<(), TransportError> {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.stream_id() == stream.session.as_str() && track.id() == stream.track.as_str() {
                self.pc.remove_track(&sender).await?;
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc_description(self.pc.create_offer(None).await?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc.set_remote_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    fn target_bitrate(&self) -> Option<u64> {
        match self.target_bitrate.load(Ordering::Relaxed) {
            0 => None,
            bitrate => Some(bitrate),
        }
    }

    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<(), TransportError> {
        self.pc
            .write_rtcp(&[Box::new(PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            })])
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        trace!(session_id = %self.id, "Closing peer connection");
        self.pc.close().await?;
        Ok(())
    }
}

pub struct RtcFanout {
    key: StreamKey,
    kind: TrackKind,
    track: Arc<TrackLocalStaticRTP>,
}

impl RtcFanout {
    /// Local track whose stream id is the publishing session and whose id is
    /// the track, so `outbound_legs` maps senders back to stream keys
    fn new(key: StreamKey, kind: TrackKind, capability: RTCRtpCodecCapability) -> Self {
        let track = TrackLocalStaticRTP::new(
            capability,
            key.track.to_string(),
            key.session.to_string(),
        );
        Self {
            key,
            kind,
            track: Arc::new(track),
        }
    }
}

#[async_trait]
impl FanoutTrack for RtcFanout {
    fn key(&self) -> &StreamKey {
        &self.key
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError> {
        match self.track.write_rtp(packet).await {
            // A subscriber went away mid-write.
            Ok(_) | Err(webrtc::Error::ErrClosedPipe) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A remote track plus its receiver. Dropping it retires the inbound leg.
pub struct RtcInbound {
    key: StreamKey,
    kind: TrackKind,
    ssrc: u32,
    codec: CodecCapability,
    capability: RTCRtpCodecCapability,
    track: Arc<TrackRemote>,
    receiver: Arc<RTCRtpReceiver>,
    legs: Arc<Mutex<Vec<InboundLeg>>>,
}

impl RtcInbound {
    fn new(
        session: &SessionId,
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
        legs: Arc<Mutex<Vec<InboundLeg>>>,
    ) -> Self {
        let key = StreamKey::new(session.clone(), track.id());
        let ssrc = track.ssrc();
        let capability = track.codec().capability;
        legs.lock().push(InboundLeg {
            stream: key.clone(),
            ssrc,
        });

        Self {
            key,
            kind: track.kind().into(),
            ssrc,
            codec: CodecCapability {
                mime_type: capability.mime_type.clone(),
                clock_rate: capability.clock_rate,
                channels: capability.channels,
                sdp_fmtp_line: capability.sdp_fmtp_line.clone(),
            },
            capability,
            track,
            receiver,
            legs,
        }
    }
}

impl Drop for RtcInbound {
    fn drop(&mut self) {
        self.legs.lock().retain(|leg| leg.stream != self.key);
    }
}

#[async_trait]
impl InboundTrack for RtcInbound {
    type Fanout = RtcFanout;
    type Feedback = RtcFeedback;

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

    fn create_fanout(&self) -> Result<Arc<RtcFanout>, TransportError> {
        Ok(Arc::new(RtcFanout::new(
            self.key.clone(),
            self.kind,
            self.capability.clone(),
        )))
    }

    fn feedback(&self) -> RtcFeedback {
        RtcFeedback {
            receiver: Arc::clone(&self.receiver),
        }
    }

    async fn read_rtp(&mut self) -> Result<Packet, TransportError> {
        match self.track.read_rtp().await {
            Ok((packet, _)) => Ok(packet),
            Err(webrtc::Error::ErrClosedPipe) => Err(TransportError::EndOfStream),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct RtcFeedback {
    receiver: Arc<RTCRtpReceiver>,
}

#[async_trait]
impl FeedbackSource for RtcFeedback {
    async fn drain(&mut self) -> Result<(), TransportError> {
        self.receiver.read_rtcp().await?;
        Ok(())
    }
}
