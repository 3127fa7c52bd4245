//! Transport engine capability
//!
//! The hub never talks to ICE/DTLS/SRTP directly. Everything it needs from the
//! negotiation engine is expressed by the traits in this module; [`crate::rtc`]
//! implements them on top of the `webrtc` crate.
//!
//! Engine callbacks (connection state, new local candidates, new inbound
//! tracks) are delivered as [`TransportEvent`]s on a channel handed out by
//! [`TransportFactory::create`], so the session can process them in its own
//! dispatch loop.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
pub use webrtc::rtp::packet::Packet;

use crate::error::TransportError;
use crate::signal::{IceCandidate, SessionDescription};
use crate::types::{CodecCapability, ConnectionState, InboundLeg, SessionId, StreamKey, TrackKind};

/// The shared send-side of a published stream. Writing a packet replicates it
/// to every session holding an outbound leg for the stream.
#[async_trait]
pub trait FanoutTrack: Send + Sync + 'static {
    fn key(&self) -> &StreamKey;

    fn kind(&self) -> TrackKind;

    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError>;
}

/// Feedback (RTCP) path of one inbound leg. It must be read continuously so
/// the engine's interceptors keep working.
#[async_trait]
pub trait FeedbackSource: Send + 'static {
    /// Read and discard one batch of feedback packets
    async fn drain(&mut self) -> Result<(), TransportError>;
}

/// A stream arriving from a publishing session
#[async_trait]
pub trait InboundTrack: Send + 'static {
    type Fanout: FanoutTrack;
    type Feedback: FeedbackSource;

    fn key(&self) -> &StreamKey;

    fn kind(&self) -> TrackKind;

    fn ssrc(&self) -> u32;

    fn codec(&self) -> &CodecCapability;

    /// Build the fan-out track other sessions will subscribe to
    fn create_fanout(&self) -> Result<Arc<Self::Fanout>, TransportError>;

    fn feedback(&self) -> Self::Feedback;

    async fn read_rtp(&mut self) -> Result<Packet, TransportError>;
}

/// Engine callback, delivered in order on the session's event channel
pub enum TransportEvent<I> {
    StateChanged(ConnectionState),
    LocalCandidate(IceCandidate),
    Track(I),
}

impl<I> std::fmt::Debug for TransportEvent<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::Track(_) => f.write_str("Track(..)"),
        }
    }
}

pub type TransportEvents<T> = mpsc::UnboundedReceiver<TransportEvent<<T as Transport>::Inbound>>;

/// One participant's negotiated connection
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Fanout: FanoutTrack;
    type Inbound: InboundTrack<Fanout = Self::Fanout>;

    fn connection_state(&self) -> ConnectionState;

    /// Streams this connection currently sends to the remote peer
    async fn outbound_legs(&self) -> Vec<StreamKey>;

    /// Streams this connection currently receives from the remote peer
    async fn inbound_legs(&self) -> Vec<InboundLeg>;

    async fn add_outbound_leg(&self, track: Arc<Self::Fanout>) -> Result<(), TransportError>;

    async fn remove_outbound_leg(&self, stream: &StreamKey) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Ask the remote publisher of `media_ssrc` for a keyframe
    async fn send_picture_loss_indication(&self, media_ssrc: u32) -> Result<(), TransportError>;

    /// Current congestion-control target send rate in bits/s, if the engine
    /// runs an estimator
    fn target_bitrate(&self) -> Option<u64> {
        None
    }

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates a transport per accepted connection
#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: Transport;

    async fn create(
        &self,
        session: &SessionId,
    ) -> Result<(Arc<Self::Transport>, TransportEvents<Self::Transport>), TransportError>;
}
