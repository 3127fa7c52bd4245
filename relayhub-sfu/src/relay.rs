//! Media relay loop
//!
//! One task per inbound stream: publish a fan-out track, then copy packets
//! from the publisher to it until either side fails.

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};
use webrtc::rtp::packet::Packet;
use webrtc::util::marshal::MarshalSize;

use crate::error::Result;
use crate::hub::Hub;
use crate::session::Session;
use crate::stats::StreamMonitor;
use crate::transport::{FanoutTrack, FeedbackSource, InboundTrack, Transport};

/// Drop header extensions negotiated with the publisher; subscribers
/// negotiated their own.
pub fn strip_extensions(packet: &mut Packet) {
    packet.header.extension = false;
    packet.header.extension_profile = 0;
    packet.header.extensions.clear();
}

/// Relay `inbound` until it ends. Returns the number of packets forwarded.
pub async fn run_relay<T: Transport>(
    hub: Arc<Hub<T>>,
    session: Arc<Session<T>>,
    mut inbound: T::Inbound,
) -> Result<u64> {
    let key = inbound.key().clone();
    let codec = inbound.codec().clone();
    info!(
        session_id = %session.id(),
        stream = %key,
        kind = %inbound.kind(),
        ssrc = inbound.ssrc(),
        codec = %codec.mime_type,
        "Got remote track"
    );

    let fanout = hub.publish(inbound.create_fanout()?).await?;

    let mut feedback = inbound.feedback();
    let drain = tokio::spawn(async move { while feedback.drain().await.is_ok() {} });

    let monitor = Arc::new(StreamMonitor::new(
        key.clone(),
        inbound.kind(),
        codec.clock_rate,
        hub.config().bitrate_window(),
    ));
    session.attach_monitor(Arc::clone(&monitor));

    let mut relayed = 0u64;
    let reason = loop {
        let mut packet = match inbound.read_rtp().await {
            Ok(packet) => packet,
            Err(e) => break e,
        };

        let size = packet.header.marshal_size() + packet.payload.len();
        monitor.observe(
            packet.header.sequence_number,
            packet.header.timestamp,
            size,
            Instant::now(),
        );

        strip_extensions(&mut packet);
        if let Err(e) = fanout.write_rtp(&packet).await {
            break e;
        }
        relayed += 1;
    };

    drain.abort();
    session.detach_monitor(&key);
    hub.unpublish(fanout.key()).await;

    debug!(
        stream = %key,
        packets = relayed,
        bitrate = monitor.estimator().bitrate(),
        reason = %reason,
        "Relay loop ended"
    );
    Ok(relayed)
}
