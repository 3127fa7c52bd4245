//! Keyframe dispatcher
//!
//! Asks every publisher for a fresh keyframe so subscribers that joined
//! mid-stream (or just gained a leg) can start decoding.

use tracing::trace;

use crate::registry::SessionRegistry;
use crate::transport::Transport;

/// Send a picture loss indication for every inbound leg of every session.
/// Returns how many were delivered; failures are skipped.
pub async fn dispatch<T: Transport>(sessions: &SessionRegistry<T>) -> usize {
    let mut sent = 0;
    for session in sessions.iter() {
        let transport = session.transport();
        for leg in transport.inbound_legs().await {
            match transport.send_picture_loss_indication(leg.ssrc).await {
                Ok(()) => sent += 1,
                Err(e) => trace!(
                    session_id = %session.id(),
                    stream = %leg.stream,
                    ssrc = leg.ssrc,
                    error = %e,
                    "Keyframe request failed"
                ),
            }
        }
    }
    sent
}
