//! Renegotiation synchronizer
//!
//! One pass drives every session's outbound legs toward "every registered
//! stream except the ones the session publishes itself". An attempt walks the
//! sessions in registry order and aborts on the first failure; aborted
//! attempts restart from scratch until one completes or the retry budget is
//! spent. The caller holds the registry lock for the whole pass.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::SyncError;
use crate::registry::{Registry, TrackRegistry};
use crate::session::Session;
use crate::transport::Transport;
use crate::types::{ConnectionState, SessionId};

/// Summary of a converged pass
#[derive(Debug, Default)]
pub struct PassReport {
    /// Attempts used, including the successful one
    pub attempts: usize,
    pub offers_sent: usize,
    /// Sessions removed because they were closed
    pub pruned: Vec<SessionId>,
}

#[derive(Debug)]
pub enum SyncOutcome {
    Converged(PassReport),
    Exhausted {
        attempts: usize,
        pruned: Vec<SessionId>,
        last_error: SyncError,
    },
}

impl SyncOutcome {
    #[must_use]
    pub const fn is_converged(&self) -> bool {
        matches!(self, Self::Converged(_))
    }
}

/// Run attempts until one converges or `budget` attempts have failed
pub async fn run_pass<T: Transport>(registry: &mut Registry<T>, budget: usize) -> SyncOutcome {
    let mut pruned = Vec::new();
    let mut attempts = 0;

    loop {
        attempts += 1;
        match attempt(registry, &mut pruned).await {
            Ok(offers_sent) => {
                return SyncOutcome::Converged(PassReport {
                    attempts,
                    offers_sent,
                    pruned,
                });
            }
            Err(last_error) if attempts >= budget => {
                return SyncOutcome::Exhausted {
                    attempts,
                    pruned,
                    last_error,
                };
            }
            Err(e) => debug!(attempt = attempts, error = %e, "Synchronization attempt aborted"),
        }
    }
}

fn is_gone<T: Transport>(session: &Session<T>) -> bool {
    session.is_closed() || session.transport().connection_state() == ConnectionState::Closed
}

/// One walk over all sessions. Returns the number of offers sent.
async fn attempt<T: Transport>(
    registry: &mut Registry<T>,
    pruned: &mut Vec<SessionId>,
) -> Result<usize, SyncError> {
    let mut offers = 0;
    let mut index = 0;

    while let Some(session) = registry.sessions.get(index).map(Arc::clone) {
        if is_gone(&session) {
            registry.sessions.remove_at(index);
            info!(session_id = %session.id(), "Pruned closed session");
            pruned.push(session.id().clone());
            // The list shrank; rescan from the first session.
            index = 0;
            continue;
        }

        if reconcile(&registry.tracks, &session).await? {
            offers += 1;
        }
        index += 1;
    }

    Ok(offers)
}

/// Bring one session's outbound legs in line with the registry and offer the
/// result if the peer has not seen it yet. Returns whether an offer was sent.
///
/// A leg change marks the session before the offer is attempted, so a retry
/// after a failed offer still renegotiates even though the legs are in place.
async fn reconcile<T: Transport>(
    tracks: &TrackRegistry<T::Fanout>,
    session: &Session<T>,
) -> Result<bool, SyncError> {
    let transport = session.transport();
    let mut present = HashSet::new();

    for stream in transport.outbound_legs().await {
        if tracks.contains(&stream) && !stream.is_published_by(session.id()) {
            present.insert(stream);
            continue;
        }
        transport
            .remove_outbound_leg(&stream)
            .await
            .map_err(|source| SyncError::RemoveLeg {
                session: session.id().clone(),
                stream: stream.clone(),
                source,
            })?;
        session.mark_renegotiation_needed();
    }

    // Never send a session its own media.
    for leg in transport.inbound_legs().await {
        present.insert(leg.stream);
    }

    for (key, track) in tracks.iter() {
        if present.contains(key) || key.is_published_by(session.id()) {
            continue;
        }
        transport
            .add_outbound_leg(Arc::clone(track))
            .await
            .map_err(|source| SyncError::AddLeg {
                session: session.id().clone(),
                stream: key.clone(),
                source,
            })?;
        session.mark_renegotiation_needed();
        present.insert(key.clone());
    }

    if !session.renegotiation_needed() {
        return Ok(false);
    }

    let offer = transport
        .create_offer()
        .await
        .map_err(|source| SyncError::CreateOffer {
            session: session.id().clone(),
            source,
        })?;
    transport
        .set_local_description(offer.clone())
        .await
        .map_err(|source| SyncError::SetLocalDescription {
            session: session.id().clone(),
            source,
        })?;
    session
        .send_offer(&offer)
        .await
        .map_err(|source| SyncError::SendOffer {
            session: session.id().clone(),
            source,
        })?;

    Ok(true)
}
