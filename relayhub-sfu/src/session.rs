//! Session lifecycle
//!
//! A [`Session`] is one connected participant. Its driver ([`drive`]) is a
//! single dispatch loop over the transport's event channel and the inbound
//! signaling stream; it ends when the peer goes away, the transport closes,
//! or a signaling message cannot be applied.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, SignalingError};
use crate::hub::Hub;
use crate::relay;
use crate::signal::{IceCandidate, SessionDescription, SignalEvent, SignalMessage, SignalSink, SignalSource, SignalWriter};
use crate::stats::{RecordBuilder, StatsSink, StreamMonitor};
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::types::{ConnectionState, SessionId, SessionState, StreamKey};

pub struct Session<T: Transport> {
    id: SessionId,
    transport: Arc<T>,
    signal: SignalWriter,
    state: RwLock<SessionState>,
    /// Set while the peer holds a description older than the current legs
    renegotiation_needed: AtomicBool,
    monitors: DashMap<StreamKey, Arc<StreamMonitor>>,
}

impl<T: Transport> Session<T> {
    pub fn new(id: SessionId, transport: Arc<T>, sink: Box<dyn SignalSink>) -> Self {
        Self {
            id,
            transport,
            signal: SignalWriter::new(sink),
            state: RwLock::new(SessionState::Negotiating),
            renegotiation_needed: AtomicBool::new(true),
            monitors: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub const fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Closed is terminal; later transitions are ignored
    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        if *state != SessionState::Closed {
            *state = next;
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// True until an offer covering the current legs reaches the peer.
    /// Starts set so a new session always gets a first offer.
    #[must_use]
    pub fn renegotiation_needed(&self) -> bool {
        self.renegotiation_needed.load(Ordering::Acquire)
    }

    /// Record that the legs changed since the last delivered offer
    pub(crate) fn mark_renegotiation_needed(&self) {
        self.renegotiation_needed.store(true, Ordering::Release);
    }

    /// Deliver an offer the transport already applied locally
    pub async fn send_offer(&self, offer: &SessionDescription) -> Result<(), SignalingError> {
        let message = SignalMessage::offer(offer)
            .map_err(|source| SignalingError::Encode { what: "offer", source })?;
        self.signal.send(message).await?;

        self.renegotiation_needed.store(false, Ordering::Release);
        self.set_state(SessionState::Negotiating);
        debug!(session_id = %self.id, "Offer sent");
        Ok(())
    }

    pub async fn send_candidate(&self, candidate: &IceCandidate) -> Result<(), SignalingError> {
        let message = SignalMessage::candidate(candidate)
            .map_err(|source| SignalingError::Encode { what: "candidate", source })?;
        self.signal.send(message).await
    }

    /// Apply one inbound signaling message
    pub async fn handle_signal(&self, message: &SignalMessage) -> Result<()> {
        match message.parse()? {
            SignalEvent::Candidate(candidate) => {
                trace!(session_id = %self.id, candidate = %candidate.candidate, "Remote candidate");
                self.transport.add_ice_candidate(candidate).await?;
            }
            SignalEvent::Answer(answer) => {
                self.transport.set_remote_description(answer).await?;
                self.set_state(SessionState::Stable);
                debug!(session_id = %self.id, "Answer applied");
            }
            SignalEvent::Unknown(event) => {
                warn!(session_id = %self.id, event = %event, "Ignoring unknown signaling event");
            }
        }
        Ok(())
    }

    pub(crate) fn attach_monitor(&self, monitor: Arc<StreamMonitor>) {
        self.monitors.insert(monitor.key().clone(), monitor);
    }

    pub(crate) fn detach_monitor(&self, key: &StreamKey) {
        self.monitors.remove(key);
    }

    #[must_use]
    pub fn monitor(&self, key: &StreamKey) -> Option<Arc<StreamMonitor>> {
        self.monitors.get(key).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn monitors(&self) -> Vec<Arc<StreamMonitor>> {
        self.monitors.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Mark the session Closed and shut its transport down
    pub async fn close(&self) {
        *self.state.write() = SessionState::Closed;
        if let Err(e) = self.transport.close().await {
            warn!(session_id = %self.id, error = %e, "Failed to close transport");
        }
    }
}

/// Why a session driver returned
#[derive(Debug)]
pub enum SessionExit {
    /// The signaling channel ended
    PeerLeft,
    /// The transport reported Closed or dropped its event channel
    TransportClosed,
    /// The hub is shutting down
    Shutdown,
    /// A signaling message could not be read or applied
    Failed(crate::error::SfuError),
}

/// Run the session's dispatch loop until it ends
pub async fn drive<T, S>(
    hub: &Arc<Hub<T>>,
    session: &Arc<Session<T>>,
    mut events: TransportEvents<T>,
    source: &mut S,
) -> SessionExit
where
    T: Transport,
    S: SignalSource + ?Sized,
{
    loop {
        tokio::select! {
            () = hub.cancelled() => break SessionExit::Shutdown,

            event = events.recv() => match event {
                Some(TransportEvent::StateChanged(state)) => {
                    info!(session_id = %session.id(), state = %state, "Connection state changed");
                    match state {
                        ConnectionState::Failed => {
                            if let Err(e) = session.transport().close().await {
                                warn!(session_id = %session.id(), error = %e, "Failed to close transport");
                            }
                        }
                        ConnectionState::Closed => break SessionExit::TransportClosed,
                        _ => {}
                    }
                }
                Some(TransportEvent::LocalCandidate(candidate)) => {
                    if let Err(e) = session.send_candidate(&candidate).await {
                        warn!(session_id = %session.id(), error = %e, "Failed to send candidate");
                    }
                }
                Some(TransportEvent::Track(inbound)) => {
                    let hub = Arc::clone(hub);
                    let session = Arc::clone(session);
                    tokio::spawn(async move {
                        if let Err(e) = relay::run_relay(hub, Arc::clone(&session), inbound).await {
                            warn!(session_id = %session.id(), error = %e, "Relay loop failed to start");
                        }
                    });
                }
                None => break SessionExit::TransportClosed,
            },

            message = source.recv() => match message {
                None => break SessionExit::PeerLeft,
                Some(Err(e)) => break SessionExit::Failed(e.into()),
                Some(Ok(message)) => {
                    if let Err(e) = session.handle_signal(&message).await {
                        warn!(session_id = %session.id(), event = %message.event, error = %e, "Failed to apply signaling message");
                        break SessionExit::Failed(e);
                    }
                }
            },
        }
    }
}

/// Periodically write one statistics record per inbound stream of `session`
pub async fn report_stats<T: Transport>(
    session: Arc<Session<T>>,
    sink: Arc<dyn StatsSink>,
    period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut builders: HashMap<StreamKey, RecordBuilder> = HashMap::new();

    loop {
        ticker.tick().await;
        if session.is_closed() {
            break;
        }

        let monitors = session.monitors();
        builders.retain(|key, _| monitors.iter().any(|m| m.key() == key));

        let target = session.transport().target_bitrate();
        let now = chrono::Utc::now();
        for monitor in monitors {
            let record = builders
                .entry(monitor.key().clone())
                .or_default()
                .next(monitor.kind(), monitor.snapshot(), target, now);
            if let Err(e) = sink.write(&record) {
                warn!(session_id = %session.id(), error = %e, "Failed to write statistics record");
                return;
            }
        }
    }
}
