//! Hub - top-level orchestration
//!
//! The hub owns the session and track registries behind one lock and runs two
//! background tasks:
//! - the sync worker, which runs synchronization passes on request and
//!   re-runs a pass after the cooldown when the previous one gave up
//! - the keyframe ticker
//!
//! Sessions enter through [`Hub::connect`], which runs the session driver for
//! the lifetime of the connection.

use parking_lot::Mutex as SyncMutex;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::config::SfuConfig;
use crate::error::Result;
use crate::keyframe;
use crate::registry::Registry;
use crate::session::{self, Session, SessionExit};
use crate::signal::{SignalSink, SignalSource};
use crate::stats::{CsvStatsSink, StatsSink};
use crate::sync::{run_pass, SyncOutcome};
use crate::transport::{FanoutTrack, Transport, TransportFactory};
use crate::types::{SessionId, StreamKey};

pub struct Hub<T: Transport> {
    config: Arc<SfuConfig>,

    /// The global lock
    registry: Mutex<Registry<T>>,

    /// Pending pass request (coalesced)
    sync_requested: Notify,

    /// Wakes the worker when `retry_at` changes
    reschedule: Notify,

    /// Deadline of the deferred pass, if one is scheduled
    retry_at: SyncMutex<Option<Instant>>,

    shutdown: CancellationToken,
}

impl<T: Transport> Hub<T> {
    #[must_use]
    pub fn new(config: SfuConfig) -> Arc<Self> {
        info!(
            sync_retry_budget = config.sync_retry_budget,
            sync_cooldown_ms = config.sync_cooldown_ms,
            keyframe_interval_ms = config.keyframe_interval_ms,
            "Hub initialized"
        );

        Arc::new(Self {
            config: Arc::new(config),
            registry: Mutex::new(Registry::new()),
            sync_requested: Notify::new(),
            reschedule: Notify::new(),
            retry_at: SyncMutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the sync worker and the keyframe ticker
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let worker = Arc::clone(self);
        let ticker = Arc::clone(self);
        vec![
            tokio::spawn(async move { worker.sync_worker().await }),
            tokio::spawn(async move { ticker.keyframe_ticker().await }),
        ]
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Stop background tasks and session drivers
    pub fn shutdown(&self) {
        info!("Hub shutting down");
        self.shutdown.cancel();
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    /// Register a session and schedule a pass
    pub async fn add_session(&self, session: Arc<Session<T>>) -> Result<()> {
        let count = {
            let mut registry = self.registry.lock().await;
            registry.sessions.insert(session.clone())?;
            registry.sessions.len()
        };
        info!(session_id = %session.id(), sessions = count, "Session joined");
        self.request_sync();
        Ok(())
    }

    #[must_use]
    pub async fn session_count(&self) -> usize {
        self.registry.lock().await.sessions.len()
    }

    #[must_use]
    pub async fn session_ids(&self) -> Vec<SessionId> {
        self.registry.lock().await.sessions.ids()
    }

    /// Add a published stream and schedule a pass
    pub async fn publish(&self, track: Arc<T::Fanout>) -> Result<Arc<T::Fanout>> {
        let track = self.registry.lock().await.tracks.publish(track)?;
        info!(stream = %track.key(), kind = %track.kind(), "Stream published");
        self.request_sync();
        Ok(track)
    }

    /// Remove a published stream; schedules a pass when it was present
    pub async fn unpublish(&self, key: &StreamKey) -> Option<Arc<T::Fanout>> {
        let removed = self.registry.lock().await.tracks.unpublish(key);
        if removed.is_some() {
            info!(stream = %key, "Stream unpublished");
            self.request_sync();
        }
        removed
    }

    #[must_use]
    pub async fn snapshot(&self) -> Vec<StreamKey> {
        self.registry.lock().await.tracks.snapshot()
    }

    /// Ask the sync worker for a pass. Requests made while one is queued
    /// collapse into it.
    pub fn request_sync(&self) {
        self.sync_requested.notify_one();
    }

    /// Run one synchronization pass now
    pub async fn synchronize(&self) -> SyncOutcome {
        // Any pass supersedes a deferred one.
        self.retry_at.lock().take();

        let outcome = {
            let mut registry = self.registry.lock().await;
            run_pass(&mut registry, self.config.sync_retry_budget).await
        };

        match &outcome {
            SyncOutcome::Converged(report) => {
                debug!(
                    attempts = report.attempts,
                    offers_sent = report.offers_sent,
                    pruned = report.pruned.len(),
                    "Synchronization converged"
                );
                self.dispatch_keyframes().await;
            }
            SyncOutcome::Exhausted {
                attempts,
                last_error,
                ..
            } => {
                warn!(
                    attempts,
                    error = %last_error,
                    cooldown_ms = self.config.sync_cooldown_ms,
                    "Synchronization gave up, deferring"
                );
                *self.retry_at.lock() = Some(Instant::now() + self.config.sync_cooldown());
                self.reschedule.notify_one();
            }
        }

        outcome
    }

    /// Request a keyframe from every publisher
    pub async fn dispatch_keyframes(&self) -> usize {
        let registry = self.registry.lock().await;
        keyframe::dispatch(&registry.sessions).await
    }

    /// Whether a deferred pass is scheduled
    #[must_use]
    pub fn deferred_pass_scheduled(&self) -> bool {
        self.retry_at.lock().is_some()
    }

    async fn sync_worker(self: Arc<Self>) {
        info!("Starting sync worker");
        loop {
            let deadline = *self.retry_at.lock();
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = self.sync_requested.notified() => {}
                () = self.reschedule.notified() => continue,
                () = wait_until(deadline) => {
                    let due = self.retry_at.lock().is_some_and(|at| at <= Instant::now());
                    if !due {
                        continue;
                    }
                    debug!("Running deferred synchronization pass");
                }
            }
            self.synchronize().await;
        }
        debug!("Sync worker stopped");
    }

    async fn keyframe_ticker(self: Arc<Self>) {
        let period = self.config.keyframe_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.config.keyframe_interval_ms, "Starting keyframe ticker");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.dispatch_keyframes().await;
                }
            }
        }
        debug!("Keyframe ticker stopped");
    }

    /// Serve one participant for the lifetime of its connection.
    ///
    /// Creates the transport, registers the session, runs its driver and
    /// tears it down afterwards. A transport that cannot be created fails the
    /// connection before anything is registered.
    pub async fn connect<F, S>(
        self: &Arc<Self>,
        factory: &F,
        source: &mut S,
        sink: Box<dyn SignalSink>,
    ) -> Result<SessionExit>
    where
        F: TransportFactory<Transport = T>,
        S: SignalSource + ?Sized,
    {
        self.connect_as(SessionId::generate(), factory, source, sink)
            .await
    }

    /// [`Hub::connect`] under a caller-chosen session id. An id already in
    /// use fails with `DuplicateSession` and the new transport is closed.
    pub async fn connect_as<F, S>(
        self: &Arc<Self>,
        id: SessionId,
        factory: &F,
        source: &mut S,
        sink: Box<dyn SignalSink>,
    ) -> Result<SessionExit>
    where
        F: TransportFactory<Transport = T>,
        S: SignalSource + ?Sized,
    {
        let (transport, events) = factory.create(&id).await?;
        let session = Arc::new(Session::new(id, transport, sink));
        if let Err(e) = self.add_session(Arc::clone(&session)).await {
            session.close().await;
            return Err(e);
        }

        let reporter = self.spawn_stats_reporter(&session);
        let exit = session::drive(self, &session, events, source).await;

        if let Some(reporter) = reporter {
            reporter.abort();
        }
        session.close().await;
        self.request_sync();

        info!(session_id = %session.id(), exit = ?exit, "Session left");
        Ok(exit)
    }

    fn spawn_stats_reporter(&self, session: &Arc<Session<T>>) -> Option<JoinHandle<()>> {
        let dir = self.config.stats_dir.as_ref()?;
        let path = dir.join(format!("{}.csv", session.id()));
        let sink: Arc<dyn StatsSink> = match CsvStatsSink::create(&path) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to create statistics file");
                return None;
            }
        };
        debug!(session_id = %session.id(), path = %path.display(), "Writing statistics");

        let period = self.config.stats_interval();
        Some(tokio::spawn(session::report_stats(
            Arc::clone(session),
            sink,
            period,
        )))
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
