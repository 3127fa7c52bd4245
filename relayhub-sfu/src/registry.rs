//! Session and track registries
//!
//! Both registries are plain data structures. The hub keeps them together in
//! one [`Registry`] behind a single lock; every read or write happens while
//! holding it.

use indexmap::IndexMap;
use std::sync::Arc;

use crate::error::{Result, SfuError};
use crate::session::Session;
use crate::transport::{FanoutTrack, Transport};
use crate::types::{SessionId, StreamKey};

/// The authoritative set of published streams, in publication order
pub struct TrackRegistry<F> {
    tracks: IndexMap<StreamKey, Arc<F>>,
}

impl<F: FanoutTrack> TrackRegistry<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracks: IndexMap::new(),
        }
    }

    /// Register a fan-out track under its stream key
    pub fn publish(&mut self, track: Arc<F>) -> Result<Arc<F>> {
        let key = track.key().clone();
        if self.tracks.contains_key(&key) {
            return Err(SfuError::DuplicateStream(key));
        }
        self.tracks.insert(key, Arc::clone(&track));
        Ok(track)
    }

    /// Remove a stream; absent keys are ignored
    pub fn unpublish(&mut self, key: &StreamKey) -> Option<Arc<F>> {
        self.tracks.shift_remove(key)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<StreamKey> {
        self.tracks.keys().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.tracks.contains_key(key)
    }

    #[must_use]
    pub fn get(&self, key: &StreamKey) -> Option<&Arc<F>> {
        self.tracks.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StreamKey, &Arc<F>)> {
        self.tracks.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl<F: FanoutTrack> Default for TrackRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Connected sessions in join order
pub struct SessionRegistry<T: Transport> {
    sessions: Vec<Arc<Session<T>>>,
}

impl<T: Transport> SessionRegistry<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            sessions: Vec::new(),
        }
    }

    pub fn insert(&mut self, session: Arc<Session<T>>) -> Result<()> {
        if self.position(session.id()).is_some() {
            return Err(SfuError::DuplicateSession(session.id().clone()));
        }
        self.sessions.push(session);
        Ok(())
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<Arc<Session<T>>> {
        self.position(id).map(|index| self.sessions.remove(index))
    }

    pub(crate) fn remove_at(&mut self, index: usize) -> Arc<Session<T>> {
        self.sessions.remove(index)
    }

    #[must_use]
    pub fn position(&self, id: &SessionId) -> Option<usize> {
        self.sessions.iter().position(|s| s.id() == id)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arc<Session<T>>> {
        self.sessions.get(index)
    }

    #[must_use]
    pub fn find(&self, id: &SessionId) -> Option<&Arc<Session<T>>> {
        self.sessions.iter().find(|s| s.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Session<T>>> {
        self.sessions.iter()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        self.sessions.iter().map(|s| s.id().clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl<T: Transport> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything guarded by the hub's global lock
pub struct Registry<T: Transport> {
    pub sessions: SessionRegistry<T>,
    pub tracks: TrackRegistry<T::Fanout>,
}

impl<T: Transport> Registry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: SessionRegistry::new(),
            tracks: TrackRegistry::new(),
        }
    }
}

impl<T: Transport> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
