use thiserror::Error;

use crate::types::{SessionId, StreamKey};

/// Failure reported by the transport engine
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("End of stream")]
    EndOfStream,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Transport engine error: {0}")]
    Engine(String),
}

/// Failure on a session's signaling channel
#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Signaling channel closed")]
    Closed,

    #[error("Malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Signaling write failed: {0}")]
    Write(String),

    #[error("Signaling read failed: {0}")]
    Read(String),
}

/// Why one synchronization attempt was abandoned
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Failed to remove leg {stream} from session {session}: {source}")]
    RemoveLeg {
        session: SessionId,
        stream: StreamKey,
        #[source]
        source: TransportError,
    },

    #[error("Failed to add leg {stream} to session {session}: {source}")]
    AddLeg {
        session: SessionId,
        stream: StreamKey,
        #[source]
        source: TransportError,
    },

    #[error("Failed to create offer for session {session}: {source}")]
    CreateOffer {
        session: SessionId,
        #[source]
        source: TransportError,
    },

    #[error("Failed to set local description for session {session}: {source}")]
    SetLocalDescription {
        session: SessionId,
        #[source]
        source: TransportError,
    },

    #[error("Failed to deliver offer to session {session}: {source}")]
    SendOffer {
        session: SessionId,
        #[source]
        source: SignalingError,
    },
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Stream already published: {0}")]
    DuplicateStream(StreamKey),

    #[error("Session already registered: {0}")]
    DuplicateSession(SessionId),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = SfuError> = std::result::Result<T, E>;
