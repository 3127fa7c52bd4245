//! RelayHub SFU (Selective Forwarding Unit)
//!
//! Every participant connects over a signaling channel, publishes its audio
//! and video, and receives every stream published by everyone else. Packets
//! are forwarded as-is; nothing is transcoded.
//!
//! ## Architecture
//!
//! - **`Hub`**: owns the session and track registries behind one lock and
//!   runs the synchronization worker and the keyframe ticker
//! - **`Session`**: one participant; its driver dispatches transport events
//!   and inbound signaling
//! - **Synchronizer** (`sync`): brings every session's outbound legs in line
//!   with the published streams and renegotiates when they change
//! - **Relay loop** (`relay`): copies one inbound stream into its fan-out
//!   track and feeds the stream's statistics
//! - **`Transport`**: capability trait over the negotiation engine;
//!   [`rtc`] implements it with the `webrtc` crate
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relayhub_sfu::{Hub, RtcTransportFactory, SfuConfig};
//!
//! let config = SfuConfig::default();
//! let factory = RtcTransportFactory::new(&config);
//! let hub = Hub::new(config);
//! hub.start();
//!
//! // per accepted websocket
//! let exit = hub.connect(&factory, &mut source, Box::new(sink)).await?;
//! ```

mod config;
mod error;
mod estimator;
mod hub;
mod keyframe;
mod registry;
mod relay;
pub mod rtc;
mod session;
mod signal;
mod stats;
mod sync;
mod transport;
mod types;

pub use config::SfuConfig;
pub use error::{Result, SfuError, SignalingError, SyncError, TransportError};
pub use estimator::{BitrateEstimator, Transit, TransitClock};
pub use hub::Hub;
pub use registry::{Registry, SessionRegistry, TrackRegistry};
pub use relay::{run_relay, strip_extensions};
pub use rtc::{RtcTransport, RtcTransportFactory};
pub use session::{Session, SessionExit};
pub use signal::{
    IceCandidate, SdpType, SessionDescription, SignalEvent, SignalMessage, SignalSink,
    SignalSource, SignalWriter, EVENT_ANSWER, EVENT_CANDIDATE, EVENT_OFFER,
};
pub use stats::{
    CsvStatsSink, ReceptionSnapshot, RecordBuilder, StatsRecord, StatsSink, StreamMonitor,
    CSV_HEADER,
};
pub use sync::{PassReport, SyncOutcome};
pub use transport::{
    FanoutTrack, FeedbackSource, InboundTrack, Packet, Transport, TransportEvent,
    TransportEvents, TransportFactory,
};
pub use types::{
    CodecCapability, ConnectionState, InboundLeg, SessionId, SessionState, StreamKey, TrackId,
    TrackKind,
};
