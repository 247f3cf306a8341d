//! Peer-to-peer camera sessions signaled through a shared document store.
//!
//! A host publishes offers and trickle candidates under its session record;
//! joiners answer and follow renegotiations. There is no signaling server.

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod store;
pub mod utils;

pub use config::SignalingConfig;
pub use error::{RtcError, SignalingError, StoreError};
pub use events::{ConnectionStatus, EventEmitter, SessionEvent, StatusBadge};
pub use peer::{MediaSink, RtcEngine, RtcEvent, WebRtcEngine};
pub use session::{
    create_session, discover_session, find_session_by_passkey, rename_session, SessionRecord,
    SessionRef, SignalMessage,
};
pub use signaling::{
    HostHandle, HostState, JoinTarget, JoinerHandle, JoinerState, RemoteIndicators, ReplayHook,
};
pub use store::{MemoryStore, SignalingStore, StorePath};
