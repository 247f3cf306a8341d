use crate::error::SignalingError;
use crate::peer::types::RemoteTrackInfo;
use crate::signaling::host::HostState;
use crate::signaling::joiner::JoinerState;
use log::{error, trace};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

/// User-facing status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBadge {
    Connecting,
    Ready,
    Error,
}

impl fmt::Display for StatusBadge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StatusBadge::Connecting => "Connecting",
            StatusBadge::Ready => "Ready",
            StatusBadge::Error => "Error",
        };
        f.write_str(text)
    }
}

/// Notifications for UI and detection collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    HostState(HostState),
    JoinerState(JoinerState),
    Connection(ConnectionStatus),
    Status(StatusBadge),
    /// Confirmation of a local camera toggle.
    CameraToggled { off: bool },
    /// Confirmation of a local mic toggle.
    MicToggled { on: bool },
    RemoteCamera { off: bool },
    RemoteMic { on: bool },
    ViewerPresence { watching: bool },
    RemoteTrack(RemoteTrackInfo),
    Detection { kind: String, timestamp: i64, data: Value },
    Error(String),
    Disposed,
}

#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        trace!("event: {:?}", event);
        // nobody listening is fine
        let _ = self.tx.send(event);
    }

    pub fn emit_status(&self, badge: StatusBadge) {
        self.emit(SessionEvent::Status(badge));
    }

    pub fn emit_connection(&self, status: ConnectionStatus) {
        self.emit(SessionEvent::Connection(status));
        match status {
            ConnectionStatus::Connected => self.emit_status(StatusBadge::Ready),
            ConnectionStatus::Disconnected => self.emit_status(StatusBadge::Connecting),
            ConnectionStatus::Error => self.emit_status(StatusBadge::Error),
        }
    }

    /// Logs a handled failure and surfaces it to the UI.
    pub fn emit_error(&self, context: &str, err: &SignalingError) {
        error!("{}: {}", context, err);
        self.emit(SessionEvent::Error(format!("{}: {}", context, err)));
        self.emit_status(StatusBadge::Error);
    }
}
