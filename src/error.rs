use thiserror::Error;

/// Failures of the shared document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid store path `{0}`")]
    InvalidPath(String),

    #[error("listener rejected: {0}")]
    Listener(String),

    #[error("failed to encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures reported by the native peer-connection engine.
#[derive(Debug, Error)]
pub enum RtcError {
    #[error("webrtc: {0}")]
    Engine(#[from] webrtc::Error),

    #[error("invalid session description: {0}")]
    Sdp(String),

    #[error("peer connection is closed")]
    Closed,

    #[error("local media is not attached")]
    NoLocalMedia,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Rtc(#[from] RtcError),

    #[error("missing {0}")]
    MissingData(String),

    #[error("malformed {what}: {reason}")]
    Malformed { what: String, reason: String },

    #[error("operation not allowed in state {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine has been disposed")]
    Disposed,
}

impl SignalingError {
    pub fn missing(what: impl Into<String>) -> Self {
        SignalingError::MissingData(what.into())
    }

    /// Store read/write/listener failure.
    pub fn is_transport(&self) -> bool {
        matches!(self, SignalingError::Store(_))
    }

    /// SDP creation or application failure.
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingError::Rtc(RtcError::Sdp(_)) | SignalingError::Rtc(RtcError::Engine(_))
        )
    }

    /// Absent or malformed data: the attempt is abandoned and the engine stays idle.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SignalingError::MissingData(_) | SignalingError::Malformed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_fall_into_one_class() {
        let transport = SignalingError::from(StoreError::Unavailable("offline".into()));
        assert!(transport.is_transport());
        assert!(!transport.is_negotiation() && !transport.is_soft());

        let negotiation = SignalingError::from(RtcError::Sdp("bad m-line".into()));
        assert!(negotiation.is_negotiation());
        assert!(!negotiation.is_transport() && !negotiation.is_soft());

        let soft = SignalingError::missing("offer");
        assert!(soft.is_soft());
        assert!(!soft.is_transport() && !soft.is_negotiation());
    }

    #[test]
    fn closed_peer_is_not_a_negotiation_failure() {
        assert!(!SignalingError::from(RtcError::Closed).is_negotiation());
        assert!(!SignalingError::InvalidState("join while Connected".into()).is_soft());
    }
}
