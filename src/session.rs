//! Store schema of one hosted session and the lookups around it.
//!
//! Layout:
//! ```text
//! users/{identity}/sessions/{sessionId}/
//!     sessionId, passkey, sessionName, active, createdAt,
//!     offer, answer, iceCandidates/{key}, cameraOff, micOn,
//!     disconnect, someoneWatching, detectionEvents/{timestamp}
//! sessionCodes/{passkey} -> { sessionId, hostIdentity }
//! ```

use crate::error::{SignalingError, StoreError};
use crate::store::{SignalingStore, StorePath};
use crate::utils::{generate_passkey, identity_key, now_millis, random_token};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const USERS: &str = "users";
pub const SESSIONS: &str = "sessions";
pub const SESSION_CODES: &str = "sessionCodes";

pub const SESSION_ID: &str = "sessionId";
pub const PASSKEY: &str = "passkey";
pub const SESSION_NAME: &str = "sessionName";
pub const ACTIVE: &str = "active";
pub const CREATED_AT: &str = "createdAt";
pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const ICE_CANDIDATES: &str = "iceCandidates";
pub const CAMERA_OFF: &str = "cameraOff";
pub const MIC_ON: &str = "micOn";
pub const DISCONNECT: &str = "disconnect";
pub const SOMEONE_WATCHING: &str = "someoneWatching";
pub const DETECTION_EVENTS: &str = "detectionEvents";

// Retries when a generated passkey is already registered
const PASSKEY_ATTEMPTS: usize = 5;

/// Address of one session record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub identity: String,
    pub session_id: String,
}

impl SessionRef {
    pub fn new(identity: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            session_id: session_id.into(),
        }
    }

    pub fn sessions_root(identity: &str) -> StorePath {
        StorePath::root()
            .child(USERS)
            .child(identity_key(identity))
            .child(SESSIONS)
    }

    pub fn path(&self) -> StorePath {
        Self::sessions_root(&self.identity).child(self.session_id.clone())
    }

    pub fn field(&self, key: &str) -> StorePath {
        self.path().child(key)
    }

    pub fn offer(&self) -> StorePath {
        self.field(OFFER)
    }

    pub fn answer(&self) -> StorePath {
        self.field(ANSWER)
    }

    pub fn candidates(&self) -> StorePath {
        self.field(ICE_CANDIDATES)
    }

    pub fn disconnect(&self) -> StorePath {
        self.field(DISCONNECT)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub passkey: String,
    pub session_name: String,
    pub active: bool,
    pub created_at: i64,
}

/// Lookup entry registered under `sessionCodes/{passkey}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCode {
    pub session_id: String,
    pub host_identity: String,
}

/// Offer or answer as stored, tagged with the epoch it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub sdp: String,
    pub epoch: u64,
}

impl SignalMessage {
    pub fn new(sdp: impl Into<String>, epoch: u64) -> Self {
        Self {
            sdp: sdp.into(),
            epoch,
        }
    }

    /// Decodes a stored offer/answer. A bare SDP string (records written
    /// before epochs existed) is read as epoch 0.
    pub fn decode(what: &str, value: &Value) -> Result<Self, SignalingError> {
        match value {
            Value::String(sdp) if !sdp.is_empty() => Ok(Self::new(sdp.clone(), 0)),
            Value::Object(_) => {
                let message: SignalMessage =
                    serde_json::from_value(value.clone()).map_err(|e| SignalingError::Malformed {
                        what: what.to_owned(),
                        reason: e.to_string(),
                    })?;
                if message.sdp.is_empty() {
                    return Err(SignalingError::Malformed {
                        what: what.to_owned(),
                        reason: "empty sdp".into(),
                    });
                }
                Ok(message)
            }
            other => Err(SignalingError::Malformed {
                what: what.to_owned(),
                reason: format!("unexpected value {}", other),
            }),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "sdp": self.sdp, "epoch": self.epoch })
    }
}

/// Flags are written as `1`; `true` and `"1"` are accepted as well.
pub fn flag_is_set(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s == "1",
        _ => false,
    }
}

pub fn flag_value() -> Value {
    json!(1)
}

/// Creates a session record owned by `identity` and registers its passkey.
///
/// When `passkey` is `None` a fresh one is generated; an explicit passkey that
/// is already registered is refused.
pub async fn create_session(
    store: &dyn SignalingStore,
    identity: &str,
    name: &str,
    passkey: Option<&str>,
) -> Result<(SessionRef, SessionRecord), SignalingError> {
    if identity.is_empty() {
        return Err(SignalingError::missing("host identity"));
    }

    let passkey = match passkey {
        Some(key) => {
            if store.read(&code_path(key)).await?.is_some() {
                return Err(SignalingError::InvalidState(format!(
                    "passkey {} is already in use",
                    key
                )));
            }
            key.to_owned()
        }
        None => free_passkey(store).await?,
    };

    let session_id = format!(
        "session_{}_{}",
        chrono::Utc::now().timestamp(),
        random_token()
    );
    let session = SessionRef::new(identity, session_id.clone());
    let record = SessionRecord {
        session_id,
        passkey: passkey.clone(),
        session_name: name.trim().to_owned(),
        active: true,
        created_at: now_millis(),
    };

    store
        .write(&session.path(), serde_json::to_value(&record).map_err(StoreError::from)?)
        .await?;
    let code = SessionCode {
        session_id: record.session_id.clone(),
        host_identity: identity.to_owned(),
    };
    store
        .write(&code_path(&passkey), serde_json::to_value(&code).map_err(StoreError::from)?)
        .await?;

    info!("Created session {} for {}", record.session_id, identity);
    Ok((session, record))
}

async fn free_passkey(store: &dyn SignalingStore) -> Result<String, SignalingError> {
    for _ in 0..PASSKEY_ATTEMPTS {
        let candidate = generate_passkey();
        if store.read(&code_path(&candidate)).await?.is_none() {
            return Ok(candidate);
        }
        debug!("Passkey {} taken, drawing another", candidate);
    }
    Err(SignalingError::InvalidState("no free passkey available".into()))
}

fn code_path(passkey: &str) -> StorePath {
    StorePath::root().child(SESSION_CODES).child(passkey)
}

/// Resolves a passkey to the session it was registered for.
pub async fn find_session_by_passkey(
    store: &dyn SignalingStore,
    passkey: &str,
) -> Result<Option<SessionRef>, SignalingError> {
    let Some(value) = store.read(&code_path(passkey)).await? else {
        return Ok(None);
    };
    let code: SessionCode = serde_json::from_value(value).map_err(|e| SignalingError::Malformed {
        what: format!("session code {}", passkey),
        reason: e.to_string(),
    })?;
    let session = SessionRef::new(code.host_identity, code.session_id);
    if store.read(&session.path()).await?.is_none() {
        warn!("Passkey {} points at a removed session", passkey);
        return Ok(None);
    }
    Ok(Some(session))
}

/// First session (in key order) under `identity`'s own collection that has a
/// non-empty `sessionName`.
pub async fn discover_session(
    store: &dyn SignalingStore,
    identity: &str,
) -> Result<Option<SessionRef>, SignalingError> {
    let Some(Value::Object(sessions)) = store.read(&SessionRef::sessions_root(identity)).await?
    else {
        return Ok(None);
    };

    let mut ids: Vec<&String> = sessions.keys().collect();
    ids.sort();
    let found = ids.into_iter().find(|id| {
        sessions[id.as_str()]
            .get(SESSION_NAME)
            .and_then(Value::as_str)
            .is_some_and(|name| !name.is_empty())
    });
    Ok(found.map(|id| SessionRef::new(identity, id.clone())))
}

pub async fn rename_session(
    store: &dyn SignalingStore,
    session: &SessionRef,
    name: &str,
) -> Result<(), SignalingError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SignalingError::Malformed {
            what: SESSION_NAME.into(),
            reason: "name is empty".into(),
        });
    }
    if store.read(&session.field(SESSION_ID)).await?.is_none() {
        return Err(SignalingError::missing(format!("session {}", session.session_id)));
    }
    store.write(&session.field(SESSION_NAME), json!(name)).await?;
    Ok(())
}

/// Deletes the whole session subtree and its passkey registration.
pub async fn delete_session(
    store: &dyn SignalingStore,
    session: &SessionRef,
) -> Result<(), SignalingError> {
    let passkey = store
        .read(&session.field(PASSKEY))
        .await?
        .and_then(|v| v.as_str().map(str::to_owned));
    store.delete(&session.path()).await?;

    if let Some(passkey) = passkey {
        let owned = match store.read(&code_path(&passkey)).await? {
            Some(value) => serde_json::from_value::<SessionCode>(value)
                .map(|code| code.session_id == session.session_id)
                .unwrap_or(false),
            None => false,
        };
        if owned {
            store.delete(&code_path(&passkey)).await?;
        }
    }
    debug!("Deleted session {}", session.session_id);
    Ok(())
}
