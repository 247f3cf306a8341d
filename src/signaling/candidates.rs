//! Trickle ICE over an append-only child collection.
//!
//! Producers write each local candidate under a fresh key that sorts after
//! the keys they wrote before. Consumers treat the collection as an unordered
//! set: replayed, duplicated, foreign-epoch and self-written entries are
//! dropped before reaching the peer connection.

use crate::error::{SignalingError, StoreError};
use crate::peer::types::IceCandidate;
use crate::store::{SignalingStore, StorePath};
use crate::utils::random_token;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub const KEY_PREFIX: &str = "candidate_";

/// One entry of `iceCandidates`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidateEntry {
    pub sdp: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Absent in entries written by older clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl CandidateEntry {
    pub fn new(candidate: &IceCandidate, epoch: u64, origin: &str) -> Self {
        Self {
            sdp: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            epoch: Some(epoch),
            origin: Some(origin.to_owned()),
        }
    }

    pub fn to_candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: self.sdp.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
        }
    }
}

/// Client-side key generator: `candidate_<micros>_<origin>_<token>`.
/// Keys from one generator strictly increase; no read-before-write.
#[derive(Debug)]
pub struct CandidateKeyGen {
    origin: String,
    last_micros: i64,
}

impl CandidateKeyGen {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            last_micros: 0,
        }
    }

    pub fn next_key(&mut self) -> String {
        let now = chrono::Utc::now().timestamp_micros();
        self.last_micros = now.max(self.last_micros + 1);
        format!(
            "{}{:020}_{}_{}",
            KEY_PREFIX,
            self.last_micros,
            self.origin,
            random_token()
        )
    }
}

pub struct CandidatePublisher {
    store: Arc<dyn SignalingStore>,
    collection: StorePath,
    origin: String,
    keys: CandidateKeyGen,
}

impl CandidatePublisher {
    pub fn new(store: Arc<dyn SignalingStore>, collection: StorePath, origin: &str) -> Self {
        Self {
            store,
            collection,
            origin: origin.to_owned(),
            keys: CandidateKeyGen::new(origin),
        }
    }

    /// Appends `candidate` and returns the key it was written under.
    pub async fn publish(
        &mut self,
        candidate: &IceCandidate,
        epoch: u64,
    ) -> Result<String, SignalingError> {
        let key = self.keys.next_key();
        let entry = CandidateEntry::new(candidate, epoch, &self.origin);
        let value = serde_json::to_value(&entry).map_err(StoreError::from)?;
        self.store.write(&self.collection.child(key.clone()), value).await?;
        trace!("published candidate {} (epoch {})", key, epoch);
        Ok(key)
    }
}

/// Filters deliveries from a child-added listener down to candidates that
/// still need to be added to the peer connection.
#[derive(Debug)]
pub struct CandidateConsumer {
    origin: String,
    epoch: u64,
    seen_keys: HashSet<String>,
    applied: HashSet<IceCandidate>,
}

impl CandidateConsumer {
    pub fn new(origin: impl Into<String>, epoch: u64) -> Self {
        Self {
            origin: origin.into(),
            epoch,
            seen_keys: HashSet::new(),
            applied: HashSet::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Starts a new epoch: nothing seen so far counts anymore.
    pub fn reset(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.seen_keys.clear();
        self.applied.clear();
    }

    /// A removed key may be reused after the collection is wiped.
    pub fn forget(&mut self, key: &str) {
        self.seen_keys.remove(key);
    }

    pub fn accept(&mut self, key: &str, value: &Value) -> Option<IceCandidate> {
        if !self.seen_keys.insert(key.to_owned()) {
            trace!("candidate {} redelivered", key);
            return None;
        }

        let entry: CandidateEntry = match serde_json::from_value(value.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring malformed candidate {}: {}", key, e);
                return None;
            }
        };
        if entry.sdp.is_empty() {
            warn!("Ignoring candidate {} with empty sdp", key);
            return None;
        }
        if entry.origin.as_deref() == Some(self.origin.as_str()) {
            return None;
        }
        if let Some(epoch) = entry.epoch {
            if epoch != self.epoch {
                debug!(
                    "Dropping candidate {} from epoch {} (current {})",
                    key, epoch, self.epoch
                );
                return None;
            }
        }

        let candidate = entry.to_candidate();
        if !self.applied.insert(candidate.clone()) {
            debug!("Candidate {} duplicates one already applied", key);
            return None;
        }
        Some(candidate)
    }
}
