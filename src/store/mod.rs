//! Interface over the shared hierarchical key-value store used as the only
//! signaling transport.
//!
//! Assumed properties of every implementation:
//! - read-after-write for a single client,
//! - at-least-once delivery of child-added events (existing children are
//!   replayed when a listener attaches),
//! - no transactions spanning several paths.

pub mod memory;

use crate::error::StoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath(Vec<String>);

impl StorePath {
    pub fn root() -> Self {
        StorePath(Vec::new())
    }

    /// Parses `a/b/c`. Empty segments are rejected.
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let trimmed = text.trim_matches('/');
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let segments: Vec<String> = trimmed.split('/').map(str::to_owned).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(StoreError::InvalidPath(text.to_owned()));
        }
        Ok(StorePath(segments))
    }

    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        StorePath(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_prefix_of(&self, other: &StorePath) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    /// True when a change at one path can alter the value seen at the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.is_prefix_of(other) || other.is_prefix_of(self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// Fires on attach with the current value, then whenever it changes.
    Value,
    /// Replays existing children on attach, then fires for every new child.
    ChildAdded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Value(Option<Value>),
    ChildAdded { key: String, value: Value },
    ChildRemoved { key: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub subscription: SubscriptionId,
    pub change: Change,
}

pub type StoreEventSender = mpsc::UnboundedSender<StoreEvent>;

#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError>;

    /// One-shot read. `None` when nothing is stored at `path`.
    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError>;

    /// Removes `path` and everything below it.
    async fn delete(&self, path: &StorePath) -> Result<(), StoreError>;

    fn subscribe(
        &self,
        path: &StorePath,
        kind: WatchKind,
        sink: StoreEventSender,
    ) -> Result<SubscriptionId, StoreError>;

    /// Detaches a listener. No event for `id` is sent after this returns.
    fn unsubscribe(&self, id: SubscriptionId);
}
