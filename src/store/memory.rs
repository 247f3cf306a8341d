//! In-process store with the listener semantics of a realtime document
//! database. Used for local sessions and as the test double for the engines.

use super::{Change, SignalingStore, StoreEvent, StoreEventSender, StorePath, SubscriptionId, WatchKind};
use crate::error::StoreError;
use async_trait::async_trait;
use log::{debug, trace};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Write { path: StorePath, value: Value },
    Delete { path: StorePath },
}

impl StoreOp {
    pub fn path(&self) -> &StorePath {
        match self {
            StoreOp::Write { path, .. } | StoreOp::Delete { path } => path,
        }
    }
}

struct Listener {
    path: StorePath,
    kind: WatchKind,
    sink: StoreEventSender,
    last_value: Option<Value>,
    seen: BTreeSet<String>,
}

struct Inner {
    root: Value,
    listeners: BTreeMap<SubscriptionId, Listener>,
    next_id: u64,
    log: Vec<StoreOp>,
    offline: bool,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Value::Object(Map::new()),
                listeners: BTreeMap::new(),
                next_id: 1,
                log: Vec::new(),
                offline: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates loss of the store connection: reads, writes and deletes fail.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Every mutation in the order it was applied.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.state().log.clone()
    }

    pub fn writes_to(&self, path: &StorePath) -> usize {
        self.state()
            .log
            .iter()
            .filter(|op| matches!(op, StoreOp::Write { path: p, .. } if p == path))
            .count()
    }

    pub fn listener_count(&self) -> usize {
        self.state().listeners.len()
    }

    /// Synchronous read for assertions.
    pub fn get(&self, path: &StorePath) -> Option<Value> {
        lookup(&self.state().root, path.segments()).cloned()
    }

    fn apply(&self, op: StoreOp) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.offline {
            return Err(StoreError::Unavailable(format!("offline, dropped change at {}", op.path())));
        }
        let Inner {
            root, listeners, log, ..
        } = &mut *state;

        match &op {
            StoreOp::Write { path, value } => {
                if is_empty_value(value) {
                    remove_at(root, path.segments());
                } else {
                    set_at(root, path.segments(), value.clone());
                }
            }
            StoreOp::Delete { path } => remove_at(root, path.segments()),
        }
        trace!("memory store: {:?}", op);

        let changed = op.path().clone();
        log.push(op);

        let mut dead = Vec::new();
        for (id, listener) in listeners.iter_mut() {
            if listener.path.overlaps(&changed) && !deliver(*id, listener, root) {
                dead.push(*id);
            }
        }
        for id in dead {
            debug!("memory store: dropping listener {:?} with closed sink", id);
            listeners.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn write(&self, path: &StorePath, value: Value) -> Result<(), StoreError> {
        self.apply(StoreOp::Write {
            path: path.clone(),
            value,
        })
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, StoreError> {
        let state = self.state();
        if state.offline {
            return Err(StoreError::Unavailable(format!("offline, cannot read {}", path)));
        }
        Ok(lookup(&state.root, path.segments()).cloned())
    }

    async fn delete(&self, path: &StorePath) -> Result<(), StoreError> {
        self.apply(StoreOp::Delete { path: path.clone() })
    }

    fn subscribe(
        &self,
        path: &StorePath,
        kind: WatchKind,
        sink: StoreEventSender,
    ) -> Result<SubscriptionId, StoreError> {
        let mut state = self.state();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;

        let mut listener = Listener {
            path: path.clone(),
            kind,
            sink,
            last_value: None,
            seen: BTreeSet::new(),
        };

        // Value listeners always report the initial state, even when empty.
        if kind == WatchKind::Value {
            let current = lookup(&state.root, path.segments()).cloned();
            let event = StoreEvent {
                subscription: id,
                change: Change::Value(current.clone()),
            };
            listener.last_value = current;
            if listener.sink.send(event).is_err() {
                return Err(StoreError::Listener(format!("sink for {} is closed", path)));
            }
        } else if !deliver(id, &mut listener, &state.root) {
            return Err(StoreError::Listener(format!("sink for {} is closed", path)));
        }

        state.listeners.insert(id, listener);
        debug!("memory store: {:?} listener {:?} attached at {}", kind, id, path);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if self.state().listeners.remove(&id).is_some() {
            debug!("memory store: listener {:?} detached", id);
        }
    }
}

/// Sends whatever changed for one listener. Returns false when its sink is gone.
fn deliver(id: SubscriptionId, listener: &mut Listener, root: &Value) -> bool {
    let current = lookup(root, listener.path.segments());
    match listener.kind {
        WatchKind::Value => {
            if current == listener.last_value.as_ref() {
                return true;
            }
            listener.last_value = current.cloned();
            listener
                .sink
                .send(StoreEvent {
                    subscription: id,
                    change: Change::Value(current.cloned()),
                })
                .is_ok()
        }
        WatchKind::ChildAdded => {
            let children = current.and_then(Value::as_object);
            let removed: Vec<String> = listener
                .seen
                .iter()
                .filter(|key| children.map_or(true, |c| !c.contains_key(key.as_str())))
                .cloned()
                .collect();
            for key in removed {
                listener.seen.remove(&key);
                let event = StoreEvent {
                    subscription: id,
                    change: Change::ChildRemoved { key },
                };
                if listener.sink.send(event).is_err() {
                    return false;
                }
            }

            let Some(children) = children else {
                return true;
            };
            let mut keys: Vec<&String> = children.keys().collect();
            keys.sort();
            for key in keys {
                if listener.seen.contains(key) {
                    continue;
                }
                listener.seen.insert(key.clone());
                let event = StoreEvent {
                    subscription: id,
                    change: Change::ChildAdded {
                        key: key.clone(),
                        value: children[key].clone(),
                    },
                };
                if listener.sink.send(event).is_err() {
                    return false;
                }
            }
            true
        }
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn lookup<'a>(root: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in segments {
        node = node.as_object()?.get(segment)?;
    }
    if is_empty_value(node) {
        None
    } else {
        Some(node)
    }
}

fn set_at(node: &mut Value, segments: &[String], value: Value) {
    let Some((head, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(head.clone()).or_insert(Value::Null);
        set_at(child, rest, value);
    }
}

/// Removes the node at `segments` and prunes parents left empty.
fn remove_at(node: &mut Value, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        *node = Value::Object(Map::new());
        return;
    };
    let Value::Object(map) = node else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(child) = map.get_mut(head) {
        remove_at(child, rest);
        if is_empty_value(child) {
            map.remove(head);
        }
    }
}
