//! Persistence collaborators.
//!
//! The engine needs two stores: a [`StackStore`] holding the frame chain, and
//! a [`HeapStore`] holding durable side-channel entries (flow records,
//! consumed-step markers, reminders, callback addresses). Both are async
//! traits so that concrete backends can live in separate crates; the
//! in-memory implementations here are for tests and single-process embedding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::id::Id;

/// Where a frame's result goes when it completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    /// Step id of the parent frame.
    pub step: Id,
    /// Position within the parent aggregator, if the parent is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
}

impl ParentLink {
    pub fn new(step: Id, slot: Option<u32>) -> Self {
        Self { step, slot }
    }
}

/// One persisted frame. `parent == None` marks the top of the flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFrame {
    pub flow_id: Id,
    pub parent: Option<ParentLink>,
    /// Opaque to the store.
    pub bytes: Vec<u8>,
}

/// Frame persistence, keyed by step id.
///
/// `put` must be atomic per frame: after it returns `Ok`, `get` returns the
/// frame with its parent link; after it returns `Err`, nothing was written.
#[async_trait]
pub trait StackStore: Send + Sync + 'static {
    /// Insert or replace the frame stored at `step_id`.
    async fn put(&self, step_id: Id, frame: StoredFrame) -> anyhow::Result<()>;

    async fn get(&self, step_id: Id) -> anyhow::Result<Option<StoredFrame>>;

    /// Remove a frame; returns whether it existed.
    async fn delete(&self, step_id: Id) -> anyhow::Result<bool>;

    /// Step ids of every frame stored for a flow.
    async fn list(&self, flow_id: Id) -> anyhow::Result<Vec<Id>>;
}

/// Durable key/value side channel.
#[async_trait]
pub trait HeapStore: Send + Sync + 'static {
    async fn save(&self, key: &str, value: JsonValue) -> anyhow::Result<()>;

    async fn load(&self, key: &str) -> anyhow::Result<Option<JsonValue>>;

    /// Remove an entry; returns whether it existed.
    async fn delete(&self, key: &str) -> anyhow::Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<(String, JsonValue)>>;
}

/// Heap keys used by the engine.
pub mod keys {
    use crate::id::Id;

    pub const FLOW_PREFIX: &str = "flow/";
    pub const CONSUMED_PREFIX: &str = "consumed/";
    pub const CANCEL_PREFIX: &str = "cancel/";
    pub const REMINDER_PREFIX: &str = "reminder/";

    pub fn flow(flow_id: Id) -> String {
        format!("{FLOW_PREFIX}{flow_id}")
    }

    pub fn consumed(step_id: Id) -> String {
        format!("{CONSUMED_PREFIX}{step_id}")
    }

    pub fn cancel(flow_id: Id) -> String {
        format!("{CANCEL_PREFIX}{flow_id}")
    }

    pub fn reminder(step_id: Id) -> String {
        format!("{REMINDER_PREFIX}{step_id}")
    }
}

/// In-memory [`StackStore`] keyed by the text form of step ids.
#[derive(Debug, Default)]
pub struct MemoryStackStore {
    frames: RwLock<HashMap<String, StoredFrame>>,
}

impl MemoryStackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored frames.
    pub async fn len(&self) -> usize {
        self.frames.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.frames.read().await.is_empty()
    }
}

#[async_trait]
impl StackStore for MemoryStackStore {
    async fn put(&self, step_id: Id, frame: StoredFrame) -> anyhow::Result<()> {
        self.frames.write().await.insert(step_id.to_string(), frame);
        Ok(())
    }

    async fn get(&self, step_id: Id) -> anyhow::Result<Option<StoredFrame>> {
        Ok(self.frames.read().await.get(&step_id.to_string()).cloned())
    }

    async fn delete(&self, step_id: Id) -> anyhow::Result<bool> {
        Ok(self
            .frames
            .write()
            .await
            .remove(&step_id.to_string())
            .is_some())
    }

    async fn list(&self, flow_id: Id) -> anyhow::Result<Vec<Id>> {
        let frames = self.frames.read().await;
        let mut steps = frames
            .iter()
            .filter(|(_, frame)| frame.flow_id == flow_id)
            .map(|(key, _)| Id::parse(key))
            .collect::<Result<Vec<_>, _>>()?;
        steps.sort();
        Ok(steps)
    }
}

/// In-memory [`HeapStore`].
#[derive(Debug, Default)]
pub struct MemoryHeapStore {
    entries: RwLock<BTreeMap<String, JsonValue>>,
}

impl MemoryHeapStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl HeapStore for MemoryHeapStore {
    async fn save(&self, key: &str, value: JsonValue) -> anyhow::Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> anyhow::Result<Option<JsonValue>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> anyhow::Result<Vec<(String, JsonValue)>> {
        let entries = self.entries.read().await;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
