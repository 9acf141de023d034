use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::inflight::OutInflightMessage;
use crate::types::{From, PacketId, Publish};
use crate::Result;

/// One persisted entry of a parked session: either a message still in
/// the delivery window or one waiting in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredMessage {
    Inflight(OutInflightMessage),
    Queued(From, Publish),
}

impl StoredMessage {
    #[inline]
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            StoredMessage::Inflight(m) => m.publish.packet_id.map(|id| id.get()),
            StoredMessage::Queued(_, p) => p.packet_id.map(|id| id.get()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The handle was revoked because the same name was opened again
    #[error("store handle for `{0}` was invalidated")]
    Invalidated(String),
}

/// Durable home for a session's pending messages, keyed by queue name
/// (normally the client id).
///
/// Opening a name revokes any handle previously issued for it, so at
/// most one writer exists per name. A session resuming after takeover
/// must open its own fresh handle.
#[async_trait]
pub trait MessageStore: Send + Sync {
    type Handle: StoreHandle;

    async fn open(&self, name: &str) -> Result<Self::Handle>;
}

#[async_trait]
pub trait StoreHandle: Send + Sync {
    async fn append(&self, msg: StoredMessage) -> Result<()>;

    /// Snapshot in append order.
    async fn iter(&self) -> Result<Vec<StoredMessage>>;

    async fn remove(&self, packet_id: PacketId) -> Result<()>;

    /// Drops the queue contents and revokes this handle.
    async fn invalidate(&self) -> Result<()>;
}

struct NamedQueue {
    // monotonically bumped on open, stale handles carry an older epoch
    epoch: AtomicU64,
    entries: parking_lot::RwLock<Vec<StoredMessage>>,
}

/// In-memory reference store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    queues: Arc<DashMap<String, Arc<NamedQueue>, ahash::RandomState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    type Handle = MemoryHandle;

    async fn open(&self, name: &str) -> Result<Self::Handle> {
        let queue = self
            .queues
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(NamedQueue {
                    epoch: AtomicU64::new(0),
                    entries: parking_lot::RwLock::new(Vec::new()),
                })
            })
            .clone();
        let epoch = queue.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MemoryHandle { name: name.to_owned(), epoch, queue })
    }
}

pub struct MemoryHandle {
    name: String,
    epoch: u64,
    queue: Arc<NamedQueue>,
}

impl MemoryHandle {
    #[inline]
    fn check(&self) -> Result<()> {
        if self.queue.epoch.load(Ordering::SeqCst) != self.epoch {
            return Err(StoreError::Invalidated(self.name.clone()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn append(&self, msg: StoredMessage) -> Result<()> {
        self.check()?;
        self.queue.entries.write().push(msg);
        Ok(())
    }

    async fn iter(&self) -> Result<Vec<StoredMessage>> {
        self.check()?;
        Ok(self.queue.entries.read().clone())
    }

    async fn remove(&self, packet_id: PacketId) -> Result<()> {
        self.check()?;
        let mut entries = self.queue.entries.write();
        if let Some(pos) = entries.iter().position(|m| m.packet_id() == Some(packet_id)) {
            entries.remove(pos);
        }
        Ok(())
    }

    async fn invalidate(&self) -> Result<()> {
        self.check()?;
        self.queue.entries.write().clear();
        self.queue.epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Id;
    use bytes::Bytes;
    use fluxmq_codec::types::QoS;
    use std::num::NonZeroU16;

    fn stored(packet_id: u16) -> StoredMessage {
        StoredMessage::Queued(
            From::Client(Id::new("c1".into(), None)),
            Publish {
                dup: false,
                retain: false,
                qos: QoS::AtLeastOnce,
                topic: "t".into(),
                packet_id: NonZeroU16::new(packet_id),
                payload: Bytes::from_static(b"m"),
                properties: None,
            },
        )
    }

    #[tokio::test]
    async fn test_append_iter_remove() {
        let store = MemoryStore::new();
        let h = store.open("c1").await.unwrap();
        h.append(stored(1)).await.unwrap();
        h.append(stored(2)).await.unwrap();
        assert_eq!(h.iter().await.unwrap().len(), 2);
        h.remove(1).await.unwrap();
        let rest = h.iter().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].packet_id(), Some(2));
    }

    #[tokio::test]
    async fn test_reopen_revokes_old_handle() {
        let store = MemoryStore::new();
        let old = store.open("c1").await.unwrap();
        old.append(stored(1)).await.unwrap();

        let new = store.open("c1").await.unwrap();
        // the takeover invalidated the first handle
        assert!(old.append(stored(2)).await.is_err());
        assert!(old.iter().await.is_err());
        // the new handle still sees the surviving contents
        assert_eq!(new.iter().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_clears_and_revokes() {
        let store = MemoryStore::new();
        let h = store.open("c1").await.unwrap();
        h.append(stored(1)).await.unwrap();
        h.invalidate().await.unwrap();
        assert!(h.iter().await.is_err());

        let h = store.open("c1").await.unwrap();
        assert!(h.iter().await.unwrap().is_empty());
    }
}
