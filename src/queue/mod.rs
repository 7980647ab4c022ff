//! Durable retry queue for submissions whose live delivery failed.
//!
//! * Entries keep insertion order ([`EntryId`] is a monotonic sequence).
//! * `enqueue` only returns `Ok` once the entry is durable for the backend.
//! * Entries leave the queue through [`RetryQueue::remove`] after a replay
//!   succeeded or the retention policy evicted them.

pub mod file;
pub mod memory;
pub mod replay;

use crate::{Error, request::InterceptedRequest};
use async_trait::async_trait;
use std::{
    fmt,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

pub use file::FileQueue;
pub use memory::MemoryQueue;
pub use replay::{ReplayReport, Replayer, SyncHandle, SyncOptions};

/// Queue name used by the comment interceptor.
pub const DEFAULT_QUEUE_NAME: &str = "wpPendingComments";

/// Position of an entry in its queue. Larger ids were enqueued later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: EntryId,
    /// Milliseconds since the unix epoch.
    pub enqueued_at: u64,
    pub request: InterceptedRequest,
}

impl QueueEntry {
    #[must_use]
    pub fn age(&self, now: SystemTime) -> Duration {
        let now = unix_millis(now);
        Duration::from_millis(now.saturating_sub(self.enqueued_at))
    }
}

/// Storage backend of the retry queue.
#[async_trait]
pub trait RetryQueue: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Append `request`; `Ok` only after the entry is durably stored.
    async fn enqueue(&self, request: InterceptedRequest) -> Result<EntryId, Error>;

    /// Snapshot of all entries, oldest first.
    async fn entries(&self) -> Result<Vec<QueueEntry>, Error>;

    /// Remove an entry. Removing an unknown id is not an error.
    async fn remove(&self, id: EntryId) -> Result<(), Error>;

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.entries().await?.len())
    }
}

pub type SharedQueue = Arc<dyn RetryQueue>;

#[async_trait]
impl<T: RetryQueue + ?Sized> RetryQueue for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn enqueue(&self, request: InterceptedRequest) -> Result<EntryId, Error> {
        (**self).enqueue(request).await
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>, Error> {
        (**self).entries().await
    }

    async fn remove(&self, id: EntryId) -> Result<(), Error> {
        (**self).remove(id).await
    }

    async fn len(&self) -> Result<usize, Error> {
        (**self).len().await
    }
}

pub(crate) fn unix_millis(at: SystemTime) -> u64 {
    let millis = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}
