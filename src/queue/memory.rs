//! In-process queue. Not durable across restarts; used by tests and by hosts
//! that bring their own persistence.

use super::{EntryId, QueueEntry, RetryQueue, unix_millis};
use crate::{Error, request::InterceptedRequest};
use async_trait::async_trait;
use std::{collections::VecDeque, time::SystemTime};
use tokio::sync::Mutex;

#[derive(Default)]
struct State {
    next_id: u64,
    entries: VecDeque<QueueEntry>,
}

pub struct MemoryQueue {
    name: String,
    state: Mutex<State>,
}

impl MemoryQueue {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }
}

#[async_trait]
impl RetryQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, request: InterceptedRequest) -> Result<EntryId, Error> {
        let mut state = self.state.lock().await;
        let id = EntryId(state.next_id);
        state.next_id += 1;
        state.entries.push_back(QueueEntry {
            id,
            enqueued_at: unix_millis(SystemTime::now()),
            request,
        });
        Ok(id)
    }

    async fn entries(&self) -> Result<Vec<QueueEntry>, Error> {
        Ok(self.state.lock().await.entries.iter().cloned().collect())
    }

    async fn remove(&self, id: EntryId) -> Result<(), Error> {
        self.state.lock().await.entries.retain(|entry| entry.id != id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, Error> {
        Ok(self.state.lock().await.entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;
    use url::Url;

    fn captured(body: &'static str) -> InterceptedRequest {
        let url = Url::parse("https://blog.example/wp-comments-post.php").unwrap();
        InterceptedRequest::capture(Request::post(url).body(body)).unwrap()
    }

    #[tokio::test]
    async fn entries_come_back_in_insertion_order() {
        let queue = MemoryQueue::new("test");
        let a = queue.enqueue(captured("a")).await.unwrap();
        let b = queue.enqueue(captured("b")).await.unwrap();
        assert!(a < b);

        let bodies: Vec<_> = queue
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.request.body)
            .collect();
        assert_eq!(bodies, vec!["a", "b"]);

        queue.remove(a).await.unwrap();
        queue.remove(EntryId(99)).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
