//! Process-local FIFO queue.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::cluster::TimeUuidGenerator;
use crate::config::QueueConfig;
use crate::error_handling::Error;
use crate::schema::normalize_identifier;

use super::{check_limit, encode_payload, Capabilities, Popped, QueueEntry, QueueOverflow, QueueToken};

/// Keeps overflow in memory. Same contract as the cluster queue, minus durability.
#[derive(Debug)]
pub struct MemoryQueue {
    queue_name: String,
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl MemoryQueue {
    pub fn new(config: &QueueConfig) -> Result<Self, Error> {
        let queue_name = match &config.queue_name {
            Some(name) => name.clone(),
            None => normalize_identifier(&config.keyspace)?,
        };
        Ok(Self {
            queue_name,
            entries: Mutex::new(VecDeque::new()),
        })
    }
}

#[async_trait]
impl QueueOverflow for MemoryQueue {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            count: true,
            durable: false,
            ordered: true,
        }
    }

    async fn length(&self) -> Result<Option<u64>, Error> {
        Ok(Some(self.entries.lock().await.len() as u64))
    }

    async fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.entries.lock().await.is_empty())
    }

    async fn clear(&self) -> Result<bool, Error> {
        self.entries.lock().await.clear();
        Ok(true)
    }

    async fn push(&self, envelope: Option<&str>) -> Result<Option<QueueToken>, Error> {
        let Some(envelope) = envelope else {
            return Ok(None);
        };
        let payload = encode_payload(envelope)?;
        let mut entries = self.entries.lock().await;
        let entry = QueueEntry::new(
            self.queue_name.clone(),
            TimeUuidGenerator::shared().now(),
            payload,
        );
        let token = entry.token();
        entries.push_back(entry);
        Ok(Some(token))
    }

    async fn pop(&self, n: usize) -> Result<Popped, Error> {
        check_limit(n)?;
        let mut entries = self.entries.lock().await;
        let take = n.min(entries.len());
        let popped: Vec<QueueEntry> = entries.drain(..take).collect();
        Ok(Popped::from_entries(popped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_queue_is_fifo() {
        let queue = MemoryQueue::new(&QueueConfig::default()).unwrap();
        for i in 1..=3 {
            let token = queue
                .push(Some(&format!(r#"{{"payload":"{i}"}}"#)))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(token.queue_name, "crawl_queue_overflow");
        }
        assert_eq!(queue.length().await.unwrap(), Some(3));

        let popped = queue.pop(2).await.unwrap();
        assert_eq!(
            popped.into_payloads(),
            vec![Some("\"1\"".to_string()), Some("\"2\"".to_string())]
        );
        assert_eq!(queue.pop(10).await.unwrap(), Popped::One(Some("\"3\"".into())));
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_push_none_is_noop() {
        let queue = MemoryQueue::new(&QueueConfig::default()).unwrap();
        assert_eq!(queue.push(None).await.unwrap(), None);
        assert!(queue.is_empty().await.unwrap());
    }
}
