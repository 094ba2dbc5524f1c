//! In-process event queue

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{Delivery, EventSource};
use crate::error::StoreError;

#[derive(Default)]
struct Inner {
    ready: VecDeque<Delivery>,
    in_flight: HashMap<u64, Delivery>,
    next_token: u64,
}

/// Volatile queue with the same ack/nack contract as the spool
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payload: impl Into<Vec<u8>>) -> u64 {
        let token = {
            let mut inner = self.inner.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            inner.ready.push_back(Delivery {
                token,
                payload: payload.into(),
                attempt: 0,
            });
            token
        };
        self.notify.notify_one();
        token
    }

    /// Events waiting for a worker
    pub fn pending(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    fn pop(&self) -> Option<Delivery> {
        let mut inner = self.inner.lock();
        let mut delivery = inner.ready.pop_front()?;
        delivery.attempt += 1;
        inner.in_flight.insert(delivery.token, delivery.clone());
        Some(delivery)
    }
}

#[async_trait]
impl EventSource for MemoryQueue {
    async fn next(&self) -> Result<Delivery, StoreError> {
        loop {
            if let Some(delivery) = self.pop() {
                return Ok(delivery);
            }
            self.notify.notified().await;
        }
    }

    async fn ack(&self, token: u64) -> Result<(), StoreError> {
        self.inner.lock().in_flight.remove(&token);
        Ok(())
    }

    async fn nack(&self, token: u64) -> Result<(), StoreError> {
        let requeued = {
            let mut inner = self.inner.lock();
            match inner.in_flight.remove(&token) {
                Some(delivery) => {
                    inner.ready.push_back(delivery);
                    true
                }
                None => false,
            }
        };
        if requeued {
            self.notify.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ack_removes_nack_redelivers() {
        let queue = MemoryQueue::new();
        queue.push(b"a".to_vec());

        let first = queue.next().await.unwrap();
        assert_eq!(first.attempt, 1);
        queue.nack(first.token).await.unwrap();

        let again = queue.next().await.unwrap();
        assert_eq!(again.token, first.token);
        assert_eq!(again.attempt, 2);
        queue.ack(again.token).await.unwrap();

        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(b"late".to_vec());

        let delivery = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"late");
    }
}
