/*
 * Copyright (c) 2024. Govcraft
 *
 * Licensed under either of
 *   * Apache License, Version 2.0 (the "License");
 *     you may not use this file except in compliance with the License.
 *     You may obtain a copy of the License at http://www.apache.org/licenses/LICENSE-2.0
 *   * MIT license: http://opensource.org/licenses/MIT
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the applicable License for the specific language governing permissions and
 * limitations under that License.
 */

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::common::{KaraboError, Result};

/// Bounded FIFO between a producer and the serving task of a connection.
///
/// A ring queue never refuses an item: when full it drops the oldest one.
/// Cancelling wakes every waiter with [`KaraboError::Cancelled`].
#[derive(Debug)]
pub(crate) struct ChunkQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    ring: bool,
    not_empty: Notify,
    not_full: Notify,
    cancelled: CancellationToken,
    dropped: AtomicUsize,
}

impl<T> ChunkQueue<T> {
    pub(crate) fn bounded(capacity: usize) -> Self {
        Self::with_mode(capacity, false)
    }

    pub(crate) fn ring(capacity: usize) -> Self {
        Self::with_mode(capacity, true)
    }

    fn with_mode(capacity: usize, ring: bool) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            ring,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            cancelled: CancellationToken::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub(crate) fn is_full(&self) -> bool {
        !self.ring && self.len() >= self.capacity
    }

    /// Items lost to ring overflow or refused by a full queue.
    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Adds `item` without waiting; `false` if it was refused.
    pub(crate) fn try_put(&self, item: T) -> bool {
        if self.cancelled.is_cancelled() {
            return false;
        }
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                if !self.ring {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back(item);
        }
        self.not_empty.notify_one();
        true
    }

    /// Adds `item`, waiting for room.
    pub(crate) async fn put(&self, item: T) -> Result<()> {
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cancelled.is_cancelled() {
                return Err(KaraboError::Cancelled);
            }
            {
                let mut items = self.items.lock();
                if self.ring || items.len() < self.capacity {
                    if items.len() >= self.capacity {
                        items.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(item) = item.take() {
                        items.push_back(item);
                    }
                    drop(items);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            tokio::select! {
                () = self.cancelled.cancelled() => return Err(KaraboError::Cancelled),
                () = &mut notified => {}
            }
        }
    }

    /// Takes the oldest item, waiting for one.
    pub(crate) async fn get(&self) -> Result<T> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.cancelled.is_cancelled() {
                return Err(KaraboError::Cancelled);
            }
            let next = self.items.lock().pop_front();
            if let Some(item) = next {
                self.not_full.notify_one();
                if self.len() > 0 {
                    self.not_empty.notify_one();
                }
                return Ok(item);
            }
            tokio::select! {
                () = self.cancelled.cancelled() => return Err(KaraboError::Cancelled),
                () = &mut notified => {}
            }
        }
    }

    /// Discards queued items and wakes blocked producers.
    pub(crate) fn clear(&self) {
        let discarded = {
            let mut items = self.items.lock();
            let n = items.len();
            items.clear();
            n
        };
        self.dropped.fetch_add(discarded, Ordering::Relaxed);
        self.not_full.notify_waiters();
    }

    /// Wakes all waiters with an error and refuses further items.
    pub(crate) fn cancel(&self) {
        self.cancelled.cancel();
        self.items.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn ring_keeps_newest() {
        let queue = ChunkQueue::ring(2);
        assert!(queue.try_put(1));
        assert!(queue.try_put(2));
        assert!(queue.try_put(3));
        assert!(!queue.is_full());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn bounded_refuses_when_full() {
        let queue = ChunkQueue::bounded(1);
        assert!(queue.try_put("a"));
        assert!(queue.is_full());
        assert!(!queue.try_put("b"));
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test]
    async fn put_waits_for_room() {
        let queue = Arc::new(ChunkQueue::bounded(1));
        queue.put(1).await.unwrap();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.put(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(queue.get().await.unwrap(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(queue.get().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_releases_waiters() {
        let queue: Arc<ChunkQueue<u8>> = Arc::new(ChunkQueue::bounded(1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.cancel();
        assert_eq!(consumer.await.unwrap(), Err(KaraboError::Cancelled));
        assert!(!queue.try_put(1));
    }
}
