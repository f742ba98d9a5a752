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

//! In-process topic broker.
//!
//! Mirrors the subset of AMQP 0-9-1 the session relies on: topic exchanges
//! with `*`/`#` wildcards, bounded queues that drop their oldest message on
//! overflow, per-message TTL and auto-delete on consumer close. Brokers are
//! keyed by name so every connector opening `memory://<name>` in one process
//! shares the same exchanges and queues.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::{KaraboError, Result};
use crate::traits::{Delivery, QueueArguments, Transport, TransportChannel};

lazy_static! {
    static ref BROKERS: DashMap<String, Arc<MemoryBroker>> = DashMap::new();
}

/// Whether `routing_key` matches the AMQP topic `pattern`.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` matches
/// zero or more.
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    pattern: String,
    queue: String,
}

#[derive(Debug)]
struct MemoryQueue {
    name: String,
    items: Mutex<VecDeque<(Instant, Delivery)>>,
    notify: Notify,
    max_length: usize,
    ttl: Duration,
    auto_delete: bool,
    deleted: CancellationToken,
    dropped: AtomicUsize,
}

impl MemoryQueue {
    fn new(name: &str, args: &QueueArguments) -> Self {
        Self {
            name: name.to_string(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            max_length: args.max_length.max(1) as usize,
            ttl: Duration::from_millis(u64::from(args.message_ttl_ms)),
            auto_delete: args.auto_delete,
            deleted: CancellationToken::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    fn push(&self, delivery: Delivery) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.max_length {
                items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            items.push_back((Instant::now(), delivery));
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Delivery> {
        loop {
            {
                let mut items = self.items.lock();
                while let Some((enqueued, delivery)) = items.pop_front() {
                    if self.ttl.is_zero() || enqueued.elapsed() <= self.ttl {
                        return Some(delivery);
                    }
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            tokio::select! {
                () = self.deleted.cancelled() => return None,
                () = self.notify.notified() => {}
            }
        }
    }
}

#[derive(Debug, Default)]
struct MemoryBroker {
    exchanges: DashMap<String, Vec<Binding>>,
    queues: DashMap<String, Arc<MemoryQueue>>,
}

impl MemoryBroker {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MemoryQueue>>> {
        let bindings = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| KaraboError::Transport(format!("no exchange '{exchange}'")))?;
        let mut targets: Vec<Arc<MemoryQueue>> = Vec::new();
        for binding in bindings.iter() {
            if !topic_matches(&binding.pattern, routing_key) {
                continue;
            }
            if targets.iter().any(|q| q.name == binding.queue) {
                continue;
            }
            if let Some(queue) = self.queues.get(&binding.queue) {
                targets.push(queue.clone());
            }
        }
        Ok(targets)
    }

    fn delete_queue(&self, name: &str) {
        if let Some((_, queue)) = self.queues.remove(name) {
            queue.deleted.cancel();
        }
        for mut bindings in self.exchanges.iter_mut() {
            bindings.retain(|b| b.queue != name);
        }
        trace!(queue = name, "Queue deleted");
    }
}

/// Connection to a named in-process broker.
#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
    channels: Mutex<Vec<Weak<MemoryChannel>>>,
}

impl MemoryTransport {
    /// Connects to the broker called `name`, creating it on first use.
    pub fn open(name: &str) -> Self {
        let broker = BROKERS
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryBroker::default()))
            .clone();
        debug!(broker = name, "In-process broker connection opened");
        Self {
            name: name.to_string(),
            broker,
            connected: AtomicBool::new(true),
            channels: Mutex::new(Vec::new()),
        }
    }

    /// Name of the broker this connection talks to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages dropped from `queue` by overflow or expiry.
    pub fn dropped(&self, queue: &str) -> usize {
        self.broker
            .queues
            .get(queue)
            .map_or(0, |q| q.dropped.load(Ordering::Relaxed))
    }

    /// Number of bindings on `exchange`.
    pub fn binding_count(&self, exchange: &str) -> usize {
        self.broker.exchanges.get(exchange).map_or(0, |b| b.len())
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        if !self.is_connected() {
            return Err(KaraboError::NotConnected);
        }
        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
            consumed: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        });
        let mut channels = self.channels.lock();
        channels.retain(|c| c.strong_count() > 0);
        channels.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        Ok(self.broker.queues.contains_key(name))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        let channels: Vec<Arc<MemoryChannel>> =
            self.channels.lock().drain(..).filter_map(|c| c.upgrade()).collect();
        for channel in channels {
            channel.shutdown();
        }
        Ok(())
    }
}

/// Channel on a [`MemoryTransport`].
#[derive(Debug)]
pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
    open: AtomicBool,
    consumed: Mutex<Vec<String>>,
    closed: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(KaraboError::NotConnected)
        }
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.closed.cancel();
            for name in self.consumed.lock().drain(..) {
                let auto_delete = self
                    .broker
                    .queues
                    .get(&name)
                    .is_some_and(|q| q.auto_delete);
                if auto_delete {
                    self.broker.delete_queue(&name);
                }
            }
        }
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.exchanges.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(name, args)));
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.broker.queues.contains_key(queue) {
            return Err(KaraboError::NotFound(format!("queue '{queue}'")));
        }
        let mut bindings = self
            .broker
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| KaraboError::NotFound(format!("exchange '{exchange}'")))?;
        let binding = Binding {
            pattern: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(mut bindings) = self.broker.exchanges.get_mut(exchange) {
            bindings.retain(|b| !(b.queue == queue && b.pattern == routing_key));
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        self.ensure_open()?;
        let targets = self.broker.route(exchange, routing_key)?;
        trace!(exchange, routing_key, queues = targets.len(), "Routing message");
        for queue in targets {
            queue.push(Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, buffer: usize) -> Result<mpsc::Receiver<Delivery>> {
        self.ensure_open()?;
        let source = self
            .broker
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| KaraboError::NotFound(format!("queue '{queue}'")))?;
        self.consumed.lock().push(queue.to_string());
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let closed = self.closed.clone();
        let broker = self.broker.clone();
        tokio::spawn(async move {
            loop {
                let delivery = tokio::select! {
                    () = closed.cancelled() => break,
                    item = source.pop() => match item {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                tokio::select! {
                    () = closed.cancelled() => break,
                    sent = tx.send(delivery) => if sent.is_err() { break },
                }
            }
            if source.auto_delete && !source.deleted.is_cancelled() {
                broker.delete_queue(&source.name);
            }
        });
        Ok(rx)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.delete_queue(name);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_wildcards() {
        assert!(topic_matches("alpha.#", "alpha"));
        assert!(topic_matches("alpha.#", "alpha.sub.deeper"));
        assert!(!topic_matches("alpha.#", "beta"));
        assert!(topic_matches("*.slotInstanceNew", "srv/1.slotInstanceNew"));
        assert!(!topic_matches("*.slotInstanceNew", "slotInstanceNew"));
        assert!(!topic_matches("*.slotInstanceNew", "a.b.slotInstanceNew"));
        assert!(topic_matches("#.signalChanged", "dev.signalChanged"));
        assert!(topic_matches("exact", "exact"));
        assert!(!topic_matches("exact", "exact.more"));
    }

    #[tokio::test]
    async fn bounded_queue_drops_oldest() {
        let transport = MemoryTransport::open("memory-unit-drop-head");
        let channel = transport.open_channel().await.unwrap();
        channel.declare_exchange("ex").await.unwrap();
        let args = QueueArguments {
            max_length: 2,
            ..QueueArguments::default()
        };
        channel.declare_queue("q", &args).await.unwrap();
        channel.bind("q", "ex", "k.#").await.unwrap();
        for i in 0..3u8 {
            channel.publish("ex", "k", vec![i]).await.unwrap();
        }
        assert_eq!(transport.dropped("q"), 1);
        let mut rx = channel.consume("q", 8).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);
    }

    #[tokio::test]
    async fn closing_a_channel_removes_auto_delete_queues() {
        let transport = MemoryTransport::open("memory-unit-auto-delete");
        let channel = transport.open_channel().await.unwrap();
        channel.declare_exchange("ex").await.unwrap();
        channel
            .declare_queue("q", &QueueArguments::default())
            .await
            .unwrap();
        channel.bind("q", "ex", "q").await.unwrap();
        let _rx = channel.consume("q", 8).await.unwrap();
        assert!(transport.queue_exists("q").await.unwrap());
        channel.close().await.unwrap();
        assert!(!transport.queue_exists("q").await.unwrap());
        assert_eq!(transport.binding_count("ex"), 0);
    }
}
