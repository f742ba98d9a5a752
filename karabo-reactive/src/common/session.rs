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

//! Per-instance broker session.
//!
//! A session owns one channel, the instance queue and its bindings. It turns
//! slot calls, broadcasts, signals, heartbeats and replies into publishes,
//! correlates replies with pending requests and hands every other inbound
//! message to the instance through [`InboundHandler`].

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::common::config::KaraboConfig;
use crate::common::subscriptions::SubscriptionTable;
use crate::common::{Connector, KaraboError, Result};
use crate::hash::{Hash, HashValue};
use crate::message::{
    call_header, reply_header, signal_header, Message, Reply, SlotTargets, BROADCAST_TARGET,
};
use crate::signalslot::{oneshot, OneShotSender};
use crate::traits::{Delivery, QueueArguments, TransportChannel};

/// Slots that may be addressed through the broadcast exchange.
pub const BROADCAST_SLOTS: [&str; 4] = [
    "slotInstanceNew",
    "slotInstanceGone",
    "slotInstanceUpdated",
    "slotDiscover",
];

/// Signal carrying heartbeats.
pub const HEARTBEAT_SIGNAL: &str = "signalHeartbeat";

lazy_static! {
    static ref MONOTONIC_EPOCH: Instant = Instant::now();
}
static LAST_MONOTONIC: AtomicU64 = AtomicU64::new(0);

/// Lowercase hex of a strictly increasing monotonic nanosecond clock.
pub(crate) fn monotonic_hex() -> String {
    let now = u64::try_from(MONOTONIC_EPOCH.elapsed().as_nanos()).unwrap_or(u64::MAX);
    let mut last = LAST_MONOTONIC.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MONOTONIC.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return format!("{next:x}"),
            Err(current) => last = current,
        }
    }
}

/// How an inbound message reached the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Addressed to this instance.
    Direct,
    /// Sent to every instance through the broadcast exchange.
    Broadcast,
    /// A signal this instance connected local slots to.
    Signal,
}

/// Receiver of decoded inbound messages.
///
/// Called from the consumer task; implementations hand work off to their
/// own tasks and return quickly.
pub trait InboundHandler: Send + Sync + 'static {
    /// A call, broadcast or signal naming `slots`.
    fn dispatch(&self, message: Message, slots: Vec<String>, kind: InboundKind);

    /// A heartbeat from `instance_id`.
    fn heartbeat(&self, _instance_id: String, _info: Hash) {}
}

/// Message statistics of a session.
#[derive(Debug, Default)]
pub struct SessionStats {
    /// Messages published.
    published: AtomicUsize,
    /// Messages taken off the queues.
    received: AtomicUsize,
    /// Messages that could not be decoded.
    malformed: AtomicUsize,
    /// Replies that arrived after their request was gone.
    late_replies: AtomicUsize,
}

impl SessionStats {
    /// Get the number of messages published.
    #[must_use]
    pub fn published(&self) -> usize {
        self.published.load(Ordering::Relaxed)
    }

    /// Get the number of messages received.
    #[must_use]
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    /// Get the number of malformed messages.
    #[must_use]
    pub fn malformed(&self) -> usize {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Get the number of discarded late replies.
    #[must_use]
    pub fn late_replies(&self) -> usize {
        self.late_replies.load(Ordering::Relaxed)
    }
}

/// Removes a pending request when its waiter goes away.
struct PendingGuard<'a> {
    repliers: &'a DashMap<String, OneShotSender<Message>>,
    token: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.repliers.remove(&self.token);
    }
}

/// Broker session of one instance.
pub struct BrokerSession {
    connector: Arc<Connector>,
    domain: String,
    instance_id: String,
    class_id: String,
    hostname: String,
    broadcast: bool,
    queue_args: QueueArguments,
    delivery_buffer: usize,
    channel: RwLock<Option<Arc<dyn TransportChannel>>>,
    queue: RwLock<String>,
    beats_queue: RwLock<Option<String>>,
    repliers: DashMap<String, OneShotSender<Message>>,
    subscribe_lock: Mutex<()>,
    table: RwLock<SubscriptionTable>,
    stopped: CancellationToken,
    stats: SessionStats,
}

impl std::fmt::Debug for BrokerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSession")
            .field("instance_id", &self.instance_id)
            .field("queue", &*self.queue.read())
            .field("pending_requests", &self.repliers.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl BrokerSession {
    /// Opens a channel and declares exchanges, the instance queue and its
    /// default bindings.
    ///
    /// If `<domain>.<instance_id>` is already taken, a monotonic hex suffix
    /// is appended so both holders stay reachable.
    #[instrument(skip(connector, config), fields(domain = %connector.topic()))]
    pub async fn open(
        connector: Arc<Connector>,
        instance_id: &str,
        class_id: &str,
        broadcast: bool,
        config: &KaraboConfig,
    ) -> Result<Arc<Self>> {
        let transport = connector.connection().await?;
        let domain = connector.topic().to_string();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let queue_args = QueueArguments {
            max_length: config.broker.queue_max_length,
            overflow: config.broker.queue_overflow.clone(),
            message_ttl_ms: config.broker.message_ttl_ms,
            auto_delete: true,
        };

        let mut queue = format!("{domain}.{instance_id}");
        if transport.queue_exists(&queue).await? {
            queue = format!("{queue}:{}", monotonic_hex());
            debug!(queue = %queue, "Queue name taken, using suffixed name");
        }

        let channel = transport.open_channel().await?;
        for suffix in ["slots", "global_slots", "signals"] {
            channel.declare_exchange(&format!("{domain}.{suffix}")).await?;
        }
        channel.declare_queue(&queue, &queue_args).await?;

        let session = Arc::new(Self {
            connector,
            domain,
            instance_id: instance_id.to_string(),
            class_id: class_id.to_string(),
            hostname,
            broadcast,
            queue_args,
            delivery_buffer: config.broker.delivery_buffer,
            channel: RwLock::new(Some(channel)),
            queue: RwLock::new(queue),
            beats_queue: RwLock::new(None),
            repliers: DashMap::new(),
            subscribe_lock: Mutex::new(()),
            table: RwLock::new(SubscriptionTable::default()),
            stopped: CancellationToken::new(),
            stats: SessionStats::default(),
        });

        let slots = session.exchange("slots");
        session
            .bind(&slots, &format!("{instance_id}.#"))
            .await?;
        if broadcast {
            let global = session.exchange("global_slots");
            for slot in BROADCAST_SLOTS {
                session.bind(&global, &format!("*.{slot}")).await?;
            }
        }
        debug!(instance_id, queue = %session.queue_name(), "Broker session open");
        Ok(session)
    }

    fn exchange(&self, suffix: &str) -> String {
        format!("{}.{suffix}", self.domain)
    }

    fn channel(&self) -> Result<Arc<dyn TransportChannel>> {
        match self.channel.read().as_ref() {
            Some(channel) if channel.is_open() => Ok(channel.clone()),
            _ => Err(KaraboError::NotConnected),
        }
    }

    async fn bind(&self, exchange: &str, key: &str) -> Result<()> {
        let _guard = self.subscribe_lock.lock().await;
        if self.table.read().has_binding(exchange, key) {
            return Ok(());
        }
        self.channel()?
            .bind(&self.queue_name(), exchange, key)
            .await?;
        self.table.write().add_binding(exchange, key);
        Ok(())
    }

    /// The instance this session belongs to.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The broker topic.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Host the session runs on.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Name of the declared instance queue.
    pub fn queue_name(&self) -> String {
        self.queue.read().clone()
    }

    /// Whether the session receives broadcasts.
    pub fn accepts_broadcasts(&self) -> bool {
        self.broadcast
    }

    /// The connector this session was opened through.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    /// Whether the session is closed.
    pub fn is_closed(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Returns a reference to the message statistics.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Number of bindings held by the instance queue and the beats queue.
    pub fn binding_count(&self) -> usize {
        self.table.read().binding_count()
    }

    /// Number of requests waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.repliers.len()
    }

    async fn publish(&self, exchange: &str, key: &str, mut message: Message) -> Result<()> {
        message.stamp(&self.instance_id);
        let channel = self.channel()?;
        channel.publish(exchange, key, message.encode()).await?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        trace!(exchange, key, "Published");
        Ok(())
    }

    /// Sends to the slots named in `targets`, optionally asking for a reply.
    pub async fn call_targets(
        &self,
        targets: &SlotTargets,
        reply_to: Option<&str>,
        args: Vec<HashValue>,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let mut header = call_header(targets, &self.hostname, &self.class_id);
        if let Some(token) = reply_to {
            header.set("replyTo", token);
        }
        let exchange = self.exchange("slots");
        for target in targets.instance_ids() {
            self.publish(&exchange, target, Message::new(header.clone(), args.clone()))
                .await?;
        }
        Ok(())
    }

    /// Fire-and-forget slot call.
    pub async fn call(&self, target: &str, slot: &str, args: Vec<HashValue>) -> Result<()> {
        self.call_targets(&SlotTargets::single(target, &[slot]), None, args)
            .await
    }

    /// Calls `slot` on every instance listening to broadcasts.
    pub async fn broadcast(&self, slot: &str, args: Vec<HashValue>) -> Result<()> {
        if !BROADCAST_SLOTS.contains(&slot) {
            return Err(KaraboError::NotBroadcastable(slot.to_string()));
        }
        let targets = SlotTargets::single(BROADCAST_TARGET, &[slot]);
        let header = call_header(&targets, &self.hostname, &self.class_id);
        let key = format!("{}.{slot}", self.instance_id);
        self.publish(&self.exchange("global_slots"), &key, Message::new(header, args))
            .await
    }

    /// Emits a signal of this instance.
    pub async fn emit(&self, signal: &str, args: Vec<HashValue>) -> Result<()> {
        let header = signal_header(signal, &self.hostname, &self.class_id);
        let key = format!("{}.{signal}", self.instance_id);
        self.publish(&self.exchange("signals"), &key, Message::new(header, args))
            .await
    }

    /// Publishes one heartbeat carrying `info`.
    pub async fn heartbeat(&self, info: Hash) -> Result<()> {
        let header = Hash::new().with("signalFunction", HEARTBEAT_SIGNAL);
        let key = format!("{}.{HEARTBEAT_SIGNAL}", self.instance_id);
        let args = vec![HashValue::from(&self.instance_id), HashValue::Hash(info)];
        self.publish(&self.exchange("signals"), &key, Message::new(header, args))
            .await
    }

    /// Calls `slot` on `target` and waits for the reply.
    ///
    /// The wait has no deadline of its own; callers bound it with
    /// [`request_with_timeout`](Self::request_with_timeout).
    #[instrument(level = "debug", skip(self, args), fields(from = %self.instance_id))]
    pub async fn request(&self, target: &str, slot: &str, args: Vec<HashValue>) -> Result<Reply> {
        let token = format!("{}-{}", self.instance_id, monotonic_hex());
        let (tx, rx) = oneshot::<Message>();
        self.repliers.insert(token.clone(), tx);
        let _pending = PendingGuard {
            repliers: &self.repliers,
            token: token.clone(),
        };
        self.call_targets(&SlotTargets::single(target, &[slot]), Some(&token), args)
            .await?;
        let message = rx.wait().await?;
        Reply::from_message(&message)
    }

    /// [`request`](Self::request) bounded by `timeout`.
    pub async fn request_with_timeout(
        &self,
        target: &str,
        slot: &str,
        args: Vec<HashValue>,
        timeout: Duration,
    ) -> Result<Reply> {
        tokio::time::timeout(timeout, self.request(target, slot, args))
            .await
            .map_err(|_| KaraboError::Timeout(format!("reply of {target}.{slot}")))?
    }

    /// Replies to `message` with `values`. No-op if no reply was asked for.
    pub async fn reply(&self, message: &Message, values: Vec<HashValue>) -> Result<()> {
        self.send_reply(message, values, false).await
    }

    /// Replies to `message` with an error.
    pub async fn reply_error(&self, message: &Message, text: &str, details: &str) -> Result<()> {
        let values = vec![HashValue::from(text), HashValue::from(details)];
        self.send_reply(message, values, true).await
    }

    async fn send_reply(&self, message: &Message, values: Vec<HashValue>, error: bool) -> Result<()> {
        let Some(token) = message.reply_to() else {
            return Ok(());
        };
        let sender = message.sender();
        let header = reply_header(token, sender, error);
        self.publish(&self.exchange("slots"), sender, Message::new(header, values))
            .await
    }

    /// Routes `signal` of `peer` to the local `slot`. Idempotent.
    pub async fn connect(&self, peer: &str, signal: &str, slot: &str) -> Result<()> {
        let exchange = self.exchange("signals");
        let key = format!("{peer}.{signal}");
        let _guard = self.subscribe_lock.lock().await;
        if !self.table.read().has_binding(&exchange, &key) {
            self.channel()?
                .bind(&self.queue_name(), &exchange, &key)
                .await?;
            self.table.write().add_binding(&exchange, &key);
        }
        self.table.write().connect(peer, signal, slot);
        trace!(peer, signal, slot, "Connected");
        Ok(())
    }

    /// Undoes [`connect`](Self::connect). The binding goes once no local
    /// slot is left for the signal.
    pub async fn disconnect(&self, peer: &str, signal: &str, slot: &str) -> Result<()> {
        let exchange = self.exchange("signals");
        let key = format!("{peer}.{signal}");
        let _guard = self.subscribe_lock.lock().await;
        let empty = self.table.write().disconnect(peer, signal, slot);
        if empty && self.table.write().remove_binding(&exchange, &key) {
            self.channel()?
                .unbind(&self.queue_name(), &exchange, &key)
                .await?;
        }
        trace!(peer, signal, slot, "Disconnected");
        Ok(())
    }

    /// Removes every binding this session made.
    pub async fn unsubscribe_all(&self) -> Result<()> {
        let _guard = self.subscribe_lock.lock().await;
        let bindings = self.table.write().drain();
        let Ok(channel) = self.channel() else {
            return Ok(());
        };
        let main = self.queue_name();
        let beats = self.beats_queue.read().clone();
        for (exchange, key) in bindings {
            let queue = match &beats {
                Some(beats) if key.ends_with(HEARTBEAT_SIGNAL) && key.starts_with('*') => beats.clone(),
                _ => main.clone(),
            };
            if let Err(e) = channel.unbind(&queue, &exchange, &key).await {
                debug!(exchange = %exchange, key = %key, error = %e, "Unbind failed");
            }
        }
        Ok(())
    }

    /// Starts the consumer of the instance queue.
    pub async fn consume(self: &Arc<Self>, handler: Weak<dyn InboundHandler>) -> Result<()> {
        let rx = self
            .channel()?
            .consume(&self.queue_name(), self.delivery_buffer)
            .await?;
        let session = self.clone();
        tokio::spawn(async move { session.consume_loop(rx, handler).await });
        Ok(())
    }

    async fn consume_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Delivery>, handler: Weak<dyn InboundHandler>) {
        loop {
            let delivery = tokio::select! {
                biased;
                () = self.stopped.cancelled() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break,
                },
            };
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            let Some(handler) = handler.upgrade() else {
                break;
            };
            self.route(delivery, handler.as_ref());
        }
        trace!(instance_id = %self.instance_id, "Consumer stopped");
    }

    fn route(&self, delivery: Delivery, handler: &dyn InboundHandler) {
        let message = match Message::decode(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                error!(instance_id = %self.instance_id, error = %e, "Malformed message");
                return;
            }
        };

        if let Some(token) = message.reply_from() {
            match self.repliers.remove(token) {
                Some((_, waiter)) => {
                    waiter.deliver(message);
                }
                None => {
                    self.stats.late_replies.fetch_add(1, Ordering::Relaxed);
                }
            }
            return;
        }

        if delivery.exchange == self.exchange("signals") {
            let signal = message.signal_function().unwrap_or_default();
            let slots = self.table.read().slots_for(message.sender(), signal);
            if !slots.is_empty() {
                handler.dispatch(message, slots, InboundKind::Signal);
            }
            return;
        }

        let targets = match message
            .header
            .get_str("slotFunctions")
            .map(SlotTargets::parse)
        {
            Some(Ok(targets)) => targets,
            Some(Err(e)) => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                error!(instance_id = %self.instance_id, error = %e, "Malformed message");
                return;
            }
            None => {
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                error!(instance_id = %self.instance_id, "Malformed message: no slotFunctions");
                return;
            }
        };

        let direct = targets.slots_for(&self.instance_id).to_vec();
        let broadcast = if self.broadcast {
            targets.slots_for(BROADCAST_TARGET).to_vec()
        } else {
            Vec::new()
        };
        if !direct.is_empty() {
            handler.dispatch(message.clone(), direct, InboundKind::Direct);
        }
        if !broadcast.is_empty() {
            handler.dispatch(message, broadcast, InboundKind::Broadcast);
        }
    }

    /// Declares the beats queue, binds it to every heartbeat and feeds the
    /// beats to `handler`.
    pub async fn consume_beats(self: &Arc<Self>, handler: Weak<dyn InboundHandler>) -> Result<()> {
        let channel = self.channel()?;
        let queue = format!("{}:beats", self.queue_name());
        channel.declare_queue(&queue, &self.queue_args).await?;
        let rx = channel.consume(&queue, self.delivery_buffer).await?;
        let exchange = self.exchange("signals");
        let key = format!("*.{HEARTBEAT_SIGNAL}");
        channel.bind(&queue, &exchange, &key).await?;
        {
            let _guard = self.subscribe_lock.lock().await;
            self.table.write().add_binding(&exchange, &key);
        }
        *self.beats_queue.write() = Some(queue);

        let session = self.clone();
        tokio::spawn(async move {
            let mut rx = rx;
            loop {
                let delivery = tokio::select! {
                    biased;
                    () = session.stopped.cancelled() => break,
                    delivery = rx.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break,
                    },
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                match Message::decode(&delivery.payload) {
                    Ok(message) => {
                        let id = message.arg(0).and_then(HashValue::as_str).map(str::to_string);
                        let info = message.arg(1).and_then(HashValue::as_hash).cloned();
                        match (id, info) {
                            (Some(id), Some(info)) => handler.heartbeat(id, info),
                            _ => warn!("Heartbeat without id or info"),
                        }
                    }
                    Err(e) => {
                        session.stats.malformed.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "Malformed heartbeat message");
                    }
                }
            }
        });
        Ok(())
    }

    /// Cancels every pending request.
    pub fn cancel_pending(&self) {
        self.repliers.clear();
    }

    /// Stops consumers, fails pending requests and closes the channel.
    /// The auto-delete queues go with it.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn close(&self) -> Result<()> {
        self.stopped.cancel();
        self.cancel_pending();
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            channel.close().await?;
        }
        debug!("Broker session closed");
        Ok(())
    }
}
