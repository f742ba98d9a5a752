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

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::common::{HashCallback, KaraboError, Result};
use crate::hash::{Hash, HashValue, Schema, Timestamp};
use crate::message::Reply;
use crate::signalslot::{SignalSlotable, WeakInstance};

use super::registry::Feed;

pub(crate) const CHANGED_SIGNAL: &str = "signalChanged";
pub(crate) const CHANGED_SLOT: &str = "slotChanged";
pub(crate) const SCHEMA_SIGNAL: &str = "signalSchemaUpdated";
pub(crate) const SCHEMA_SLOT: &str = "slotSchemaUpdated";

pub(crate) struct ProxyInner {
    pub(crate) instance_id: String,
    owner: WeakInstance,
    schema: RwLock<Schema>,
    values: RwLock<Hash>,
    server_id: RwLock<Option<String>>,
    use_count: AtomicUsize,
    subscribed: AtomicBool,
    resubscribing: AtomicBool,
    alive: AtomicBool,
    outgoing: Mutex<Hash>,
    flush_scheduled: AtomicBool,
    // Held from taking a batch until its ack, so batches arrive in order.
    flush_lock: tokio::sync::Mutex<()>,
    subscribe_lock: tokio::sync::Mutex<()>,
    death: RwLock<CancellationToken>,
    watchers: DashMap<String, Vec<HashCallback>>,
    changes: broadcast::Sender<Hash>,
    last_used: Mutex<Instant>,
    auto_disconnect: Option<Duration>,
    request_timeout: Duration,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let id = self.instance_id.clone();
        let subscribed = self.subscribed.load(Ordering::Acquire);
        runtime.spawn(async move {
            if subscribed {
                let _ = owner.release_feed(&id, Feed::Changes).await;
            }
            let _ = owner.release_feed(&id, Feed::Schema).await;
            trace!(id = %id, "Proxy released");
        });
    }
}

/// Local shadow of a remote instance.
///
/// Holds the peer's schema and its last known values. While at least one
/// [`ProxyUse`] is alive the proxy is subscribed to the peer's
/// `signalChanged` and its values follow the peer. Writes are batched into
/// one `slotReconfigure` per flush; [`update`](Self::update) waits until the
/// peer acknowledged them.
#[derive(Clone)]
pub struct Proxy(pub(crate) Arc<ProxyInner>);

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("instance_id", &self.0.instance_id)
            .field("alive", &self.is_alive())
            .field("use_count", &self.use_count())
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub(crate) fn new(
        owner: &SignalSlotable,
        instance_id: &str,
        schema: Schema,
        values: Hash,
        auto_disconnect: Option<Duration>,
    ) -> Self {
        let server_id = values
            .get_str("serverId")
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let (changes, _) = broadcast::channel(64);
        Self(Arc::new(ProxyInner {
            instance_id: instance_id.to_string(),
            owner: owner.downgrade(),
            schema: RwLock::new(schema),
            values: RwLock::new(values),
            server_id: RwLock::new(server_id),
            use_count: AtomicUsize::new(0),
            subscribed: AtomicBool::new(false),
            resubscribing: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            outgoing: Mutex::new(Hash::new()),
            flush_scheduled: AtomicBool::new(false),
            flush_lock: tokio::sync::Mutex::new(()),
            subscribe_lock: tokio::sync::Mutex::new(()),
            death: RwLock::new(CancellationToken::new()),
            watchers: DashMap::new(),
            changes,
            last_used: Mutex::new(Instant::now()),
            auto_disconnect,
            request_timeout: owner.config().timeouts.request(),
        }))
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Arc::downgrade(&self.0)
    }

    fn owner(&self) -> Result<SignalSlotable> {
        self.0.owner.upgrade().ok_or(KaraboError::NotConnected)
    }

    fn died(&self) -> KaraboError {
        KaraboError::DeviceDied(self.0.instance_id.clone())
    }

    /// Id of the remote instance.
    pub fn instance_id(&self) -> &str {
        &self.0.instance_id
    }

    /// Server hosting the remote instance, if it reported one.
    pub fn server_id(&self) -> Option<String> {
        self.0.server_id.read().clone()
    }

    /// Whether the peer is believed to be up.
    pub fn is_alive(&self) -> bool {
        self.0.alive.load(Ordering::Acquire)
    }

    /// Number of open [`ProxyUse`] scopes.
    pub fn use_count(&self) -> usize {
        self.0.use_count.load(Ordering::Acquire)
    }

    /// Whether the proxy currently receives `signalChanged`.
    pub fn is_subscribed(&self) -> bool {
        self.0.subscribed.load(Ordering::Acquire)
    }

    /// Copy of the peer's schema.
    pub fn schema(&self) -> Schema {
        self.0.schema.read().clone()
    }

    /// Copy of the cached configuration.
    pub fn configuration(&self) -> Hash {
        self.touch();
        self.0.values.read().clone()
    }

    /// Last known value of `path`; `None` if the peer never reported it.
    pub fn get(&self, path: &str) -> Option<HashValue> {
        self.touch();
        self.0.values.read().get(path).cloned()
    }

    /// Timestamp of the last known value of `path`.
    pub fn timestamp(&self, path: &str) -> Option<Timestamp> {
        self.0
            .values
            .read()
            .get_attributes(path)
            .and_then(Timestamp::from_attributes)
    }

    fn touch(&self) {
        *self.0.last_used.lock() = Instant::now();
        if self.0.auto_disconnect.is_none() || self.is_subscribed() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        // One resubscription in flight at a time.
        if self.0.resubscribing.swap(true, Ordering::AcqRel) {
            return;
        }
        let proxy = self.clone();
        runtime.spawn(async move {
            if let Err(e) = proxy.subscribe().await {
                debug!(id = %proxy.0.instance_id, error = %e, "Resubscription failed");
            }
            proxy.0.resubscribing.store(false, Ordering::Release);
        });
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.0.last_used.lock().elapsed()
    }

    /// Opens a usage scope; the first one subscribes to the peer's changes.
    pub async fn enter(&self) -> Result<ProxyUse> {
        self.touch();
        if self.0.use_count.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(e) = self.subscribe().await {
                self.0.use_count.fetch_sub(1, Ordering::AcqRel);
                return Err(e);
            }
        }
        Ok(ProxyUse {
            proxy: self.clone(),
        })
    }

    pub(crate) async fn subscribe(&self) -> Result<()> {
        let owner = self.owner()?;
        {
            let _guard = self.0.subscribe_lock.lock().await;
            if self.is_subscribed() {
                return Ok(());
            }
            owner.acquire_feed(&self.0.instance_id, Feed::Changes).await?;
            self.0.subscribed.store(true, Ordering::Release);
        }
        trace!(id = %self.0.instance_id, "Subscribed to changes");
        if self.is_alive() {
            self.refresh_configuration(&owner).await?;
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe(&self) -> Result<()> {
        let _guard = self.0.subscribe_lock.lock().await;
        if !self.is_subscribed() {
            return Ok(());
        }
        let owner = self.owner()?;
        self.0.subscribed.store(false, Ordering::Release);
        owner.release_feed(&self.0.instance_id, Feed::Changes).await?;
        trace!(id = %self.0.instance_id, "Unsubscribed from changes");
        Ok(())
    }

    fn release(&self) {
        if self.0.use_count.fetch_sub(1, Ordering::AcqRel) != 1 || self.0.auto_disconnect.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let proxy = self.clone();
        runtime.spawn(async move {
            if proxy.use_count() == 0 {
                if let Err(e) = proxy.unsubscribe().await {
                    debug!(id = %proxy.0.instance_id, error = %e, "Unsubscribe failed");
                }
            }
        });
    }

    async fn refresh_configuration(&self, owner: &SignalSlotable) -> Result<()> {
        let reply = owner
            .request_with_timeout(
                &self.0.instance_id,
                "slotGetConfiguration",
                Vec::new(),
                self.0.request_timeout,
            )
            .await?;
        let configuration = reply
            .hash(0)
            .cloned()
            .ok_or_else(|| KaraboError::Protocol("slotGetConfiguration reply without Hash".into()))?;
        self.apply_changes(&configuration);
        Ok(())
    }

    /// Runs `fut` unless the peer dies first.
    async fn guarded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let death = self.0.death.read().clone();
        if death.is_cancelled() || !self.is_alive() {
            return Err(self.died());
        }
        tokio::select! {
            biased;
            () = death.cancelled() => Err(self.died()),
            result = fut => result,
        }
    }

    /// Stages a property write; it goes out with the next flush.
    pub fn set(&self, path: &str, value: impl Into<HashValue>) -> Result<()> {
        self.touch();
        if !self.is_alive() {
            return Err(self.died());
        }
        self.0.outgoing.lock().set(path, value);
        if !self.0.flush_scheduled.swap(true, Ordering::AcqRel) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let proxy = self.clone();
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    if let Err(e) = proxy.update().await {
                        warn!(id = %proxy.0.instance_id, error = %e, "Writing to proxy failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Sends every staged write and waits until the peer acknowledged them.
    ///
    /// Batches of one proxy go out one at a time: a caller arriving while a
    /// batch is in flight waits for its ack before sending its own.
    pub async fn update(&self) -> Result<()> {
        let _flush = self.0.flush_lock.lock().await;
        self.0.flush_scheduled.store(false, Ordering::Release);
        let batch = std::mem::take(&mut *self.0.outgoing.lock());
        if batch.is_empty() {
            return Ok(());
        }
        let owner = self.owner()?;
        let timeout = self.0.request_timeout;
        let id = self.0.instance_id.clone();
        self.guarded(owner.request_with_timeout(
            &id,
            "slotReconfigure",
            vec![HashValue::Hash(batch)],
            timeout,
        ))
        .await?;
        Ok(())
    }

    /// Calls a slot of the peer after flushing staged writes.
    pub async fn call(&self, slot: &str, args: Vec<HashValue>) -> Result<Reply> {
        self.call_with_timeout(slot, args, self.0.request_timeout).await
    }

    /// [`call`](Self::call) with an explicit deadline.
    pub async fn call_with_timeout(&self, slot: &str, args: Vec<HashValue>, timeout: Duration) -> Result<Reply> {
        self.touch();
        self.update().await?;
        let owner = self.owner()?;
        let id = self.0.instance_id.clone();
        self.guarded(owner.request_with_timeout(&id, slot, args, timeout))
            .await
    }

    /// Calls `callback` with a Hash holding `path` whenever it changes.
    pub fn watch(&self, path: &str, callback: HashCallback) {
        self.0
            .watchers
            .entry(path.to_string())
            .or_default()
            .push(callback);
    }

    /// Stream of change Hashes as they arrive.
    pub fn changes(&self) -> broadcast::Receiver<Hash> {
        self.0.changes.subscribe()
    }

    /// Waits until `predicate` holds for the cached configuration.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Result<()>
    where
        F: Fn(&Hash) -> bool,
    {
        let mut changes = self.changes();
        let wait = async {
            loop {
                if predicate(&self.0.values.read()) {
                    return Ok(());
                }
                match changes.recv().await {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(KaraboError::Cancelled),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| KaraboError::Timeout(format!("condition on {}", self.0.instance_id)))?
    }

    /// Merges `changes` into the cache and notifies watchers.
    pub(crate) fn apply_changes(&self, changes: &Hash) {
        {
            let mut values = self.0.values.write();
            for path in changes.paths() {
                if let Some(node) = changes.get_node(&path) {
                    values.set_node(&path, node.clone());
                }
            }
        }
        if let Some(server_id) = changes.get_str("serverId").filter(|s| !s.is_empty()) {
            *self.0.server_id.write() = Some(server_id.to_string());
        }
        self.notify(changes);
    }

    fn notify(&self, changes: &Hash) {
        let _ = self.0.changes.send(changes.clone());
        if self.0.watchers.is_empty() {
            return;
        }
        let owner = self.0.owner.upgrade();
        for path in changes.paths() {
            let Some(callbacks) = self.0.watchers.get(&path).map(|w| w.value().clone()) else {
                continue;
            };
            let slice = changes.slice(std::slice::from_ref(&path));
            for callback in callbacks {
                let fut = callback(slice.clone());
                let id = self.0.instance_id.clone();
                let task = async move {
                    if let Err(e) = fut.await {
                        warn!(id = %id, error = %format!("{e:#}"), "Proxy watcher failed");
                    }
                };
                match &owner {
                    Some(owner) => {
                        owner.tasks().spawn(task);
                    }
                    None => {
                        tokio::spawn(task);
                    }
                }
            }
        }
    }

    /// The peer left: pending calls fail, `state` becomes `UNKNOWN`.
    pub(crate) fn mark_gone(&self) {
        if !self.0.alive.swap(false, Ordering::AcqRel) {
            return;
        }
        self.0.death.read().cancel();
        *self.0.outgoing.lock() = Hash::new();
        let mut unknown = Hash::new();
        unknown.set_element("state", "UNKNOWN", Timestamp::now().to_attributes());
        self.apply_changes(&unknown);
        debug!(id = %self.0.instance_id, "Proxy peer gone");
    }

    /// The peer came (back) up: refetch everything and resubscribe.
    pub(crate) async fn revive(&self, owner: &SignalSlotable) -> Result<()> {
        let reply = owner
            .request_with_timeout(
                &self.0.instance_id,
                "slotGetSchema",
                vec![HashValue::Bool(false)],
                owner.config().timeouts.schema(),
            )
            .await?;
        if let Some(schema) = reply.get(0).and_then(HashValue::as_schema) {
            self.replace_schema(schema);
        }
        *self.0.death.write() = CancellationToken::new();
        owner.rebind_feeds(&self.0.instance_id).await?;
        self.refresh_configuration(owner).await?;
        self.0.alive.store(true, Ordering::Release);
        debug!(id = %self.0.instance_id, "Proxy peer back");
        Ok(())
    }

    /// Swaps in a new schema, keeping cached values of paths that remain.
    pub(crate) fn replace_schema(&self, schema: &Schema) {
        let leaves = schema.leaves();
        {
            let mut values = self.0.values.write();
            let stale: Vec<String> = values
                .paths()
                .into_iter()
                .filter(|p| !leaves.contains(p))
                .collect();
            for path in stale {
                values.remove(&path);
            }
        }
        *self.0.schema.write() = schema.clone();
    }
}

/// Usage scope of a [`Proxy`]; dropping the last one unsubscribes.
#[must_use = "the proxy is released when the scope is dropped"]
#[derive(Debug)]
pub struct ProxyUse {
    proxy: Proxy,
}

impl Deref for ProxyUse {
    type Target = Proxy;

    fn deref(&self) -> &Proxy {
        &self.proxy
    }
}

impl Drop for ProxyUse {
    fn drop(&mut self) {
        self.proxy.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Connector;
    use crate::hash::{Element, TypeCode};
    use futures::FutureExt;

    fn owner() -> SignalSlotable {
        let connector = Connector::in_memory("proxy-handle", "unit").expect("connector");
        SignalSlotable::builder("owner")
            .connector(Arc::new(connector))
            .build()
            .expect("instance")
    }

    fn peer_schema() -> Schema {
        Schema::builder("Motor")
            .element(Element::leaf("position", TypeCode::Double).reconfigurable())
            .element(Element::leaf("state", TypeCode::String).read_only())
            .build()
    }

    fn peer() -> (SignalSlotable, Proxy) {
        let owner = owner();
        let values = Hash::new()
            .with("position", 1.5)
            .with("state", "ON")
            .with("serverId", "srv/1");
        let proxy = Proxy::new(&owner, "motor/1", peer_schema(), values, None);
        (owner, proxy)
    }

    #[tokio::test]
    async fn changes_update_cache_and_subscribers() {
        let (_owner, proxy) = peer();
        let mut changes = proxy.changes();
        proxy.apply_changes(&Hash::new().with("position", 4.0));

        assert_eq!(proxy.get("position"), Some(HashValue::Double(4.0)));
        assert_eq!(proxy.get("state").and_then(|v| v.as_str().map(str::to_string)), Some("ON".into()));
        let seen = changes.recv().await.expect("change");
        assert!(seen.contains("position"));
        assert_eq!(proxy.server_id().as_deref(), Some("srv/1"));
    }

    #[tokio::test]
    async fn gone_peer_reports_unknown_and_refuses_writes() {
        let (_owner, proxy) = peer();
        proxy.mark_gone();

        assert!(!proxy.is_alive());
        assert_eq!(proxy.get("state").and_then(|v| v.as_str().map(str::to_string)), Some("UNKNOWN".into()));
        assert!(proxy.timestamp("state").is_some());
        assert_eq!(
            proxy.set("position", 2.0),
            Err(KaraboError::DeviceDied("motor/1".into()))
        );
        let err = proxy.call("move", Vec::new()).await.expect_err("dead peer");
        assert_eq!(err, KaraboError::DeviceDied("motor/1".into()));
    }

    #[tokio::test]
    async fn new_schema_drops_vanished_values() {
        let (_owner, proxy) = peer();
        let smaller = Schema::builder("Motor")
            .element(Element::leaf("position", TypeCode::Double))
            .build();
        proxy.replace_schema(&smaller);

        assert!(proxy.get("position").is_some());
        assert!(proxy.get("state").is_none());
        assert_eq!(proxy.schema().leaves(), vec!["position".to_string()]);
    }

    #[tokio::test]
    async fn watcher_sees_only_its_path() {
        let (owner, proxy) = peer();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        proxy.watch(
            "position",
            Arc::new(move |slice: Hash| {
                let tx = tx.clone();
                async move {
                    tx.send(slice)?;
                    Ok::<(), anyhow::Error>(())
                }
                .boxed()
            }),
        );
        proxy.apply_changes(&Hash::new().with("state", "MOVING").with("position", 3.0));

        let slice = rx.recv().await.expect("watcher call");
        assert_eq!(slice.paths(), vec!["position".to_string()]);
        drop(owner);
    }

    #[tokio::test]
    async fn wait_until_returns_once_condition_holds() {
        let (_owner, proxy) = peer();
        let waiter = proxy.clone();
        let wait = tokio::spawn(async move {
            waiter
                .wait_until(
                    |h| h.get_str("state") == Some("MOVING"),
                    Duration::from_secs(2),
                )
                .await
        });
        tokio::task::yield_now().await;
        proxy.apply_changes(&Hash::new().with("state", "MOVING"));
        assert_eq!(wait.await.expect("join"), Ok(()));

        let late = proxy
            .wait_until(|h| h.get_str("state") == Some("OFF"), Duration::from_millis(50))
            .await;
        assert!(matches!(late, Err(KaraboError::Timeout(_))));
    }
}
