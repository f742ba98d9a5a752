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

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::common::{KaraboError, Result};
use crate::hash::{Hash, HashValue, Schema};
use crate::signalslot::{instance_type_of, InstanceType, SignalSlotable};

use super::handle::{Proxy, ProxyInner, CHANGED_SIGNAL, CHANGED_SLOT, SCHEMA_SIGNAL, SCHEMA_SLOT};

/// A peer signal proxies subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Feed {
    Schema,
    Changes,
}

impl Feed {
    const fn names(self) -> (&'static str, &'static str) {
        match self {
            Self::Schema => (SCHEMA_SIGNAL, SCHEMA_SLOT),
            Self::Changes => (CHANGED_SIGNAL, CHANGED_SLOT),
        }
    }
}

/// How many proxies of one peer hold each feed.
#[derive(Debug, Default)]
struct Interest {
    schema: usize,
    changes: usize,
}

impl Interest {
    fn count(&mut self, feed: Feed) -> &mut usize {
        match feed {
            Feed::Schema => &mut self.schema,
            Feed::Changes => &mut self.changes,
        }
    }
}

/// Proxies an instance holds, keyed by peer id. Entries do not keep the
/// proxies alive.
///
/// Every proxy object of a peer shares the owner's connections to that
/// peer's signals, so they are counted per peer and only the last holder
/// disconnects.
#[derive(Default)]
pub(crate) struct ProxyRegistry {
    proxies: DashMap<String, Weak<ProxyInner>>,
    interest: DashMap<String, Arc<Mutex<Interest>>>,
}

impl ProxyRegistry {
    pub(crate) fn get(&self, id: &str) -> Option<Proxy> {
        let inner = self.proxies.get(id)?.upgrade();
        if inner.is_none() {
            self.proxies.remove_if(id, |_, weak| weak.strong_count() == 0);
        }
        inner.map(Proxy)
    }

    /// Keeps an existing live proxy over `proxy`; returns the one in use.
    pub(crate) fn insert(&self, proxy: Proxy) -> Proxy {
        let mut entry = self.proxies.entry(proxy.instance_id().to_string()).or_default();
        if let Some(existing) = entry.upgrade() {
            return Proxy(existing);
        }
        *entry = proxy.downgrade();
        proxy
    }

    fn interest(&self, id: &str) -> Arc<Mutex<Interest>> {
        self.interest.entry(id.to_string()).or_default().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.proxies.iter().filter(|e| e.value().strong_count() > 0).count()
    }

    fn live(&self) -> Vec<Proxy> {
        self.proxies
            .iter()
            .filter_map(|e| e.value().upgrade().map(Proxy))
            .collect()
    }

    /// A peer announced itself. Proxies of devices on a restarted server
    /// are marked gone, the peer's own proxy is revived.
    pub(crate) fn instance_new(&self, owner: &SignalSlotable, id: &str, info: &Hash) {
        if instance_type_of(info) == InstanceType::Server {
            for proxy in self.live() {
                if proxy.server_id().as_deref() == Some(id) {
                    proxy.mark_gone();
                }
            }
        }
        let Some(proxy) = self.get(id) else {
            return;
        };
        proxy.mark_gone();
        let owner_task = owner.clone();
        owner.tasks().spawn(async move {
            if let Err(e) = proxy.revive(&owner_task).await {
                warn!(id = %proxy.instance_id(), error = %e, "Could not refresh proxy");
            }
        });
    }

    pub(crate) fn instance_gone(&self, id: &str) {
        if let Some(proxy) = self.get(id) {
            proxy.mark_gone();
        }
    }

    pub(crate) fn changed(&self, id: &str, changes: &Hash) {
        if let Some(proxy) = self.get(id) {
            proxy.apply_changes(changes);
        }
    }

    pub(crate) fn schema_updated(&self, id: &str, schema: &Schema) {
        if let Some(proxy) = self.get(id) {
            proxy.replace_schema(schema);
        }
    }
}

impl SignalSlotable {
    /// Returns the proxy for `device_id`, creating it on first use.
    ///
    /// Waits for the peer to come up if it is not there yet, bounded by the
    /// schema timeout.
    pub async fn get_proxy(&self, device_id: &str) -> Result<Proxy> {
        self.build_proxy(device_id, None).await
    }

    /// Like [`get_proxy`](Self::get_proxy), but the proxy subscribes on
    /// access and drops its subscription after being idle for the
    /// configured auto-disconnect interval.
    pub async fn get_proxy_auto_disconnect(&self, device_id: &str) -> Result<Proxy> {
        let idle = self.config().proxy.auto_disconnect();
        self.build_proxy(device_id, Some(idle)).await
    }

    /// Takes a hold on `feed` of `device_id`; the first holder connects.
    pub(crate) async fn acquire_feed(&self, device_id: &str, feed: Feed) -> Result<()> {
        let interest = self.0.proxies.interest(device_id);
        let mut held = interest.lock().await;
        let count = held.count(feed);
        if *count == 0 {
            let (signal, slot) = feed.names();
            self.connect(device_id, signal, slot).await?;
        }
        *count += 1;
        trace!(device_id, ?feed, holders = *count, "Feed acquired");
        Ok(())
    }

    /// Gives a hold on `feed` back; the last holder disconnects.
    pub(crate) async fn release_feed(&self, device_id: &str, feed: Feed) -> Result<()> {
        let interest = self.0.proxies.interest(device_id);
        let mut held = interest.lock().await;
        let count = held.count(feed);
        match *count {
            0 => return Ok(()),
            1 => {
                *count = 0;
                let (signal, slot) = feed.names();
                self.disconnect(device_id, signal, slot).await?;
            }
            _ => *count -= 1,
        }
        trace!(device_id, ?feed, holders = *count, "Feed released");
        Ok(())
    }

    /// Connects again every feed of `device_id` that still has holders.
    pub(crate) async fn rebind_feeds(&self, device_id: &str) -> Result<()> {
        let interest = self.0.proxies.interest(device_id);
        let mut held = interest.lock().await;
        for feed in [Feed::Schema, Feed::Changes] {
            if *held.count(feed) > 0 {
                let (signal, slot) = feed.names();
                self.connect(device_id, signal, slot).await?;
            }
        }
        Ok(())
    }

    /// Number of live proxies this instance holds.
    pub fn proxy_count(&self) -> usize {
        self.0.proxies.len()
    }

    #[instrument(skip(self), fields(instance_id = %self.instance_id()))]
    async fn build_proxy(&self, device_id: &str, auto_disconnect: Option<Duration>) -> Result<Proxy> {
        if let Some(proxy) = self.0.proxies.get(device_id) {
            return Ok(proxy);
        }
        self.acquire_feed(device_id, Feed::Schema).await?;
        let fetched = self.fetch_description(device_id).await;
        let (schema, configuration) = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                let _ = self.release_feed(device_id, Feed::Schema).await;
                return Err(e);
            }
        };
        // Losing a race to another get_proxy drops this one, which gives
        // its schema hold back.
        let proxy = self.0.proxies.insert(Proxy::new(
            self,
            device_id,
            schema,
            configuration,
            auto_disconnect,
        ));
        if let Some(idle) = auto_disconnect {
            spawn_idle_watch(self, &proxy, idle);
        }
        debug!(device_id, "Proxy created");
        Ok(proxy)
    }

    async fn fetch_description(&self, device_id: &str) -> Result<(Schema, Hash)> {
        let timeout = self.config().timeouts.schema();
        let reply = self
            .call_once_alive(device_id, "slotGetSchema", vec![HashValue::Bool(false)], timeout)
            .await?;
        let schema = reply
            .get(0)
            .and_then(HashValue::as_schema)
            .cloned()
            .ok_or_else(|| KaraboError::Protocol(format!("{device_id} sent no schema")))?;
        let reply = self
            .request_with_timeout(device_id, "slotGetConfiguration", Vec::new(), timeout)
            .await?;
        let configuration = reply
            .hash(0)
            .cloned()
            .ok_or_else(|| KaraboError::Protocol(format!("{device_id} sent no configuration")))?;
        Ok((schema, configuration))
    }
}

/// Drops the subscription of an unused auto-disconnect proxy. Ends with
/// the proxy or the owner.
fn spawn_idle_watch(owner: &SignalSlotable, proxy: &Proxy, idle: Duration) {
    let weak = proxy.downgrade();
    owner.tasks().spawn(async move {
        let mut ticks = tokio::time::interval(idle / 2);
        loop {
            ticks.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let proxy = Proxy(inner);
            if proxy.is_subscribed() && proxy.use_count() == 0 && proxy.idle_for() >= idle {
                if let Err(e) = proxy.unsubscribe().await {
                    debug!(id = %proxy.instance_id(), error = %e, "Idle unsubscribe failed");
                }
            }
        }
    });
}
