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

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_new::new;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::common::HeartbeatConfig;
use crate::hash::{Hash, HashValue, Timestamp};
use crate::signalslot::{heartbeat_interval_of, instance_type_of, InstanceType, SignalSlotable, WeakInstance};

/// Called with the accumulated changes of one tracker tick.
pub type TopologyCallback = Arc<dyn Fn(TopologyChange) + Send + Sync>;

/// Topology changes seen since the previous tick, as `(id, info)` pairs.
#[derive(new, Debug, Clone, Default, PartialEq)]
pub struct TopologyChange {
    /// Instances that appeared.
    pub new: Vec<(String, Hash)>,
    /// Instances whose info changed.
    pub updated: Vec<(String, Hash)>,
    /// Instances that left or stopped beating.
    pub gone: Vec<(String, Hash)>,
}

impl TopologyChange {
    /// Whether nothing changed.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.updated.is_empty() && self.gone.is_empty()
    }

    /// Ids of the gone instances, in removal order.
    pub fn gone_ids(&self) -> Vec<&str> {
        self.gone.iter().map(|(id, _)| id.as_str()).collect()
    }
}

/// Whether an instance last seen at `last` with beat interval `interval_secs`
/// counts as dead at `now`.
pub(crate) fn is_expired(last: &Timestamp, now: &Timestamp, interval_secs: f64, num_beats: u32) -> bool {
    now.as_secs_f64() - last.as_secs_f64() > f64::from(num_beats) * interval_secs
}

/// Counters of a [`TopologyTracker`].
#[derive(Debug, Default)]
pub struct TrackerStats {
    beats: AtomicUsize,
    expired: AtomicUsize,
    resurrections: AtomicUsize,
}

impl TrackerStats {
    /// Heartbeats received.
    #[must_use]
    pub fn beats(&self) -> usize {
        self.beats.load(Ordering::Relaxed)
    }

    /// Instances removed because their beats stopped.
    #[must_use]
    pub fn expired(&self) -> usize {
        self.expired.load(Ordering::Relaxed)
    }

    /// Beats of unknown instances that triggered a ping.
    #[must_use]
    pub fn resurrections(&self) -> usize {
        self.resurrections.load(Ordering::Relaxed)
    }
}

/// Live view of the instances on the broker topic.
///
/// The view is a Hash `type -> id -> info`, where the attributes of each
/// info node hold the time of the last sign of life.
pub struct TopologyTracker {
    topology: RwLock<Hash>,
    pending: Mutex<TopologyChange>,
    resurrecting: Mutex<HashSet<String>>,
    default_interval: f64,
    num_beats: u32,
    tick_interval: Duration,
    ping_timeout: Duration,
    callback: Option<TopologyCallback>,
    stats: TrackerStats,
}

impl fmt::Debug for TopologyTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopologyTracker")
            .field("instances", &self.len())
            .field("num_beats", &self.num_beats)
            .field("tick_interval", &self.tick_interval)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl TopologyTracker {
    /// A tracker expiring instances after `num_beats` missed beats.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(config: &HeartbeatConfig, callback: Option<TopologyCallback>) -> Self {
        Self {
            topology: RwLock::new(Hash::new()),
            pending: Mutex::new(TopologyChange::default()),
            resurrecting: Mutex::new(HashSet::new()),
            default_interval: config.interval_secs as f64,
            num_beats: config.num_beats,
            tick_interval: config.tick_interval(),
            ping_timeout: Duration::from_secs(1),
            callback,
            stats: TrackerStats::default(),
        }
    }

    /// Copy of the topology Hash.
    pub fn snapshot(&self) -> Hash {
        self.topology.read().clone()
    }

    /// Number of known instances.
    pub fn len(&self) -> usize {
        self.topology
            .read()
            .iter()
            .filter_map(|(_, node)| node.value.as_hash())
            .map(Hash::len)
            .sum()
    }

    /// Whether no instance is known.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Info of `id`, if known.
    pub fn get(&self, id: &str) -> Option<Hash> {
        let topology = self.topology.read();
        let found = topology
            .iter()
            .filter_map(|(_, node)| node.value.as_hash())
            .find_map(|by_id| by_id.get_hash(id).cloned());
        found
    }

    /// Whether `id` is known.
    pub fn contains(&self, id: &str) -> bool {
        self.path_of(id).is_some()
    }

    /// Returns a reference to the counters.
    #[must_use]
    pub const fn stats(&self) -> &TrackerStats {
        &self.stats
    }

    fn path_of(&self, id: &str) -> Option<String> {
        let topology = self.topology.read();
        let path = topology.iter().find_map(|(kind, node)| {
            node.value
                .as_hash()
                .filter(|by_id| by_id.contains(id))
                .map(|_| format!("{kind}.{id}"))
        });
        path
    }

    fn store(&self, id: &str, info: &Hash, seen: Timestamp) {
        let kind = instance_type_of(info);
        let mut topology = self.topology.write();
        for other in [
            InstanceType::Server,
            InstanceType::Device,
            InstanceType::Macro,
            InstanceType::Client,
            InstanceType::Unknown,
        ] {
            if other != kind {
                topology.remove(&format!("{}.{id}", other.as_str()));
            }
        }
        topology.set_element(&format!("{}.{id}", kind.as_str()), info.clone(), seen.to_attributes());
    }

    /// Records an instance announced by `slotInstanceNew` or discovery.
    pub fn instance_new(&self, id: &str, info: &Hash) {
        self.resurrecting.lock().remove(id);
        self.store(id, info, Timestamp::now());
        self.pending.lock().new.push((id.to_string(), info.clone()));
        trace!(id, "Topology: new");
    }

    /// Merges updated info of an instance.
    pub fn instance_updated(&self, id: &str, info: &Hash) {
        let merged = match self.get(id) {
            Some(mut current) => {
                current.merge(info);
                current
            }
            None => info.clone(),
        };
        self.store(id, &merged, Timestamp::now());
        self.pending.lock().updated.push((id.to_string(), merged));
    }

    /// Removes an instance that announced its departure; a server takes
    /// its devices with it.
    pub fn instance_gone(&self, id: &str, info: &Hash) {
        let gone = self.remove_cascading(id, Some(info));
        self.pending.lock().gone.extend(gone);
    }

    fn remove_cascading(&self, id: &str, info: Option<&Hash>) -> Vec<(String, Hash)> {
        let mut gone = Vec::new();
        let mut topology = self.topology.write();
        let removed = [
            InstanceType::Server,
            InstanceType::Device,
            InstanceType::Macro,
            InstanceType::Client,
            InstanceType::Unknown,
        ]
        .into_iter()
        .find_map(|kind| topology.remove(&format!("{}.{id}", kind.as_str())));
        let Some(node) = removed else {
            return gone;
        };
        let stored = node.value.as_hash().cloned().unwrap_or_default();
        let is_server = instance_type_of(&stored) == InstanceType::Server
            || info.is_some_and(|i| instance_type_of(i) == InstanceType::Server);
        gone.push((id.to_string(), info.cloned().unwrap_or(stored)));

        if is_server {
            let children: Vec<(String, Hash)> = topology
                .iter()
                .filter_map(|(_, node)| node.value.as_hash())
                .flat_map(|by_id| by_id.iter())
                .filter_map(|(child, node)| {
                    let info = node.value.as_hash()?;
                    (info.get_str("serverId") == Some(id)).then(|| (child.to_string(), info.clone()))
                })
                .collect();
            for (child, child_info) in children {
                let kind = instance_type_of(&child_info);
                topology.remove(&format!("{}.{child}", kind.as_str()));
                gone.push((child, child_info));
            }
        }
        gone
    }

    /// Stamps a heartbeat. A beat of an unknown instance asks it for its
    /// info and announces it as new once it answers.
    pub fn beat(&self, instance: &SignalSlotable, id: &str, beat: &Hash) {
        self.stats.beats.fetch_add(1, Ordering::Relaxed);
        if let Some(path) = self.path_of(id) {
            let mut topology = self.topology.write();
            if let Some(node) = topology.get_node_mut(&path) {
                Timestamp::now().apply_to(&mut node.attrs);
                if let (Some(interval), HashValue::Hash(info)) = (beat.get("heartbeatInterval"), &mut node.value) {
                    info.set("heartbeatInterval", interval.clone());
                }
            }
            return;
        }
        if id == instance.instance_id() || !self.resurrecting.lock().insert(id.to_string()) {
            return;
        }
        self.stats.resurrections.fetch_add(1, Ordering::Relaxed);
        debug!(id, "Beat of unknown instance, pinging");
        let weak = instance.downgrade();
        let id = id.to_string();
        let timeout = self.ping_timeout;
        instance.tasks().spawn(async move {
            let Some(instance) = weak.upgrade() else {
                return;
            };
            match instance
                .request_with_timeout(&id, "slotPing", vec![HashValue::Int32(1)], timeout)
                .await
            {
                Ok(reply) => match reply.hash(0) {
                    Some(info) => instance.notice_instance_new(&id, info),
                    None => warn!(id = %id, "Ping reply without info"),
                },
                Err(e) => debug!(id = %id, error = %e, "Resurrection ping failed"),
            }
            if let Some(tracker) = &instance.0.tracker {
                tracker.resurrecting.lock().remove(&id);
            }
        });
    }

    /// Expires devices and servers silent for longer than `num_beats`
    /// intervals at `now` and hands every change since the last tick to the
    /// callback. Servers are checked first so that their devices go with
    /// them. Macros, clients and unknown instances only leave through
    /// `slotInstanceGone`.
    pub fn tick(&self, now: &Timestamp) -> TopologyChange {
        let expired: Vec<(String, bool)> = {
            let topology = self.topology.read();
            let mut expired = Vec::new();
            for (kind, node) in topology.iter() {
                let is_server = kind == InstanceType::Server.as_str();
                if !is_server && kind != InstanceType::Device.as_str() {
                    continue;
                }
                let Some(by_id) = node.value.as_hash() else {
                    continue;
                };
                for (id, entry) in by_id.iter() {
                    let Some(last) = Timestamp::from_attributes(&entry.attrs) else {
                        continue;
                    };
                    let interval = entry
                        .value
                        .as_hash()
                        .and_then(heartbeat_interval_of)
                        .unwrap_or(self.default_interval);
                    if is_expired(&last, now, interval, self.num_beats) {
                        expired.push((id.to_string(), is_server));
                    }
                }
            }
            expired.sort_by_key(|(_, server)| !*server);
            expired
        };

        let mut gone = Vec::new();
        for (id, _) in expired {
            let removed = self.remove_cascading(&id, None);
            if !removed.is_empty() {
                info!(id = %id, cascaded = removed.len() - 1, "Instance stopped beating");
            }
            gone.extend(removed);
        }
        self.stats.expired.fetch_add(gone.len(), Ordering::Relaxed);

        let mut change = std::mem::take(&mut *self.pending.lock());
        change.gone.extend(gone);
        if !change.is_empty() {
            if let Some(callback) = &self.callback {
                callback(change.clone());
            }
        }
        change
    }

    pub(crate) fn spawn_ticks(self: Arc<Self>, instance: &SignalSlotable) {
        let weak: WeakInstance = instance.downgrade();
        let period = self.tick_interval;
        instance.tasks().spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(instance) = weak.upgrade() else {
                    break;
                };
                let change = self.tick(&Timestamp::now());
                for (id, _) in &change.gone {
                    instance.0.proxies.instance_gone(id);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signalslot::InstanceInfo;

    fn tracker(callback: Option<TopologyCallback>) -> TopologyTracker {
        let config = HeartbeatConfig {
            interval_secs: 1,
            tick_interval_ms: 100,
            num_beats: 3,
        };
        TopologyTracker::new(&config, callback)
    }

    fn at(secs: u64) -> Timestamp {
        Timestamp {
            sec: secs,
            frac: 0,
            tid: 0,
        }
    }

    fn server(host: &str) -> Hash {
        InstanceInfo::new(InstanceType::Server, "Server", host, 1).into_hash()
    }

    fn device(server: &str) -> Hash {
        InstanceInfo::new(InstanceType::Device, "Motor", "h", 1)
            .server_id(server)
            .into_hash()
    }

    #[test]
    fn expiry_threshold() {
        assert!(!is_expired(&at(100), &at(103), 1.0, 3));
        assert!(is_expired(&at(100), &at(104), 1.0, 3));
    }

    #[test]
    fn silent_server_takes_its_devices() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        let tracker = tracker(Some(Arc::new(move |change: TopologyChange| {
            seen.lock().push(change);
        })));
        tracker.store("S1", &server("h"), at(100));
        tracker.store("d1", &device("S1"), at(100));
        tracker.store("d2", &device("S1"), at(105));
        tracker.store("other", &device("S2"), at(105));

        let change = tracker.tick(&at(106));
        assert_eq!(change.gone_ids(), vec!["S1", "d1", "d2"]);
        assert!(tracker.contains("other"));
        assert!(!tracker.contains("d2"));
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(tracker.stats().expired(), 3);

        let change = tracker.tick(&at(107));
        assert!(change.is_empty());
        assert_eq!(calls.lock().len(), 1);
    }

    #[test]
    fn announcements_are_reported_at_the_next_tick() {
        let tracker = tracker(None);
        tracker.instance_new("d1", &device("S1"));
        tracker.instance_updated("d1", &Hash::new().with("status", "error"));
        assert_eq!(tracker.get("d1").unwrap().get_str("status"), Some("error"));
        assert_eq!(tracker.len(), 1);

        let change = tracker.tick(&Timestamp::now());
        assert_eq!(change.new.len(), 1);
        assert_eq!(change.updated.len(), 1);
        assert!(change.gone.is_empty());
    }

    #[test]
    fn departure_of_a_server_cascades() {
        let tracker = tracker(None);
        tracker.instance_new("S1", &server("h"));
        tracker.instance_new("d1", &device("S1"));
        tracker.instance_gone("S1", &server("h"));
        assert!(tracker.is_empty());
        let change = tracker.tick(&Timestamp::now());
        assert_eq!(change.gone_ids(), vec!["S1", "d1"]);
    }

    #[test]
    fn only_devices_and_servers_expire() {
        let tracker = tracker(None);
        let client = InstanceInfo::new(InstanceType::Client, "Gui", "h", 1).into_hash();
        let script = InstanceInfo::new(InstanceType::Macro, "Scan", "h", 1).into_hash();
        tracker.store("gui", &client, at(100));
        tracker.store("scan", &script, at(100));
        tracker.store("d1", &device("S9"), at(100));

        let change = tracker.tick(&at(200));
        assert_eq!(change.gone_ids(), vec!["d1"]);
        assert!(tracker.contains("gui"));
        assert!(tracker.contains("scan"));
    }

    #[test]
    fn type_change_moves_the_entry() {
        let tracker = tracker(None);
        tracker.instance_new("x", &device("S1"));
        tracker.instance_new("x", &server("h"));
        assert_eq!(tracker.len(), 1);
        assert!(tracker.snapshot().contains("server.x"));
    }
}
