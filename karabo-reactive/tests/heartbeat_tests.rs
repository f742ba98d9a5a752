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

use std::time::Duration;

use karabo_reactive::common::BrokerSession;
use karabo_reactive::prelude::*;
use karabo_test::prelude::*;
use tokio::sync::mpsc;

use crate::setup::*;

mod setup;

/// A peer that only talks through a raw broker session.
struct FakePeer {
    id: String,
    info: Hash,
    session: Arc<BrokerSession>,
}

impl FakePeer {
    async fn open(broker: &Arc<Connector>, id: &str, info: Hash) -> anyhow::Result<Self> {
        let session = BrokerSession::open(broker.clone(), id, "Fake", false, &fast_config()).await?;
        Ok(Self {
            id: id.to_string(),
            info,
            session,
        })
    }

    async fn announce(&self) -> anyhow::Result<()> {
        self.session
            .broadcast(
                "slotInstanceNew",
                vec![HashValue::from(self.id.as_str()), HashValue::Hash(self.info.clone())],
            )
            .await?;
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.session
            .broadcast(
                "slotInstanceGone",
                vec![HashValue::from(self.id.as_str()), HashValue::Hash(self.info.clone())],
            )
            .await?;
        Ok(())
    }

    async fn beat(&self) -> anyhow::Result<()> {
        let beat = Hash::new()
            .with("type", self.info.get_str("type").unwrap_or("device"))
            .with("heartbeatInterval", 1_i32);
        self.session.heartbeat(beat).await?;
        Ok(())
    }
}

fn server_info() -> Hash {
    Hash::new()
        .with("type", "server")
        .with("heartbeatInterval", 1_i32)
        .with("host", "test-host")
}

fn device_info(server: &str) -> Hash {
    Hash::new()
        .with("type", "device")
        .with("serverId", server)
        .with("heartbeatInterval", 1_i32)
        .with("host", "test-host")
}

async fn observer(broker: &Arc<Connector>, id: &str) -> (SignalSlotable, mpsc::UnboundedReceiver<TopologyChange>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut config = fast_config();
    config.heartbeat.num_beats = 2;
    let callback: TopologyCallback = Arc::new(move |change: TopologyChange| {
        let _ = tx.send(change);
    });
    let instance = SignalSlotable::builder(id)
        .track_topology(true)
        .on_topology_change(callback)
        .connector(broker.clone())
        .config(config)
        .start()
        .await
        .expect("observer starts");
    (instance, rx)
}

async fn next_gone(changes: &mut mpsc::UnboundedReceiver<TopologyChange>, within: Duration) -> Vec<String> {
    let wait = async {
        loop {
            let change = changes.recv().await.expect("tracker alive");
            if !change.gone.is_empty() {
                return change.gone_ids().into_iter().map(str::to_string).collect::<Vec<_>>();
            }
        }
    };
    tokio::time::timeout(within, wait).await.expect("instances expire")
}

#[karabo_test]
async fn silent_server_takes_its_devices_along() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("hb-cascade");
    let (watcher, mut changes) = observer(&broker, "topology-watcher").await;

    let server = FakePeer::open(&broker, "S1", server_info()).await?;
    let first = FakePeer::open(&broker, "d1", device_info("S1")).await?;
    let second = FakePeer::open(&broker, "d2", device_info("S1")).await?;
    for peer in [&server, &first, &second] {
        peer.announce().await?;
    }

    let watching = &watcher;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            watching
                .topology()
                .is_some_and(|t| t.contains("server.S1") && t.contains("device.d1") && t.contains("device.d2"))
        })
        .await
    );

    // The server's last beat is the oldest, so it is the first to expire.
    for _ in 0..3 {
        for peer in [&server, &first, &second] {
            peer.beat().await?;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let gone = next_gone(&mut changes, Duration::from_secs(6)).await;
    assert_eq!(gone, vec!["S1", "d1", "d2"]);
    let topology = watcher.topology().expect("tracking");
    assert!(!topology.contains("server.S1"));
    assert!(!topology.contains("device.d1"));

    for peer in [server, first, second] {
        peer.session.close().await?;
    }
    watcher.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn departing_server_removes_devices_at_next_tick() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("hb-departure");
    let (watcher, mut changes) = observer(&broker, "departure-watcher").await;

    let server = FakePeer::open(&broker, "S2", server_info()).await?;
    let device = FakePeer::open(&broker, "d3", device_info("S2")).await?;
    let bystander = FakePeer::open(&broker, "d4", device_info("S9")).await?;
    for peer in [&server, &device, &bystander] {
        peer.announce().await?;
    }
    let watching = &watcher;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            watching.topology().is_some_and(|t| t.contains("device.d4"))
        })
        .await
    );

    server.leave().await?;
    let gone = next_gone(&mut changes, Duration::from_secs(2)).await;
    assert_eq!(gone, vec!["S2", "d3"]);
    assert!(watcher.topology().is_some_and(|t| t.contains("device.d4")));

    for peer in [server, device, bystander] {
        peer.session.close().await?;
    }
    watcher.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn real_instances_appear_and_disappear() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("hb-real");
    let (watcher, mut changes) = observer(&broker, "real-watcher").await;

    let device = start_instance(&broker, SignalSlotable::builder("beating").heartbeat_interval(1)).await;
    let watching = &watcher;
    assert!(
        eventually(Duration::from_secs(2), || async move {
            watching.topology().is_some_and(|t| t.contains("device.beating"))
        })
        .await
    );

    // Regular beats keep it listed past the expiry window.
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(watcher.topology().is_some_and(|t| t.contains("device.beating")));

    device.shutdown().await;
    let gone = next_gone(&mut changes, Duration::from_secs(2)).await;
    assert_eq!(gone, vec!["beating"]);

    watcher.shutdown().await;
    Ok(())
}
