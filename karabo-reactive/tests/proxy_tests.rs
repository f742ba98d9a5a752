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

use futures::FutureExt;
use karabo_reactive::prelude::*;
use karabo_test::prelude::*;

use crate::setup::*;

mod setup;

fn motor() -> InstanceBuilder {
    SignalSlotable::builder("motor")
        .class_id("Motor")
        .schema(
            Schema::builder("Motor")
                .element(Element::leaf("position", TypeCode::Double).read_only().default_value(0.0_f64))
                .element(Element::leaf("target", TypeCode::Double).reconfigurable().default_value(0.0_f64))
                .element(Element::slot("slotHome"))
                .build(),
        )
        .slot(
            "slotHome",
            SlotHandler::sync(|call| {
                call.instance.set("position", 0.0_f64);
                Ok(())
            }),
        )
}

#[karabo_test]
async fn proxy_mirrors_and_writes_the_remote_configuration() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-mirror");
    let device = start_instance(&broker, motor()).await;
    device.set("position", 12.5_f64);
    let client = start_instance(&broker, SignalSlotable::builder("proxy-client")).await;

    let proxy = client.get_proxy("motor").await?;
    assert!(proxy.is_alive());
    assert!(proxy.schema().leaves().contains(&"target".to_string()));
    assert_eq!(proxy.get("position"), Some(HashValue::Double(12.5)));
    assert!(proxy.timestamp("position").is_some());

    let again = client.get_proxy("motor").await?;
    assert_eq!(again.instance_id(), "motor");
    assert_eq!(client.proxy_count(), 1);

    proxy.set("target", 3.0_f64)?;
    proxy.update().await?;
    assert_eq!(device.get("target"), Some(HashValue::Double(3.0)));

    proxy.set("position", 1.0_f64)?;
    let refused = proxy.update().await;
    assert!(matches!(refused, Err(KaraboError::Remote { .. })), "{refused:?}");

    proxy.call("slotHome", Vec::new()).await?;
    assert_eq!(device.get("position"), Some(HashValue::Double(0.0)));

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn usage_scope_controls_the_subscription() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-scope");
    let device = start_instance(&broker, motor()).await;
    let client = start_instance(&broker, SignalSlotable::builder("scope-client")).await;
    let proxy = client.get_proxy("motor").await?;
    assert!(!proxy.is_subscribed());

    {
        let inside = proxy.enter().await?;
        assert!(inside.is_subscribed());
        assert_eq!(inside.use_count(), 1);

        device.set("position", 4.0_f64);
        inside
            .wait_until(
                |c| c.get("position") == Some(&HashValue::Double(4.0)),
                Duration::from_secs(2),
            )
            .await?;
    }

    let proxy_ref = &proxy;
    assert!(eventually(Duration::from_secs(2), || async move { !proxy_ref.is_subscribed() }).await);
    assert_eq!(proxy.use_count(), 0);

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn proxy_follows_the_peer_through_a_restart() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-restart");
    let device = start_instance(&broker, motor()).await;
    let client = start_instance(&broker, SignalSlotable::builder("restart-client")).await;
    let proxy = client.get_proxy("motor").await?;
    let _scope = proxy.enter().await?;
    device.set("state", "ON");
    proxy
        .wait_until(|c| c.get_str("state") == Some("ON"), Duration::from_secs(2))
        .await?;

    device.shutdown().await;
    let watched = &proxy;
    assert!(eventually(Duration::from_secs(2), || async move { !watched.is_alive() }).await);
    assert_eq!(proxy.get("state"), Some(HashValue::from("UNKNOWN")));
    assert_eq!(
        proxy.set("target", 1.0_f64),
        Err(KaraboError::DeviceDied("motor".to_string()))
    );
    assert_eq!(
        proxy.call("slotHome", Vec::new()).await.unwrap_err(),
        KaraboError::DeviceDied("motor".to_string())
    );

    let restarted = start_instance(&broker, motor()).await;
    restarted.set("position", 7.0_f64);
    assert!(eventually(Duration::from_secs(3), || async move { watched.is_alive() }).await);
    proxy
        .wait_until(
            |c| c.get("position") == Some(&HashValue::Double(7.0)),
            Duration::from_secs(2),
        )
        .await?;
    assert!(proxy.is_subscribed());

    client.shutdown().await;
    restarted.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn watchers_fire_for_their_path_only() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-watch");
    let device = start_instance(&broker, motor()).await;
    let client = start_instance(&broker, SignalSlotable::builder("watch-client")).await;
    let proxy = client.get_proxy("motor").await?;
    let _scope = proxy.enter().await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Hash>();
    proxy.watch(
        "target",
        Arc::new(move |slice: Hash| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(slice);
                Ok::<(), anyhow::Error>(())
            }
            .boxed()
        }),
    );

    device.set("position", 1.0_f64);
    device.set("target", 2.0_f64);
    let seen = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("watcher fired");
    assert_eq!(seen.get("target"), Some(&HashValue::Double(2.0)));
    assert!(!seen.contains("position"));

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

fn with_speed() -> Schema {
    Schema::builder("Motor")
        .element(Element::leaf("speed", TypeCode::Double).reconfigurable().default_value(1.0_f64))
        .build()
}

async fn sees_speed(proxy: &Proxy) -> bool {
    eventually(Duration::from_secs(2), || async move {
        proxy.schema().leaves().contains(&"speed".to_string())
    })
    .await
}

#[karabo_test]
async fn concurrent_lookups_keep_schema_updates_flowing() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-concurrent");
    let device = start_instance(&broker, motor()).await;
    let client = start_instance(&broker, SignalSlotable::builder("concurrent-client")).await;

    let (first, second) = tokio::join!(client.get_proxy("motor"), client.get_proxy("motor"));
    let (first, second) = (first?, second?);
    assert_eq!(client.proxy_count(), 1);
    // Let the handle that lost the race finish dropping.
    tokio::time::sleep(Duration::from_millis(100)).await;

    device.set_schema(&with_speed());
    assert!(sees_speed(&first).await);
    assert!(sees_speed(&second).await);

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn reacquired_proxy_still_follows_schema_updates() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-reacquire");
    let device = start_instance(&broker, motor()).await;
    let client = start_instance(&broker, SignalSlotable::builder("reacquire-client")).await;

    let first = client.get_proxy("motor").await?;
    drop(first);
    let again = client.get_proxy("motor").await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    device.set_schema(&with_speed());
    assert!(sees_speed(&again).await);

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn auto_disconnect_proxy_unsubscribes_when_idle() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("proxy-auto-disconnect");
    let device = start_instance(&broker, motor()).await;
    device.set("position", 2.0_f64);
    let client = start_instance(&broker, SignalSlotable::builder("idle-client")).await;

    let session = client.broker_session().expect("client has a session");
    let proxy = client.get_proxy_auto_disconnect("motor").await?;
    assert_eq!(proxy.get("position"), Some(HashValue::Double(2.0)));
    let watched = &proxy;
    assert!(eventually(Duration::from_secs(2), || async move { watched.is_subscribed() }).await);
    let subscribed_bindings = session.binding_count();

    // Left alone past the idle interval, the subscription goes.
    assert!(eventually(Duration::from_secs(3), || async move { !watched.is_subscribed() }).await);
    let bindings = &session;
    assert!(
        eventually(Duration::from_secs(1), || async move {
            bindings.binding_count() == subscribed_bindings - 1
        })
        .await
    );

    device.set("position", 9.0_f64);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!proxy.is_subscribed());

    // Reading again resubscribes and brings the mirror up to date.
    assert!(
        eventually(Duration::from_secs(2), || async move {
            watched.get("position") == Some(HashValue::Double(9.0)) && watched.is_subscribed()
        })
        .await
    );
    for _ in 0..50 {
        let _ = proxy.get("position");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.binding_count(), subscribed_bindings);

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}
