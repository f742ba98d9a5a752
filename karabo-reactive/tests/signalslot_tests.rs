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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use karabo_reactive::common::BrokerSession;
use karabo_reactive::prelude::*;
use karabo_reactive::signalslot::Lifecycle;
use parking_lot::Mutex;
use karabo_test::prelude::*;
use tokio::sync::mpsc;

use crate::setup::*;

mod setup;

fn device_schema() -> Schema {
    Schema::builder("TestDevice")
        .element(Element::leaf("readOnlyProp", TypeCode::Int32).read_only().default_value(0_i32))
        .element(Element::leaf("value", TypeCode::Int32).reconfigurable().default_value(0_i32))
        .build()
}

#[karabo_test]
async fn duplicate_instance_id_is_refused() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-duplicate");
    let first = start_instance(&broker, SignalSlotable::builder("dup")).await;

    let second = SignalSlotable::builder("dup")
        .connector(broker.clone())
        .config(fast_config())
        .start()
        .await;
    assert_eq!(second.unwrap_err(), KaraboError::AlreadyInUse("dup".to_string()));

    // The first instance is untouched by the failed attempt.
    assert!(first.is_running());
    let client = start_instance(&broker, SignalSlotable::builder("dup-client")).await;
    let reply = client
        .request_with_timeout("dup", "slotPing", vec![HashValue::Int32(1)], Duration::from_secs(1))
        .await?;
    assert!(reply.hash(0).is_some());

    client.shutdown().await;
    first.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn read_only_reconfiguration_is_an_error_reply() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-readonly");
    let device = start_instance(&broker, SignalSlotable::builder("ro-device").schema(device_schema())).await;
    let client = start_instance(&broker, SignalSlotable::builder("ro-client")).await;

    let rejected = client
        .request(
            "ro-device",
            "slotReconfigure",
            vec![HashValue::Hash(Hash::new().with("readOnlyProp", 5_i32))],
        )
        .await;
    match rejected {
        Err(KaraboError::Remote { text, .. }) => assert!(text.contains("readOnlyProp"), "{text}"),
        other => panic!("expected an error reply, got {other:?}"),
    }
    assert_eq!(device.get("readOnlyProp"), Some(HashValue::Int32(0)));

    client
        .request(
            "ro-device",
            "slotReconfigure",
            vec![HashValue::Hash(Hash::new().with("value", 7_i32))],
        )
        .await?;
    assert_eq!(device.get("value"), Some(HashValue::Int32(7)));

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn unknown_slot_is_reported_to_the_caller() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-unknown");
    let device = start_instance(&broker, SignalSlotable::builder("plain")).await;
    let client = start_instance(&broker, SignalSlotable::builder("plain-client")).await;

    let err = client
        .request("plain", "slotDoesNotExist", Vec::new())
        .await
        .unwrap_err();
    match err {
        KaraboError::Remote { text, .. } => assert!(text.contains("slotDoesNotExist"), "{text}"),
        other => panic!("expected an error reply, got {other:?}"),
    }

    let missing = client
        .request_with_timeout("nobody-home", "slotPing", Vec::new(), Duration::from_millis(200))
        .await;
    assert!(matches!(missing, Err(KaraboError::Timeout(_))));

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn user_slots_reply_and_failures_become_error_replies() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-user-slots");
    let device = start_instance(
        &broker,
        SignalSlotable::builder("calc")
            .slot(
                "slotAdd",
                SlotHandler::sync(|call| {
                    let a = call.arg(0)?.as_i64().unwrap_or_default();
                    let b = call.arg(1)?.as_i64().unwrap_or_default();
                    Ok(HashValue::Int64(a + b))
                }),
            )
            .slot(
                "slotSlowEcho",
                SlotHandler::cooperative(|call| async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(HashValue::from(call.str_arg(0)?))
                }),
            )
            .slot(
                "slotFail",
                SlotHandler::sync(|_call| -> anyhow::Result<()> { anyhow::bail!("deliberate failure") }),
            ),
    )
    .await;
    let client = start_instance(&broker, SignalSlotable::builder("calc-client")).await;

    let sum = client
        .request("calc", "slotAdd", vec![HashValue::Int32(2), HashValue::Int32(40)])
        .await?;
    assert_eq!(sum.single(), Some(&HashValue::Int64(42)));

    let echo = client
        .request("calc", "slotSlowEcho", vec![HashValue::from("hello")])
        .await?;
    assert_eq!(echo.single().and_then(HashValue::as_str), Some("hello"));

    let err = client.request("calc", "slotFail", Vec::new()).await.unwrap_err();
    assert!(matches!(err, KaraboError::Remote { ref text, .. } if text.contains("deliberate failure")));

    assert_eq!(
        client.broadcast("slotAdd", Vec::new()).await,
        Err(KaraboError::NotBroadcastable("slotAdd".to_string()))
    );

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn locked_device_refuses_other_callers() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-lock");
    let device = start_instance(&broker, SignalSlotable::builder("lockable").schema(device_schema())).await;
    let client = start_instance(&broker, SignalSlotable::builder("lock-client")).await;
    device.set("lockedBy", "operator");

    let refused = client
        .request(
            "lockable",
            "slotReconfigure",
            vec![HashValue::Hash(Hash::new().with("value", 1_i32))],
        )
        .await
        .unwrap_err();
    match refused {
        KaraboError::Remote { text, .. } => assert!(text.contains("operator"), "{text}"),
        other => panic!("expected a lock refusal, got {other:?}"),
    }
    assert_eq!(device.get("value"), Some(HashValue::Int32(0)));

    // Clearing the lock is always allowed.
    client.request("lockable", "slotClearLock", Vec::new()).await?;
    client
        .request(
            "lockable",
            "slotReconfigure",
            vec![HashValue::Hash(Hash::new().with("value", 1_i32))],
        )
        .await?;
    assert_eq!(device.get("value"), Some(HashValue::Int32(1)));

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn bulk_changes_are_emitted_per_train_in_order() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-bulk");
    let device = start_instance(&broker, SignalSlotable::builder("trains")).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Hash>();
    let listener = start_instance(
        &broker,
        SignalSlotable::builder("train-listener").slot(
            "slotOnChanged",
            SlotHandler::sync(move |call| {
                let _ = tx.send(call.hash_arg(0)?.clone());
                Ok(())
            }),
        ),
    )
    .await;
    listener.connect("trains", "signalChanged", "slotOnChanged").await?;

    let batch = device.batch();
    device.set_with_timestamp("b", 2_i32, Timestamp::now().with_tid(11));
    device.set_with_timestamp("a", 1_i32, Timestamp::now().with_tid(10));
    device.set_with_timestamp("c", 3_i32, Timestamp::now().with_tid(11));
    batch.commit();

    let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("first bucket");
    let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("second bucket");
    assert_eq!(first.keys().collect::<Vec<_>>(), vec!["a"]);
    assert_eq!(second.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    assert_eq!(second.get_attribute("b", "tid").and_then(HashValue::as_u64), Some(11));

    listener.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn changes_of_one_synchronous_slot_arrive_together() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-slot-batch");
    let device = start_instance(
        &broker,
        SignalSlotable::builder("stage").slot(
            "slotMoveBoth",
            SlotHandler::sync(|call| {
                call.instance.set("x", 1_i32);
                call.instance.set("y", 2_i32);
                call.instance.set("z", 3_i32);
                Ok(())
            }),
        ),
    )
    .await;
    let (tx, mut rx) = mpsc::unbounded_channel::<Hash>();
    let listener = start_instance(
        &broker,
        SignalSlotable::builder("stage-listener").slot(
            "slotOnChanged",
            SlotHandler::sync(move |call| {
                let _ = tx.send(call.hash_arg(0)?.clone());
                Ok(())
            }),
        ),
    )
    .await;
    listener.connect("stage", "signalChanged", "slotOnChanged").await?;

    listener.request("stage", "slotMoveBoth", Vec::new()).await?;
    let changes = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("changes");
    assert!(["x", "y", "z"].iter().all(|key| changes.contains(key)), "{changes:?}");
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());

    listener.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn kill_device_replies_and_shuts_down() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-kill");
    let device = start_instance(&broker, SignalSlotable::builder("doomed")).await;
    let client = start_instance(&broker, SignalSlotable::builder("killer")).await;

    let reply = client.request("doomed", "slotKillDevice", Vec::new()).await?;
    assert!(reply.is_empty());
    tokio::time::timeout(Duration::from_secs(3), device.wait_until_killed()).await?;
    assert_eq!(device.lifecycle(), Lifecycle::Killed);

    let after = client
        .request_with_timeout("doomed", "slotPing", Vec::new(), Duration::from_millis(200))
        .await;
    assert!(matches!(after, Err(KaraboError::Timeout(_))));

    client.shutdown().await;
    Ok(())
}

#[derive(Default)]
struct HookCounts {
    exceptions: AtomicUsize,
    cancelled: AtomicUsize,
    slots: Mutex<Vec<String>>,
}

struct CountingHooks(Arc<HookCounts>);

#[async_trait]
impl InstanceHooks for CountingHooks {
    async fn on_exception(&self, _instance: &SignalSlotable, slot: &str, error: &anyhow::Error, _traceback: &str) {
        assert!(error.to_string().contains("motor stalled"), "{error}");
        self.0.exceptions.fetch_add(1, Ordering::SeqCst);
        self.0.slots.lock().push(slot.to_string());
    }

    async fn on_cancelled(&self, _instance: &SignalSlotable, slot: &str) {
        self.0.cancelled.fetch_add(1, Ordering::SeqCst);
        self.0.slots.lock().push(slot.to_string());
    }
}

#[karabo_test]
async fn failing_cooperative_slot_reports_once() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-hook-exception");
    let counts = Arc::new(HookCounts::default());
    let device = start_instance(
        &broker,
        SignalSlotable::builder("stalling")
            .hooks(CountingHooks(counts.clone()))
            .slot(
                "slotMove",
                SlotHandler::cooperative(|_call| async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err::<(), _>(anyhow::anyhow!("motor stalled"))
                }),
            ),
    )
    .await;
    let client = start_instance(&broker, SignalSlotable::builder("stalling-client")).await;

    let err = client.request("stalling", "slotMove", Vec::new()).await.unwrap_err();
    assert!(matches!(err, KaraboError::Remote { ref text, .. } if text.contains("motor stalled")));

    let seen = &counts;
    assert!(eventually(Duration::from_secs(2), || async move { seen.exceptions.load(Ordering::SeqCst) == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counts.exceptions.load(Ordering::SeqCst), 1);
    assert_eq!(counts.cancelled.load(Ordering::SeqCst), 0);
    assert_eq!(*counts.slots.lock(), vec!["slotMove".to_string()]);

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn pending_cooperative_slot_is_cancelled_once_at_shutdown() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-hook-cancel");
    let counts = Arc::new(HookCounts::default());
    let (started_tx, mut started) = mpsc::unbounded_channel::<()>();
    let device = start_instance(
        &broker,
        SignalSlotable::builder("waiting")
            .hooks(CountingHooks(counts.clone()))
            .slot(
                "slotWaitForever",
                SlotHandler::cooperative(move |_call| {
                    let started_tx = started_tx.clone();
                    async move {
                        let _ = started_tx.send(());
                        std::future::pending::<()>().await;
                        Ok::<(), anyhow::Error>(())
                    }
                }),
            ),
    )
    .await;
    let client = start_instance(&broker, SignalSlotable::builder("waiting-client")).await;

    client.call("waiting", "slotWaitForever", Vec::new()).await?;
    tokio::time::timeout(Duration::from_secs(2), started.recv()).await?.expect("slot started");

    assert!(device.shutdown().await);
    let seen = &counts;
    assert!(eventually(Duration::from_secs(2), || async move { seen.cancelled.load(Ordering::SeqCst) == 1 }).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counts.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(counts.exceptions.load(Ordering::SeqCst), 0);
    assert_eq!(*counts.slots.lock(), vec!["slotWaitForever".to_string()]);

    client.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn kill_device_still_replies_when_tasks_do_not_drain() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-kill-undrained");
    let (started_tx, mut started) = mpsc::unbounded_channel::<()>();
    let device = start_instance(
        &broker,
        SignalSlotable::builder("stubborn").slot(
            "slotBlock",
            SlotHandler::cooperative(move |_call| {
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    // Never reaches a suspension point before the drain limit.
                    tokio::task::block_in_place(|| std::thread::sleep(Duration::from_millis(1_500)));
                    Ok::<(), anyhow::Error>(())
                }
            }),
        ),
    )
    .await;
    let client = start_instance(&broker, SignalSlotable::builder("stubborn-killer")).await;

    client.call("stubborn", "slotBlock", Vec::new()).await?;
    tokio::time::timeout(Duration::from_secs(2), started.recv()).await?.expect("slot started");

    let reply = client
        .request_with_timeout("stubborn", "slotKillDevice", Vec::new(), Duration::from_secs(5))
        .await?;
    assert!(reply.is_empty());
    tokio::time::timeout(Duration::from_secs(3), device.wait_until_killed()).await?;
    assert_eq!(device.lifecycle(), Lifecycle::Killed);
    assert!(!device.shutdown().await);

    client.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn late_replies_are_counted_and_dropped() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-late-reply");
    let device = start_instance(
        &broker,
        SignalSlotable::builder("sluggish").slot(
            "slotSlow",
            SlotHandler::cooperative(|_call| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(HashValue::Int32(1))
            }),
        ),
    )
    .await;
    let client = start_instance(&broker, SignalSlotable::builder("impatient")).await;
    let session = client.broker_session().expect("client has a session");
    assert_eq!(session.stats().late_replies(), 0);

    let timed_out = client
        .request_with_timeout("sluggish", "slotSlow", Vec::new(), Duration::from_millis(50))
        .await;
    assert!(matches!(timed_out, Err(KaraboError::Timeout(_))), "{timed_out:?}");
    assert_eq!(session.pending_requests(), 0);

    let stats = &session;
    assert!(eventually(Duration::from_secs(2), || async move { stats.stats().late_replies() == 1 }).await);
    assert_eq!(session.pending_requests(), 0);

    client.shutdown().await;
    device.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn connect_and_disconnect_share_one_binding_per_signal() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-bindings");
    let emitter = start_instance(&broker, SignalSlotable::builder("emitter")).await;
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
    let (tx_a, tx_b) = (tx.clone(), tx);
    let listener = start_instance(
        &broker,
        SignalSlotable::builder("receiver")
            .slot(
                "slotA",
                SlotHandler::sync(move |_call| {
                    let _ = tx_a.send("a");
                    Ok(())
                }),
            )
            .slot(
                "slotB",
                SlotHandler::sync(move |_call| {
                    let _ = tx_b.send("b");
                    Ok(())
                }),
            ),
    )
    .await;
    let session = listener.broker_session().expect("listener has a session");
    let baseline = session.binding_count();

    listener.connect("emitter", "signalTick", "slotA").await?;
    listener.connect("emitter", "signalTick", "slotB").await?;
    listener.connect("emitter", "signalTick", "slotB").await?;
    assert_eq!(session.binding_count(), baseline + 1);

    listener.disconnect("emitter", "signalTick", "slotA").await?;
    assert_eq!(session.binding_count(), baseline + 1);
    emitter.emit("signalTick", Vec::new());
    let only = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?.expect("slotB fired");
    assert_eq!(only, "b");

    listener.disconnect("emitter", "signalTick", "slotB").await?;
    assert_eq!(session.binding_count(), baseline);
    emitter.emit("signalTick", Vec::new());
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());

    listener.shutdown().await;
    emitter.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn taken_queue_name_gets_a_suffix() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("ss-queue-suffix");
    let config = fast_config();
    let first = BrokerSession::open(broker.clone(), "twin", "Twin", false, &config).await?;
    let second = BrokerSession::open(broker.clone(), "twin", "Twin", false, &config).await?;

    assert_eq!(first.queue_name(), "karabo-tests.twin");
    let suffixed = second.queue_name();
    assert!(suffixed.starts_with("karabo-tests.twin:"), "{suffixed}");
    assert!(suffixed.len() > "karabo-tests.twin:".len());
    assert_ne!(first.queue_name(), suffixed);

    second.close().await?;
    first.close().await?;
    Ok(())
}
