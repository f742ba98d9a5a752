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

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use karabo_reactive::pipeline::{ChannelHandler, DataHandler};
use karabo_reactive::prelude::*;
use karabo_test::prelude::*;
use tokio::sync::mpsc;

use crate::setup::*;

mod setup;

fn collect_into(tx: mpsc::UnboundedSender<(Hash, PipelineMeta)>) -> DataHandler {
    Arc::new(move |data, meta| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((data, meta));
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    })
}

fn count_into(counter: Arc<AtomicUsize>) -> ChannelHandler {
    Arc::new(move |_output| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    })
}

fn item(i: i32) -> Hash {
    Hash::new().with("i", i)
}

async fn wait_for_connections(output: &OutputChannel, count: usize) -> bool {
    eventually(Duration::from_secs(5), || async move { output.connections().len() == count }).await
}

#[karabo_test]
async fn copy_with_wait_delivers_everything_in_order() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("pipe-copy-wait");
    let source = start_instance(&broker, SignalSlotable::builder("source")).await;
    let output = source.add_output_channel("out").await?;
    let sink = start_instance(&broker, SignalSlotable::builder("sink")).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let eos = Arc::new(AtomicUsize::new(0));
    let connects = Arc::new(AtomicUsize::new(0));
    let input = sink.add_input_channel(
        InputChannel::builder("in")
            .connect_to("source:out")
            .on_slowness(Slowness::Wait)
            .on_data(collect_into(tx))
            .on_connect(count_into(connects.clone()))
            .on_end_of_stream(count_into(eos.clone())),
    )?;
    assert!(wait_for_connections(&output, 1).await);
    assert_eq!(input.connected_outputs(), vec!["source:out".to_string()]);

    let row = &output.connections()[0];
    assert_eq!(row.remote_id, "sink:in");
    assert_eq!(row.distribution, Distribution::Copy);
    assert_eq!(row.on_slowness, Slowness::Wait);
    assert_eq!(row.to_hash().get_str("memoryLocation"), Some("remote"));

    for i in 0..5 {
        output.write_data(item(i), Some(Timestamp::now().with_tid(100 + i as u64))).await;
    }
    output.write_end_of_stream().await;

    for i in 0..5 {
        let (data, meta) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("item arrives");
        assert_eq!(data.get("i"), Some(&HashValue::Int32(i)));
        assert_eq!(meta.source, "source:out");
        assert_eq!(meta.timestamp.map(|t| t.tid), Some(100 + i as u64));
    }
    let eos_ref = &eos;
    assert!(eventually(Duration::from_secs(2), || async move { eos_ref.load(Ordering::SeqCst) == 1 }).await);
    assert_eq!(connects.load(Ordering::SeqCst), 1);
    assert_eq!(input.stats().items_received(), 5);

    sink.shutdown().await;
    source.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn output_information_is_served_by_slots() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("pipe-info");
    let source = start_instance(&broker, SignalSlotable::builder("camera")).await;
    let output = source.add_output_channel("frames").await?;
    let client = start_instance(&broker, SignalSlotable::builder("info-client")).await;

    let reply = client
        .request(
            "camera",
            "slotGetOutputChannelInformation",
            vec![HashValue::from("frames"), HashValue::Int32(1)],
        )
        .await?;
    let answer = reply.hash(0).expect("reply Hash");
    assert_eq!(answer.get("success"), Some(&HashValue::Bool(true)));
    let info = answer.get_hash("info").expect("info");
    assert_eq!(info.get_str("connectionType"), Some("tcp"));
    assert_eq!(info.get("port").and_then(HashValue::as_u64), Some(u64::from(output.port())));

    let missing = client
        .request(
            "camera",
            "slotGetOutputChannelInformation",
            vec![HashValue::Hash(Hash::new().with("channelId", "nope"))],
        )
        .await?;
    assert_eq!(
        missing.hash(0).and_then(|h| h.get("success")),
        Some(&HashValue::Bool(false))
    );

    let names = client.request("camera", "slotGetOutputChannelNames", Vec::new()).await?;
    assert_eq!(names.single().and_then(HashValue::as_vec_string), Some(&["frames".to_string()][..]));

    client.shutdown().await;
    source.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn shared_inputs_split_the_stream() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("pipe-shared");
    let mut config = fast_config();
    config.pipeline.no_input_shared = "wait".to_string();
    let source = SignalSlotable::builder("producer")
        .connector(broker.clone())
        .config(config)
        .start()
        .await?;
    let output = source.add_output_channel("out").await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let eos = Arc::new(AtomicUsize::new(0));
    let mut workers = Vec::new();
    for name in ["worker-a", "worker-b"] {
        let worker = start_instance(&broker, SignalSlotable::builder(name)).await;
        worker.add_input_channel(
            InputChannel::builder("in")
                .connect_to("producer:out")
                .distribution(Distribution::Shared)
                .on_data(collect_into(tx.clone()))
                .on_end_of_stream(count_into(eos.clone())),
        )?;
        workers.push(worker);
    }
    assert!(wait_for_connections(&output, 2).await);

    for i in 0..10 {
        output.write_data(item(i), None).await;
    }
    output.write_end_of_stream().await;

    let mut seen = BTreeSet::new();
    for _ in 0..10 {
        let (data, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await?
            .expect("item arrives");
        let i = data.get("i").and_then(HashValue::as_i64).expect("i");
        assert!(seen.insert(i), "item {i} delivered twice");
    }
    assert_eq!(seen.len(), 10);
    let eos_ref = &eos;
    assert!(eventually(Duration::from_secs(2), || async move { eos_ref.load(Ordering::SeqCst) == 2 }).await);

    for worker in workers {
        worker.shutdown().await;
    }
    source.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn slow_copy_input_with_drop_misses_items() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("pipe-drop");
    let source = start_instance(&broker, SignalSlotable::builder("fast-source")).await;
    let output = source.add_output_channel("out").await?;
    let sink = start_instance(&broker, SignalSlotable::builder("slow-sink")).await;

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let slow: DataHandler = Arc::new(move |_data, _meta| {
        let counter = counter.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), anyhow::Error>(())
        }
        .boxed()
    });
    let eos = Arc::new(AtomicUsize::new(0));
    sink.add_input_channel(
        InputChannel::builder("in")
            .connect_to("fast-source:out")
            .on_slowness(Slowness::Drop)
            .on_data(slow)
            .on_end_of_stream(count_into(eos.clone())),
    )?;
    assert!(wait_for_connections(&output, 1).await);

    for i in 0..20 {
        output.write_data_no_wait(item(i), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    output.write_end_of_stream().await;

    let eos_ref = &eos;
    assert!(eventually(Duration::from_secs(4), || async move { eos_ref.load(Ordering::SeqCst) == 1 }).await);
    let got = received.load(Ordering::SeqCst);
    assert!(got >= 1, "nothing was delivered");
    assert!(got < 20, "a slow input with the drop policy received everything");
    assert_eq!(output.stats().items_written(), 20);

    sink.shutdown().await;
    source.shutdown().await;
    Ok(())
}

#[karabo_test]
async fn input_connects_once_the_output_appears() -> anyhow::Result<()> {
    initialize_tracing();
    let broker = broker("pipe-late");
    let sink = start_instance(&broker, SignalSlotable::builder("early-sink")).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let input = sink.add_input_channel(
        InputChannel::builder("in")
            .connect_to("late-source:out")
            .on_slowness(Slowness::Wait)
            .on_data(collect_into(tx)),
    )?;
    assert!(input.connect("no-colon").is_err());

    let input_ref = &input;
    assert!(
        eventually(Duration::from_secs(3), || async move {
            input_ref.missing_connections() == vec!["late-source:out".to_string()]
        })
        .await
    );

    let source = start_instance(&broker, SignalSlotable::builder("late-source")).await;
    let output = source.add_output_channel("out").await?;
    assert!(wait_for_connections(&output, 1).await);
    assert!(input.is_connected("late-source:out"));

    output.write_data(item(1), None).await;
    let (data, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await?
        .expect("item arrives");
    assert_eq!(data.get("i"), Some(&HashValue::Int32(1)));

    assert!(input.disconnect("late-source:out"));
    assert!(wait_for_connections(&output, 0).await);
    assert!(input.connected_outputs().is_empty());

    sink.shutdown().await;
    source.shutdown().await;
    Ok(())
}
