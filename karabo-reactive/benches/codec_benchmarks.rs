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

//! Benchmarks for the hot paths of karabo-reactive.
//!
//! - Binary Hash encoding and decoding
//! - Pipeline frame encoding
//! - Request-reply latency over the in-process broker
//!
//! Run with: `cargo bench --package karabo-reactive`

use std::hint::black_box;
use std::sync::Arc;

use divan::{AllocProfiler, Bencher};
use karabo_reactive::hash::{codec, NDArray};
use karabo_reactive::pipeline::protocol::{encode_data, Item};
use karabo_reactive::prelude::*;

// Enable allocation tracking
#[global_allocator]
static ALLOC: AllocProfiler = AllocProfiler::system();

fn main() {
    divan::main();
}

/// A device configuration of `leaves` scalar properties with timestamps.
fn configuration(leaves: usize) -> Hash {
    let now = Timestamp::now();
    let mut hash = Hash::new();
    for i in 0..leaves {
        hash.set_element(&format!("node{}.value{i}", i % 8), i as f64, now.to_attributes());
    }
    hash
}

/// A detector image of `pixels` doubles.
fn image(pixels: usize) -> Hash {
    let mut hash = Hash::new().with("frame", 1_u64);
    let values: Vec<f64> = (0..pixels).map(|p| p as f64).collect();
    NDArray::from_f64(&values, vec![pixels as u64]).store(&mut hash, "data.image");
    hash
}

// =============================================================================
// Hash codec
// =============================================================================

/// Encoding configurations of growing size.
#[divan::bench(args = [10, 100, 1000])]
fn encode_configuration(bencher: Bencher<'_, '_>, leaves: usize) {
    let hash = configuration(leaves);
    bencher.bench_local(|| black_box(codec::encode(black_box(&hash))));
}

/// Decoding configurations of growing size.
#[divan::bench(args = [10, 100, 1000])]
fn decode_configuration(bencher: Bencher<'_, '_>, leaves: usize) {
    let bytes = codec::encode(&configuration(leaves));
    bencher.bench_local(|| black_box(codec::decode(black_box(&bytes)).unwrap()));
}

// =============================================================================
// Pipeline frames
// =============================================================================

/// Encoding one data frame carrying an image.
#[divan::bench(args = [1024, 65_536, 1_048_576])]
fn encode_frame(bencher: Bencher<'_, '_>, pixels: usize) {
    let items = vec![Item::Data {
        data: image(pixels),
        timestamp: Timestamp::now(),
    }];
    bencher.bench_local(|| black_box(encode_data(black_box(&items), "camera:output")));
}

// =============================================================================
// Request-reply latency
// =============================================================================

/// One `slotPing` round trip between two instances on the in-process broker.
#[divan::bench]
fn request_round_trip(bencher: Bencher<'_, '_>) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let (server, client) = rt.block_on(async {
        let broker = Arc::new(Connector::in_memory("bench", "karabo-bench").unwrap());
        let mut config = KaraboConfig::default();
        config.timeouts.ping_ms = 100;
        let server = SignalSlotable::builder("bench-server")
            .connector(broker.clone())
            .config(config.clone())
            .start()
            .await
            .unwrap();
        let client = SignalSlotable::builder("bench-client")
            .connector(broker)
            .config(config)
            .start()
            .await
            .unwrap();
        (server, client)
    });

    bencher.bench_local(|| {
        rt.block_on(async {
            let reply = client
                .request("bench-server", "slotPing", vec![HashValue::Int32(1)])
                .await
                .unwrap();
            black_box(reply);
        });
    });

    rt.block_on(async {
        client.shutdown().await;
        server.shutdown().await;
    });
}
