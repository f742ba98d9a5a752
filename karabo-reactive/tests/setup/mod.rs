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
#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::Duration;

use karabo_reactive::prelude::*;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Ensures tracing initialization happens only once across all tests.
static INIT: Once = Once::new();

/// Initializes the global tracing subscriber for tests.
///
/// Output goes to `logs/karabo_tests.txt` so that failing runs can be
/// inspected without flooding the test harness.
pub fn initialize_tracing() {
    INIT.call_once(|| {
        std::fs::create_dir_all("logs").expect("could not create logs dir");

        let file_appender = RollingFileAppender::new(Rotation::NEVER, "logs", "karabo_tests.txt");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard so the non-blocking writer is not dropped before process exit
        Box::leak(Box::new(guard));

        let filter = EnvFilter::new("debug")
            .add_directive("karabo_reactive::signalslot=trace".parse().unwrap())
            .add_directive("karabo_reactive::proxy=trace".parse().unwrap())
            .add_directive("karabo_reactive::pipeline=trace".parse().unwrap())
            .add_directive("karabo_reactive::heartbeat=trace".parse().unwrap())
            .add_directive("karabo_reactive::common::transport=debug".parse().unwrap())
            .add_directive("tokio=info".parse().unwrap());

        let subscriber = FmtSubscriber::builder()
            .with_span_events(FmtSpan::NONE)
            .with_max_level(Level::TRACE)
            .compact()
            .with_line_number(true)
            .without_time()
            .with_target(true)
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .finish();

        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    });
}

/// A connector to the in-process broker `name`. Instances built with
/// connectors of the same name see each other.
pub fn broker(name: &str) -> Arc<Connector> {
    Arc::new(Connector::in_memory(name, "karabo-tests").expect("valid memory connector"))
}

/// Configuration with deadlines short enough for tests.
pub fn fast_config() -> KaraboConfig {
    let mut config = KaraboConfig::default();
    config.timeouts.ping_ms = 200;
    config.timeouts.pre_initialization_ms = 1_000;
    config.timeouts.on_destruction_ms = 1_000;
    config.timeouts.task_drain_ms = 1_000;
    config.timeouts.request_ms = 2_000;
    config.timeouts.schema_ms = 2_000;
    config.heartbeat.interval_secs = 1;
    config.heartbeat.tick_interval_ms = 200;
    config.proxy.auto_disconnect_ms = 300;
    config.pipeline.hostname = "127.0.0.1".to_string();
    config.pipeline.reconnect_ms = 100;
    config.pipeline.handler_timeout_ms = 2_000;
    config
}

/// Builds and starts an instance on `broker` with the test configuration.
pub async fn start_instance(broker: &Arc<Connector>, builder: InstanceBuilder) -> SignalSlotable {
    builder
        .connector(broker.clone())
        .config(fast_config())
        .start()
        .await
        .expect("instance starts")
}

/// Polls `condition` every 20 ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
