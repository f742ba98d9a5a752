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
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument};

use super::net::tune;
use super::protocol::{
    decode_frame, io_error, read_hash, read_message, update_message, write_hash, Distribution,
    Frame, Hello, PipelineMeta, Slowness,
};
use crate::common::{KaraboError, PipelineConfig, Result};
use crate::hash::{Hash, HashValue};
use crate::signalslot::{SignalSlotable, WeakInstance};

/// Receives each Hash arriving on an input.
pub type DataHandler =
    Arc<dyn Fn(Hash, PipelineMeta) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Receives the `<instanceId>:<channel>` of an output on connect, close or
/// end of stream.
pub type ChannelHandler = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Counters of an input channel.
#[derive(Debug, Default)]
pub struct InputStats {
    frames_received: AtomicUsize,
    items_received: AtomicUsize,
    end_of_streams: AtomicUsize,
    reconnects: AtomicUsize,
}

impl InputStats {
    /// Data frames read.
    #[must_use]
    pub fn frames_received(&self) -> usize {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Hashes handed to the data handler.
    #[must_use]
    pub fn items_received(&self) -> usize {
        self.items_received.load(Ordering::Relaxed)
    }

    /// End-of-stream markers seen.
    #[must_use]
    pub fn end_of_streams(&self) -> usize {
        self.end_of_streams.load(Ordering::Relaxed)
    }

    /// Reconnection attempts.
    #[must_use]
    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::Relaxed)
    }
}

/// Settings and handlers of an [`InputChannel`].
#[derive(Clone)]
pub struct InputBuilder {
    name: String,
    distribution: Distribution,
    on_slowness: Slowness,
    max_queue_length: Option<u32>,
    delay_on_input: Duration,
    outputs: Vec<String>,
    on_data: Option<DataHandler>,
    on_connect: Option<ChannelHandler>,
    on_close: Option<ChannelHandler>,
    on_end_of_stream: Option<ChannelHandler>,
}

impl fmt::Debug for InputBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputBuilder")
            .field("name", &self.name)
            .field("distribution", &self.distribution)
            .field("on_slowness", &self.on_slowness)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

impl InputBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            distribution: Distribution::Copy,
            on_slowness: Slowness::Drop,
            max_queue_length: None,
            delay_on_input: Duration::ZERO,
            outputs: Vec::new(),
            on_data: None,
            on_connect: None,
            on_close: None,
            on_end_of_stream: None,
        }
    }

    /// `shared` or `copy` (default).
    pub fn distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    /// Policy for copy distribution, `drop` by default.
    pub fn on_slowness(mut self, on_slowness: Slowness) -> Self {
        self.on_slowness = on_slowness;
        self
    }

    /// Ring size requested for `queueDrop`; the output may lower it.
    pub fn max_queue_length(mut self, length: u32) -> Self {
        self.max_queue_length = Some(length.max(1));
        self
    }

    /// Pause after each frame before reading the next one.
    pub fn delay_on_input(mut self, delay: Duration) -> Self {
        self.delay_on_input = delay;
        self
    }

    /// Output to connect to right away, as `<instanceId>:<channel>`.
    pub fn connect_to(mut self, output: &str) -> Self {
        self.outputs.push(output.trim().to_string());
        self
    }

    /// Handler for incoming data.
    pub fn on_data(mut self, handler: DataHandler) -> Self {
        self.on_data = Some(handler);
        self
    }

    /// Handler run once a connection to an output stands.
    pub fn on_connect(mut self, handler: ChannelHandler) -> Self {
        self.on_connect = Some(handler);
        self
    }

    /// Handler run when a connection ends.
    pub fn on_close(mut self, handler: ChannelHandler) -> Self {
        self.on_close = Some(handler);
        self
    }

    /// Handler run when an output signals end of stream.
    pub fn on_end_of_stream(mut self, handler: ChannelHandler) -> Self {
        self.on_end_of_stream = Some(handler);
        self
    }
}

struct InputInner {
    name: String,
    instance_id: String,
    owner: WeakInstance,
    settings: InputBuilder,
    max_queue_length: u32,
    config: PipelineConfig,
    request_timeout: Duration,
    handler_lock: Arc<tokio::sync::Mutex<()>>,
    connected: DashMap<String, CancellationToken>,
    missing: Mutex<BTreeSet<String>>,
    closed: CancellationToken,
    tasks: TaskTracker,
    stats: InputStats,
}

/// Client side of a pipeline.
///
/// Keeps one connection task per configured output. A task asks the
/// output's instance where to connect, greets the output, then reads
/// frames until the stream ends, and starts over after the reconnect
/// delay. Handlers run one at a time, each bounded by the handler timeout,
/// and are not interrupted when a connection is cancelled.
#[derive(Clone)]
pub struct InputChannel(Arc<InputInner>);

impl fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputChannel")
            .field("instance_id", &self.0.instance_id)
            .field("connected", &self.connected_outputs())
            .field("missing", &self.missing_connections())
            .finish_non_exhaustive()
    }
}

impl InputChannel {
    /// Starts describing an input called `name`.
    pub fn builder(name: &str) -> InputBuilder {
        InputBuilder::new(name)
    }

    fn new(owner: &SignalSlotable, settings: InputBuilder) -> Self {
        let config = owner.config().pipeline.clone();
        let max_queue_length = settings
            .max_queue_length
            .unwrap_or_else(|| u32::try_from(config.max_queue_length).unwrap_or(u32::MAX));
        Self(Arc::new(InputInner {
            name: settings.name.clone(),
            instance_id: format!("{}:{}", owner.instance_id(), settings.name),
            owner: owner.downgrade(),
            settings,
            max_queue_length,
            config,
            request_timeout: owner.config().timeouts.request(),
            handler_lock: Arc::new(tokio::sync::Mutex::new(())),
            connected: DashMap::new(),
            missing: Mutex::new(BTreeSet::new()),
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stats: InputStats::default(),
        }))
    }

    /// Name of the input on its instance.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// `<instanceId>:<name>`, the id outputs see.
    pub fn instance_id(&self) -> &str {
        &self.0.instance_id
    }

    /// Counters.
    pub fn stats(&self) -> &InputStats {
        &self.0.stats
    }

    /// Outputs this input is configured for, sorted.
    pub fn connected_outputs(&self) -> Vec<String> {
        let mut outputs: Vec<String> = self.0.connected.iter().map(|e| e.key().clone()).collect();
        outputs.sort();
        outputs
    }

    /// Configured outputs without a standing connection.
    pub fn missing_connections(&self) -> Vec<String> {
        self.0.missing.lock().iter().cloned().collect()
    }

    /// Whether a connection to `output` currently stands.
    pub fn is_connected(&self, output: &str) -> bool {
        self.0.connected.contains_key(output) && !self.0.missing.lock().contains(output)
    }

    fn set_missing(&self, output: &str, missing: bool) {
        let mut set = self.0.missing.lock();
        if missing {
            set.insert(output.to_string());
        } else {
            set.remove(output);
        }
    }

    /// Starts receiving from `output` (`<instanceId>:<channel>`).
    ///
    /// Connecting to an output that is already configured does nothing.
    pub fn connect(&self, output: &str) -> Result<()> {
        let output = output.trim();
        match output.split_once(':') {
            Some((instance, channel)) if !instance.is_empty() && !channel.is_empty() => {}
            _ => {
                return Err(KaraboError::Config(format!(
                    "'{output}' is not of the form <instanceId>:<channel>"
                )))
            }
        }
        if self.0.closed.is_cancelled() {
            return Err(KaraboError::Cancelled);
        }
        let token = match self.0.connected.entry(output.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Ok(()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let token = self.0.closed.child_token();
                slot.insert(token.clone());
                token
            }
        };
        self.set_missing(output, true);
        let input = self.clone();
        let output = output.to_string();
        self.0
            .tasks
            .spawn(async move { input.run_connection(output, token).await });
        Ok(())
    }

    /// Stops receiving from `output`; `false` if it was not configured.
    pub fn disconnect(&self, output: &str) -> bool {
        match self.0.connected.remove(output) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Ends every connection and waits for the connection tasks.
    pub async fn close(&self) {
        if self.0.closed.is_cancelled() {
            return;
        }
        self.0.closed.cancel();
        self.0.tasks.close();
        self.0.tasks.wait().await;
        self.0.connected.clear();
        debug!(input = %self.0.instance_id, "Input channel closed");
    }

    #[instrument(skip(self, token), fields(input = %self.0.instance_id))]
    async fn run_connection(self, output: String, token: CancellationToken) {
        loop {
            let mut connected = false;
            let outcome = tokio::select! {
                () = token.cancelled() => None,
                result = self.stream(&output, &mut connected) => Some(result),
            };
            self.set_missing(&output, true);
            if connected {
                self.notify(self.0.settings.on_close.as_ref(), &output).await;
            }
            match outcome {
                None => break,
                Some(Ok(())) => info!(%output, "Stream finished"),
                Some(Err(e)) => info!(%output, error = %e, "Channel did not close gracefully"),
            }
            self.0.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(self.0.config.reconnect()) => {}
            }
        }
        self.0
            .connected
            .remove_if(&output, |_, current| current.is_cancelled());
        self.set_missing(&output, false);
    }

    /// One connection to `output`, until the output closes it.
    async fn stream(&self, output: &str, connected: &mut bool) -> Result<()> {
        let owner = self.0.owner.upgrade().ok_or(KaraboError::NotConnected)?;
        let (instance, channel) = output
            .split_once(':')
            .ok_or_else(|| KaraboError::Config(output.to_string()))?;
        debug!(output, "Trying to connect");
        let pid = i32::try_from(std::process::id()).unwrap_or_default();
        let reply = owner
            .call_once_alive(
                instance,
                "slotGetOutputChannelInformation",
                vec![HashValue::from(channel), HashValue::Int32(pid)],
                self.0.request_timeout,
            )
            .await?;
        drop(owner);
        let info = reply
            .hash(0)
            .filter(|r| r.get("success").and_then(HashValue::as_bool).unwrap_or(false))
            .and_then(|r| r.get_hash("info"))
            .ok_or_else(|| KaraboError::NotFound(format!("output channel {output}")))?;
        let host = info
            .get_str("hostname")
            .ok_or_else(|| KaraboError::Protocol(format!("{output} sent no hostname")))?
            .to_string();
        let port = info
            .get("port")
            .and_then(HashValue::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| KaraboError::Protocol(format!("{output} sent no port")))?;

        let stream = TcpStream::connect((host.as_str(), port)).await.map_err(io_error)?;
        tune(&stream, &self.0.config)?;
        let (mut reader, mut writer) = stream.into_split();
        self.set_missing(output, false);
        *connected = true;
        self.notify(self.0.settings.on_connect.as_ref(), output).await;

        let hello = Hello {
            instance_id: self.0.instance_id.clone(),
            distribution: self.0.settings.distribution,
            on_slowness: self.0.settings.on_slowness,
            max_queue_length: self.0.max_queue_length,
        };
        write_hash(&mut writer, &hello.to_hash()).await?;
        let update = update_message(&self.0.instance_id);
        let limit = self.0.config.max_frame_size;
        loop {
            let Some(header) = read_hash(&mut reader, limit).await? else {
                return Ok(());
            };
            let body = read_message(&mut reader, limit)
                .await?
                .ok_or_else(|| KaraboError::Protocol("stream closed before frame body".into()))?;
            write_hash(&mut writer, &update).await?;
            match decode_frame(&header, &body)? {
                Frame::EndOfStream => {
                    self.0.stats.end_of_streams.fetch_add(1, Ordering::Relaxed);
                    self.notify(self.0.settings.on_end_of_stream.as_ref(), output).await;
                }
                Frame::Data(items) => {
                    self.0.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    for (data, meta) in items {
                        self.0.stats.items_received.fetch_add(1, Ordering::Relaxed);
                        if let Some(handler) = &self.0.settings.on_data {
                            self.run_handler("data", handler(data, meta)).await;
                        }
                    }
                }
            }
            if !self.0.settings.delay_on_input.is_zero() {
                tokio::time::sleep(self.0.settings.delay_on_input).await;
            }
        }
    }

    async fn notify(&self, handler: Option<&ChannelHandler>, output: &str) {
        if let Some(handler) = handler {
            self.run_handler("channel", handler(output.to_string())).await;
        }
    }

    /// Runs a handler under the handler lock and timeout. The handler
    /// keeps running if the caller is cancelled.
    async fn run_handler(&self, kind: &'static str, fut: BoxFuture<'static, anyhow::Result<()>>) {
        let lock = self.0.handler_lock.clone();
        let limit = self.0.config.handler_timeout();
        let input = self.0.instance_id.clone();
        let task = self.0.tasks.spawn(async move {
            let _guard = lock.lock_owned().await;
            match tokio::time::timeout(limit, fut).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(%input, kind, error = %format!("{e:#}"), "Error in stream handler"),
                Err(_) => error!(%input, kind, "Timeout in stream handler"),
            }
        });
        let _ = task.await;
    }
}

impl SignalSlotable {
    /// Creates the input described by `settings` and connects it to its
    /// configured outputs. It is closed at shutdown.
    pub fn add_input_channel(&self, settings: InputBuilder) -> Result<InputChannel> {
        if self.0.inputs.contains_key(&settings.name) {
            return Err(KaraboError::Config(format!("input channel '{}' exists", settings.name)));
        }
        let outputs = settings.outputs.clone();
        let input = InputChannel::new(self, settings);
        for output in &outputs {
            input.connect(output)?;
        }
        self.0.inputs.insert(input.name().to_string(), input.clone());
        Ok(input)
    }

    /// The input channel called `name`.
    pub fn input_channel(&self, name: &str) -> Option<InputChannel> {
        self.0.inputs.get(name).map(|e| e.value().clone())
    }
}
