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
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use super::net::{resolve_hostname, tune};
use super::protocol::{
    encode_data, encode_end_of_stream, io_error, is_update, read_hash, Distribution, Hello, Item,
    Slowness,
};
use super::queue::ChunkQueue;
use crate::common::{KaraboError, PipelineConfig, Result};
use crate::hash::{Hash, Timestamp};
use crate::signalslot::{oneshot, OneShotSender, SignalSlotable};

type Batch = Arc<Vec<Item>>;

/// Largest control message an input may send.
const MAX_CONTROL_SIZE: usize = 64 * 1024;

/// Counters of an output channel.
#[derive(Debug, Default)]
pub struct OutputStats {
    connections_accepted: AtomicUsize,
    connections_active: AtomicUsize,
    frames_sent: AtomicUsize,
    items_written: AtomicUsize,
}

impl OutputStats {
    /// Inputs that connected so far.
    #[must_use]
    pub fn connections_accepted(&self) -> usize {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    /// Inputs currently connected.
    #[must_use]
    pub fn connections_active(&self) -> usize {
        self.connections_active.load(Ordering::Relaxed)
    }

    /// Frames written to sockets.
    #[must_use]
    pub fn frames_sent(&self) -> usize {
        self.frames_sent.load(Ordering::Relaxed)
    }

    /// Items handed to the channel.
    #[must_use]
    pub fn items_written(&self) -> usize {
        self.items_written.load(Ordering::Relaxed)
    }
}

/// One row of the connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEntry {
    /// `<instanceId>:<input>` of the connected input.
    pub remote_id: String,
    /// Distribution the input asked for.
    pub distribution: Distribution,
    /// Slowness policy the input asked for.
    pub on_slowness: Slowness,
    /// Always `remote` for TCP connections.
    pub memory_location: String,
    /// Peer address.
    pub remote_address: String,
    /// Peer port.
    pub remote_port: u16,
    /// Local address of the connection.
    pub local_address: String,
    /// Local port of the connection.
    pub local_port: u16,
}

impl ConnectionEntry {
    /// Table row as exposed in configurations.
    pub fn to_hash(&self) -> Hash {
        Hash::new()
            .with("remoteId", self.remote_id.as_str())
            .with("dataDistribution", self.distribution.as_str())
            .with("onSlowness", self.on_slowness.as_str())
            .with("memoryLocation", self.memory_location.as_str())
            .with("remoteAddress", self.remote_address.as_str())
            .with("remotePort", self.remote_port)
            .with("localAddress", self.local_address.as_str())
            .with("localPort", self.local_port)
    }
}

/// End-of-stream marks owed to a connection that has no queue of its own.
#[derive(Default)]
struct EosSignal {
    pending: AtomicUsize,
    wake: Notify,
}

impl EosSignal {
    fn raise(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.wake.notify_one();
    }

    fn take(&self) -> bool {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

async fn eos_raised(signal: Option<&EosSignal>) {
    match signal {
        Some(signal) => signal.wake.notified().await,
        None => std::future::pending().await,
    }
}

/// Where the serving task of one connection takes its next batch from.
enum Source {
    Shared,
    Waiter,
    Queue(Arc<ChunkQueue<Batch>>),
}

struct OutputInner {
    full_name: String,
    address: String,
    local: SocketAddr,
    config: PipelineConfig,
    no_input_shared: Slowness,
    shared: ChunkQueue<Batch>,
    shared_consumers: AtomicUsize,
    waiters: Mutex<Vec<OneShotSender<Batch>>>,
    copy_queues: Mutex<Vec<(u64, Arc<ChunkQueue<Batch>>)>>,
    wait_queues: Mutex<Vec<(u64, Arc<ChunkQueue<Batch>>)>>,
    eos_signals: DashMap<u64, Arc<EosSignal>>,
    connections: DashMap<u64, ConnectionEntry>,
    next_connection: AtomicU64,
    closed: CancellationToken,
    tasks: TaskTracker,
    stats: OutputStats,
}

/// Server side of a pipeline: a TCP listener that pushes Hashes to every
/// connected input according to the input's distribution and slowness
/// policy.
#[derive(Clone)]
pub struct OutputChannel(Arc<OutputInner>);

impl fmt::Debug for OutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputChannel")
            .field("name", &self.0.full_name)
            .field("local", &self.0.local)
            .field("connections", &self.0.connections.len())
            .finish_non_exhaustive()
    }
}

impl OutputChannel {
    /// Binds the listener and starts accepting inputs.
    ///
    /// `full_name` is `<instanceId>:<channel>`; it is sent as `source` of
    /// every item.
    #[instrument(skip(config))]
    pub async fn bind(full_name: &str, config: &PipelineConfig) -> Result<Self> {
        let address = resolve_hostname(&config.hostname)?;
        let no_input_shared: Slowness = config
            .no_input_shared
            .parse()
            .map_err(|_| KaraboError::Config(format!("bad noInputShared '{}'", config.no_input_shared)))?;
        let listener = TcpListener::bind((address.as_str(), config.port))
            .await
            .map_err(io_error)?;
        let local = listener.local_addr().map_err(io_error)?;
        let shared = match no_input_shared {
            Slowness::QueueDrop => ChunkQueue::ring(config.max_queue_length),
            Slowness::Drop | Slowness::Wait => ChunkQueue::bounded(1),
        };
        let output = Self(Arc::new(OutputInner {
            full_name: full_name.to_string(),
            address: if local.ip().is_unspecified() {
                address
            } else {
                local.ip().to_string()
            },
            local,
            config: config.clone(),
            no_input_shared,
            shared,
            shared_consumers: AtomicUsize::new(0),
            waiters: Mutex::new(Vec::new()),
            copy_queues: Mutex::new(Vec::new()),
            wait_queues: Mutex::new(Vec::new()),
            eos_signals: DashMap::new(),
            connections: DashMap::new(),
            next_connection: AtomicU64::new(1),
            closed: CancellationToken::new(),
            tasks: TaskTracker::new(),
            stats: OutputStats::default(),
        }));
        let accepting = output.clone();
        output
            .0
            .tasks
            .spawn(async move { accepting.accept_loop(listener).await });
        info!(channel = %full_name, %local, "Output channel listening");
        Ok(output)
    }

    /// `<instanceId>:<channel>`.
    pub fn full_name(&self) -> &str {
        &self.0.full_name
    }

    /// Address inputs are told to connect to.
    pub fn address(&self) -> &str {
        &self.0.address
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.0.local.port()
    }

    /// Counters.
    pub fn stats(&self) -> &OutputStats {
        &self.0.stats
    }

    /// Whether the output still accepts inputs.
    pub fn is_serving(&self) -> bool {
        !self.0.closed.is_cancelled()
    }

    /// What `slotGetOutputChannelInformation` reports.
    pub fn connection_info(&self) -> Hash {
        Hash::new()
            .with("connectionType", "tcp")
            .with("hostname", self.0.address.as_str())
            .with("port", u32::from(self.port()))
            .with("memoryLocation", "remote")
    }

    /// Current connection table.
    pub fn connections(&self) -> Vec<ConnectionEntry> {
        let mut rows: Vec<(u64, ConnectionEntry)> = self
            .0
            .connections
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rows.sort_by_key(|(id, _)| *id);
        rows.into_iter().map(|(_, row)| row).collect()
    }

    /// Sends `data` without waiting for any input.
    pub fn write_data_no_wait(&self, data: Hash, timestamp: Option<Timestamp>) {
        let batch = Arc::new(vec![Item::Data {
            data,
            timestamp: timestamp.unwrap_or_else(Timestamp::now),
        }]);
        self.0.stats.items_written.fetch_add(1, Ordering::Relaxed);
        self.distribute_no_wait(&batch);
    }

    /// Sends `data`, waiting for inputs with the `wait` policy.
    pub async fn write_data(&self, data: Hash, timestamp: Option<Timestamp>) {
        let batch = Arc::new(vec![Item::Data {
            data,
            timestamp: timestamp.unwrap_or_else(Timestamp::now),
        }]);
        self.0.stats.items_written.fetch_add(1, Ordering::Relaxed);
        self.distribute(batch).await;
    }

    /// Tells every connected input that the stream ended.
    ///
    /// Inputs with their own queue get the mark behind the data already
    /// queued for them; waits for inputs with the `wait` policy.
    pub async fn write_end_of_stream(&self) {
        let inner = &self.0;
        let eos: Batch = Arc::new(vec![Item::EndOfStream]);
        for signal in inner.eos_signals.iter() {
            signal.value().raise();
        }
        let rings: Vec<Arc<ChunkQueue<Batch>>> =
            inner.copy_queues.lock().iter().map(|(_, q)| q.clone()).collect();
        for queue in rings {
            queue.try_put(eos.clone());
        }
        let blocking: Vec<Arc<ChunkQueue<Batch>>> =
            inner.wait_queues.lock().iter().map(|(_, q)| q.clone()).collect();
        futures::future::join_all(blocking.into_iter().map(|queue| {
            let eos = eos.clone();
            async move {
                let _ = queue.put(eos).await;
            }
        }))
        .await;
        tokio::task::yield_now().await;
    }

    fn distribute_no_wait(&self, batch: &Batch) {
        let inner = &self.0;
        if inner.shared_consumers.load(Ordering::Acquire) > 0 && inner.no_input_shared != Slowness::Wait {
            inner.shared.try_put(batch.clone());
        }
        let waiters = std::mem::take(&mut *inner.waiters.lock());
        for waiter in waiters {
            waiter.deliver(batch.clone());
        }
        let queues: Vec<Arc<ChunkQueue<Batch>>> =
            inner.copy_queues.lock().iter().map(|(_, q)| q.clone()).collect();
        for queue in queues {
            queue.try_put(batch.clone());
        }
    }

    async fn distribute(&self, batch: Batch) {
        self.distribute_no_wait(&batch);
        let inner = &self.0;
        let mut blocking: Vec<Arc<ChunkQueue<Batch>>> =
            inner.wait_queues.lock().iter().map(|(_, q)| q.clone()).collect();
        let wait_shared =
            inner.shared_consumers.load(Ordering::Acquire) > 0 && inner.no_input_shared == Slowness::Wait;
        let puts = blocking.drain(..).map(|queue| {
            let batch = batch.clone();
            async move {
                let _ = queue.put(batch).await;
            }
        });
        let shared = async {
            if wait_shared {
                let _ = inner.shared.put(batch.clone()).await;
            }
        };
        futures::join!(futures::future::join_all(puts), shared);
        tokio::task::yield_now().await;
    }

    /// Stops accepting, ends every connection and waits for the tasks.
    pub async fn close(&self) {
        let inner = &self.0;
        if inner.closed.is_cancelled() {
            return;
        }
        inner.closed.cancel();
        inner.shared.cancel();
        inner.waiters.lock().clear();
        for (_, queue) in inner.copy_queues.lock().drain(..) {
            queue.cancel();
        }
        for (_, queue) in inner.wait_queues.lock().drain(..) {
            queue.cancel();
        }
        inner.tasks.close();
        inner.tasks.wait().await;
        debug!(channel = %inner.full_name, "Output channel closed");
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                biased;

                () = self.0.closed.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.0.next_connection.fetch_add(1, Ordering::Relaxed);
                        self.0.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        trace!(channel = %self.0.full_name, %peer, id, "Accepted input");
                        let serving = self.clone();
                        self.0.tasks.spawn(async move { serving.serve(stream, peer, id).await });
                    }
                    Err(e) => {
                        error!(channel = %self.0.full_name, error = %e, "Failed to accept input");
                    }
                },
            }
        }
    }

    #[instrument(skip(self, stream), fields(channel = %self.0.full_name))]
    async fn serve(self, stream: TcpStream, peer: SocketAddr, id: u64) {
        let inner = &self.0;
        if let Err(e) = tune(&stream, &inner.config) {
            warn!(error = %e, "Could not tune pipeline socket");
        }
        let local = stream.local_addr().ok();
        let (mut reader, mut writer) = stream.into_split();

        let default_length = u32::try_from(inner.config.max_queue_length).unwrap_or(u32::MAX);
        let hello = tokio::select! {
            () = inner.closed.cancelled() => return,
            message = read_hash(&mut reader, MAX_CONTROL_SIZE) => match message {
                Ok(Some(hash)) => match Hello::from_hash(&hash, default_length) {
                    Ok(hello) => hello,
                    Err(e) => {
                        warn!(%peer, error = %e, "Rejected pipeline connection");
                        return;
                    }
                },
                Ok(None) => return,
                Err(e) => {
                    debug!(%peer, error = %e, "Input left before greeting");
                    return;
                }
            },
        };
        let queue_length = (hello.max_queue_length as usize)
            .min(inner.config.max_queue_length)
            .max(1);
        inner.connections.insert(
            id,
            ConnectionEntry {
                remote_id: hello.instance_id.clone(),
                distribution: hello.distribution,
                on_slowness: hello.on_slowness,
                memory_location: "remote".to_string(),
                remote_address: peer.ip().to_string(),
                remote_port: peer.port(),
                local_address: local.map(|a| a.ip().to_string()).unwrap_or_default(),
                local_port: local.map_or(0, |a| a.port()),
            },
        );
        inner.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!(remote = %hello.instance_id, distribution = %hello.distribution,
               slowness = %hello.on_slowness, "Input connected");

        let source = match (hello.distribution, hello.on_slowness) {
            (Distribution::Shared, _) => {
                inner.shared_consumers.fetch_add(1, Ordering::AcqRel);
                Source::Shared
            }
            (Distribution::Copy, Slowness::Drop) => Source::Waiter,
            (Distribution::Copy, Slowness::QueueDrop) => {
                let queue = Arc::new(ChunkQueue::ring(queue_length));
                inner.copy_queues.lock().push((id, queue.clone()));
                Source::Queue(queue)
            }
            (Distribution::Copy, Slowness::Wait) => {
                let queue = Arc::new(ChunkQueue::bounded(1));
                inner.wait_queues.lock().push((id, queue.clone()));
                Source::Queue(queue)
            }
        };

        let eos = match source {
            Source::Shared | Source::Waiter => {
                let signal = Arc::new(EosSignal::default());
                inner.eos_signals.insert(id, signal.clone());
                Some(signal)
            }
            Source::Queue(_) => None,
        };

        let (acks_tx, mut acks) = mpsc::unbounded_channel();
        let closed = inner.closed.clone();
        let remote = hello.instance_id.clone();
        inner.tasks.spawn(async move {
            loop {
                let message = tokio::select! {
                    () = closed.cancelled() => break,
                    message = read_hash(&mut reader, MAX_CONTROL_SIZE) => message,
                };
                match message {
                    Ok(Some(hash)) if is_update(&hash) => {
                        if acks_tx.send(()).is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) => warn!(remote = %remote, "Unexpected message from input"),
                    Ok(None) => break,
                    Err(e) => {
                        debug!(remote = %remote, error = %e, "Input connection failed");
                        break;
                    }
                }
            }
        });

        if let Err(e) = self.pump(&source, eos.as_deref(), &mut writer, &mut acks).await {
            debug!(remote = %hello.instance_id, error = %e, "Stopped serving input");
        }
        let _ = writer.shutdown().await;

        match &source {
            Source::Shared => {
                if inner.shared_consumers.fetch_sub(1, Ordering::AcqRel) == 1 {
                    inner.shared.clear();
                }
            }
            Source::Waiter => {}
            Source::Queue(queue) => {
                inner.copy_queues.lock().retain(|(qid, _)| *qid != id);
                inner.wait_queues.lock().retain(|(qid, _)| *qid != id);
                queue.cancel();
            }
        }
        inner.eos_signals.remove(&id);
        inner.connections.remove(&id);
        inner.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        debug!(remote = %hello.instance_id, "Input disconnected");
    }

    async fn next_batch(&self, source: &Source) -> Result<Batch> {
        match source {
            Source::Shared => self.0.shared.get().await,
            Source::Queue(queue) => queue.get().await,
            Source::Waiter => {
                let (sender, receiver) = oneshot();
                self.0.waiters.lock().push(sender);
                receiver.wait().await
            }
        }
    }

    /// Writes batches to one input, one acknowledgement per frame.
    async fn pump(
        &self,
        source: &Source,
        eos: Option<&EosSignal>,
        writer: &mut OwnedWriteHalf,
        acks: &mut mpsc::UnboundedReceiver<()>,
    ) -> Result<()> {
        let closed = &self.0.closed;
        loop {
            let batch = if eos.is_some_and(EosSignal::take) {
                Arc::new(vec![Item::EndOfStream])
            } else {
                tokio::select! {
                    biased;
                    () = closed.cancelled() => return Ok(()),
                    ack = acks.recv() => match ack {
                        Some(()) => continue,
                        None => return Ok(()),
                    },
                    () = eos_raised(eos) => continue,
                    batch = self.next_batch(source) => batch?,
                }
            };

            let mut frames = 0usize;
            let mut out = Vec::new();
            if let Some(data) = encode_data(&batch, &self.0.full_name) {
                out.extend_from_slice(&data);
                frames += 1;
            }
            for _ in batch.iter().filter(|item| matches!(item, Item::EndOfStream)) {
                out.extend_from_slice(&encode_end_of_stream());
                frames += 1;
            }
            writer.write_all(&out).await.map_err(io_error)?;
            self.0.stats.frames_sent.fetch_add(frames, Ordering::Relaxed);

            for _ in 0..frames {
                tokio::select! {
                    biased;
                    () = closed.cancelled() => return Ok(()),
                    ack = acks.recv() => if ack.is_none() {
                        return Ok(());
                    },
                }
            }
        }
    }
}

impl SignalSlotable {
    /// Binds an output channel `name` owned by this instance.
    ///
    /// The channel is announced through `slotGetOutputChannelInformation`
    /// and closed at shutdown.
    pub async fn add_output_channel(&self, name: &str) -> Result<OutputChannel> {
        if self.0.outputs.contains_key(name) {
            return Err(KaraboError::Config(format!("output channel '{name}' exists")));
        }
        let full_name = format!("{}:{name}", self.instance_id());
        let output = OutputChannel::bind(&full_name, &self.config().pipeline).await?;
        self.0.outputs.insert(name.to_string(), output.clone());
        Ok(output)
    }

    /// The output channel called `name`.
    pub fn output_channel(&self, name: &str) -> Option<OutputChannel> {
        self.0.outputs.get(name).map(|e| e.value().clone())
    }

    /// Closes and forgets the output channel `name`.
    pub async fn remove_output_channel(&self, name: &str) -> bool {
        let Some((_, output)) = self.0.outputs.remove(name) else {
            return false;
        };
        output.close().await;
        true
    }
}
