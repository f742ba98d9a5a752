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
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use regex::Regex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::common::{
    BrokerSession, Connector, InboundHandler, InboundKind, KaraboConfig, KaraboError, Result,
    BROADCAST_SLOTS, CONFIG,
};
use crate::hash::{Attributes, Element, Hash, HashValue, Node, Schema, Timestamp, TypeCode};
use crate::heartbeat::{TopologyCallback, TopologyTracker};
use crate::message::{Message, Reply};
use crate::pipeline::{InputChannel, OutputChannel};
use crate::proxy::ProxyRegistry;
use crate::signalslot::builtin;
use crate::signalslot::info::{InstanceInfo, InstanceType};
use crate::signalslot::oneshot::{oneshot, OneShotSender};
use crate::signalslot::slots::{SlotCall, SlotEntry, SlotHandler, SlotReply};
use crate::signalslot::tasks::TaskSet;
use crate::signalslot::timer::{AsyncTimer, WeakTimer};
use crate::signalslot::updates::{BulkUpdate, UpdateBuffer};
use crate::traits::{InstanceHooks, NoHooks};

lazy_static! {
    static ref INSTANCE_ID: Option<Regex> = Regex::new(r"^[A-Za-z0-9_/-]+$").ok();
}

/// Slot clearing the lock; never refused because of it.
pub(crate) const CLEAR_LOCK_SLOT: &str = "slotClearLock";
/// Slot applying a reconfiguration.
pub(crate) const RECONFIGURE_SLOT: &str = "slotReconfigure";

/// Checks that `id` is usable as an instance id.
pub fn validate_instance_id(id: &str) -> Result<()> {
    let valid = INSTANCE_ID.as_ref().is_some_and(|re| re.is_match(id));
    if valid {
        Ok(())
    } else {
        Err(KaraboError::Validation(format!("invalid instance id '{id}'")))
    }
}

/// Where an instance is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Built or starting.
    Instantiating = 0,
    /// Up and announced.
    Running = 1,
    /// Shut down.
    Killed = 2,
}

impl Lifecycle {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Instantiating,
            1 => Self::Running,
            _ => Self::Killed,
        }
    }
}

/// Work for the ordered outbox of an instance.
pub(crate) enum Outgoing {
    Emit { signal: String, args: Vec<HashValue> },
    Call { target: String, slot: String, args: Vec<HashValue> },
    Broadcast { slot: String, args: Vec<HashValue> },
    Reply { message: Arc<Message>, values: Vec<HashValue> },
    ReplyError { message: Arc<Message>, text: String, details: String },
    Barrier(OneShotSender<()>),
}

/// The schema every instance starts from.
pub(crate) fn base_schema(class_id: &str) -> Schema {
    Schema::builder(class_id)
        .element(Element::leaf("deviceId", TypeCode::String).init_only())
        .element(Element::leaf("classId", TypeCode::String).read_only())
        .element(Element::leaf("serverId", TypeCode::String).read_only())
        .element(Element::leaf("heartbeatInterval", TypeCode::UInt32).init_only())
        .element(
            Element::leaf("lockedBy", TypeCode::String)
                .reconfigurable()
                .default_value(""),
        )
        .element(
            Element::leaf("state", TypeCode::String)
                .read_only()
                .default_value("UNKNOWN"),
        )
        .element(
            Element::leaf("lastCommand", TypeCode::String)
                .read_only()
                .default_value(""),
        )
        .element(Element::slot(CLEAR_LOCK_SLOT))
        .build()
}

/// Builder for a [`SignalSlotable`].
pub struct InstanceBuilder {
    instance_id: String,
    class_id: String,
    instance_type: InstanceType,
    server_id: Option<String>,
    connector: Option<Arc<Connector>>,
    config: Option<KaraboConfig>,
    schema: Option<Schema>,
    configuration: Hash,
    hooks: Arc<dyn InstanceHooks>,
    slots: Vec<(String, SlotHandler)>,
    broadcast: bool,
    track_topology: bool,
    heartbeat_interval: Option<u32>,
    on_topology_change: Option<TopologyCallback>,
}

impl fmt::Debug for InstanceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceBuilder")
            .field("instance_id", &self.instance_id)
            .field("class_id", &self.class_id)
            .field("instance_type", &self.instance_type)
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

impl InstanceBuilder {
    fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            class_id: "SignalSlotable".to_string(),
            instance_type: InstanceType::Device,
            server_id: None,
            connector: None,
            config: None,
            schema: None,
            configuration: Hash::new(),
            hooks: Arc::new(NoHooks),
            slots: Vec::new(),
            broadcast: true,
            track_topology: false,
            heartbeat_interval: None,
            on_topology_change: None,
        }
    }

    /// Class of the instance.
    #[must_use]
    pub fn class_id(mut self, class_id: &str) -> Self {
        self.class_id = class_id.to_string();
        self
    }

    /// Kind announced in the instance info.
    #[must_use]
    pub fn instance_type(mut self, instance_type: InstanceType) -> Self {
        self.instance_type = instance_type;
        self
    }

    /// Server hosting the instance.
    #[must_use]
    pub fn server_id(mut self, server_id: &str) -> Self {
        self.server_id = Some(server_id.to_string());
        self
    }

    /// Broker connector; defaults to one built from the configuration.
    #[must_use]
    pub fn connector(mut self, connector: Arc<Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Configuration; defaults to the process-wide [`CONFIG`].
    #[must_use]
    pub fn config(mut self, config: KaraboConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Schema merged onto the built-in properties.
    #[must_use]
    pub fn schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Initial values, applied over the schema defaults.
    #[must_use]
    pub fn configuration(mut self, configuration: Hash) -> Self {
        self.configuration = configuration;
        self
    }

    /// Life-cycle hooks.
    #[must_use]
    pub fn hooks(mut self, hooks: impl InstanceHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Registers a slot.
    #[must_use]
    pub fn slot(mut self, name: &str, handler: SlotHandler) -> Self {
        self.slots.push((name.to_string(), handler));
        self
    }

    /// Whether the instance listens to broadcasts. On by default.
    #[must_use]
    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.broadcast = enabled;
        self
    }

    /// Keeps a topology view fed by heartbeats.
    #[must_use]
    pub fn track_topology(mut self, enabled: bool) -> Self {
        self.track_topology = enabled;
        self
    }

    /// Called once per tracker tick that changed the topology.
    #[must_use]
    pub fn on_topology_change(mut self, callback: TopologyCallback) -> Self {
        self.track_topology = true;
        self.on_topology_change = Some(callback);
        self
    }

    /// Heartbeat interval in seconds; defaults to the configuration.
    #[must_use]
    pub fn heartbeat_interval(mut self, secs: u32) -> Self {
        self.heartbeat_interval = Some(secs);
        self
    }

    /// Validates the settings and creates the (not yet started) instance.
    pub fn build(self) -> Result<SignalSlotable> {
        validate_instance_id(&self.instance_id)?;
        let config = self.config.unwrap_or_else(|| CONFIG.clone());
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(Connector::from_config(&config.broker)?),
        };
        let heartbeat_interval = self
            .heartbeat_interval
            .unwrap_or_else(|| u32::try_from(config.heartbeat.interval_secs).unwrap_or(u32::MAX));

        let mut schema = base_schema(&self.class_id);
        if let Some(user) = &self.schema {
            schema.merge(user);
        }

        let now = Timestamp::now();
        let mut configuration = schema.default_configuration();
        configuration.merge(&self.configuration);
        configuration.set("deviceId", self.instance_id.as_str());
        configuration.set("classId", self.class_id.as_str());
        configuration.set("serverId", self.server_id.clone().unwrap_or_default());
        configuration.set("heartbeatInterval", heartbeat_interval);
        for path in configuration.paths() {
            if let Some(node) = configuration.get_node_mut(&path) {
                if !node.attrs.contains("sec") {
                    now.apply_to(&mut node.attrs);
                }
            }
        }

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let mut info = InstanceInfo::new(self.instance_type, &self.class_id, &host, heartbeat_interval);
        if let Some(server_id) = &self.server_id {
            info = info.server_id(server_id);
        }

        let tracker = self.track_topology.then(|| {
            Arc::new(TopologyTracker::new(
                &config.heartbeat,
                self.on_topology_change.clone(),
            ))
        });

        let slots = DashMap::new();
        for (name, handler) in self.slots {
            slots.insert(
                name,
                SlotEntry {
                    handler,
                    lockable: true,
                },
            );
        }

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (alive, _) = broadcast::channel(64);
        let inner = Arc::new_cyclic(|me| InstanceInner {
            me: me.clone(),
            instance_id: self.instance_id,
            class_id: self.class_id,
            instance_type: self.instance_type,
            server_id: self.server_id,
            heartbeat_interval,
            broadcast: self.broadcast,
            connector,
            config,
            hooks: self.hooks,
            session: RwLock::new(None),
            slots,
            schema: RwLock::new(schema),
            configuration: RwLock::new(configuration),
            info: RwLock::new(info.into_hash()),
            nonce: AtomicI32::new(0),
            updates: Mutex::new(UpdateBuffer::default()),
            flush_scheduled: AtomicBool::new(false),
            batch_depth: AtomicUsize::new(0),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
            tasks: TaskSet::new(),
            timers: Mutex::new(Vec::new()),
            proxies: ProxyRegistry::default(),
            outputs: DashMap::new(),
            inputs: DashMap::new(),
            tracker,
            alive,
            lifecycle: AtomicU8::new(Lifecycle::Instantiating as u8),
            announced: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            closed: CancellationToken::new(),
            killed: CancellationToken::new(),
        });
        builtin::register(&inner);
        Ok(SignalSlotable(inner))
    }

    /// Builds and starts the instance.
    pub async fn start(self) -> Result<SignalSlotable> {
        let instance = self.build()?;
        instance.start().await?;
        Ok(instance)
    }
}

pub(crate) struct InstanceInner {
    me: Weak<InstanceInner>,
    pub(crate) instance_id: String,
    pub(crate) class_id: String,
    pub(crate) instance_type: InstanceType,
    pub(crate) server_id: Option<String>,
    pub(crate) heartbeat_interval: u32,
    broadcast: bool,
    pub(crate) connector: Arc<Connector>,
    pub(crate) config: KaraboConfig,
    pub(crate) hooks: Arc<dyn InstanceHooks>,
    session: RwLock<Option<Arc<BrokerSession>>>,
    pub(crate) slots: DashMap<String, SlotEntry>,
    schema: RwLock<Schema>,
    configuration: RwLock<Hash>,
    info: RwLock<Hash>,
    nonce: AtomicI32,
    updates: Mutex<UpdateBuffer>,
    flush_scheduled: AtomicBool,
    batch_depth: AtomicUsize,
    outbox: mpsc::UnboundedSender<Outgoing>,
    outbox_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    pub(crate) tasks: TaskSet,
    timers: Mutex<Vec<WeakTimer>>,
    pub(crate) proxies: ProxyRegistry,
    pub(crate) outputs: DashMap<String, OutputChannel>,
    pub(crate) inputs: DashMap<String, InputChannel>,
    pub(crate) tracker: Option<Arc<TopologyTracker>>,
    pub(crate) alive: broadcast::Sender<String>,
    lifecycle: AtomicU8,
    announced: AtomicBool,
    stopping: AtomicBool,
    drained: AtomicBool,
    closed: CancellationToken,
    killed: CancellationToken,
}

impl InstanceInner {
    fn handle(&self) -> Option<SignalSlotable> {
        self.me.upgrade().map(SignalSlotable)
    }

    pub(crate) fn send(&self, outgoing: Outgoing) {
        if self.outbox.send(outgoing).is_err() {
            trace!(instance_id = %self.instance_id, "Outbox closed");
        }
    }

    pub(crate) fn nonce(&self) -> i32 {
        self.nonce.load(Ordering::Acquire)
    }

    pub(crate) fn locked_by_other(&self, caller: &str) -> Option<String> {
        let configuration = self.configuration.read();
        match configuration.get_str("lockedBy") {
            Some(locker) if !locker.is_empty() && locker != caller => Some(locker.to_string()),
            _ => None,
        }
    }

    fn finish(&self, instance: &SignalSlotable, slot: &str, message: &Arc<Message>, result: anyhow::Result<SlotReply>) {
        match result {
            Ok(reply) => {
                if let Some(values) = reply.into_values() {
                    self.send(Outgoing::Reply {
                        message: message.clone(),
                        values,
                    });
                }
            }
            Err(err) => {
                let (text, details) = KaraboError::reply_parts(&err);
                error!(
                    slot,
                    instance_id = %self.instance_id,
                    caller = %message.sender(),
                    error = %text,
                    "Slot failed"
                );
                self.send(Outgoing::ReplyError {
                    message: message.clone(),
                    text,
                    details: details.clone(),
                });
                let hooks = self.hooks.clone();
                let instance = instance.clone();
                let slot = slot.to_string();
                tokio::spawn(async move {
                    hooks.on_exception(&instance, &slot, &err, &details).await;
                });
            }
        }
    }

    fn run_slot(&self, instance: &SignalSlotable, name: String, entry: SlotEntry, message: &Arc<Message>) {
        let call = SlotCall {
            instance: instance.clone(),
            slot: name.clone(),
            message: message.clone(),
            args: message.args(),
        };
        match entry.handler {
            SlotHandler::Sync(f) => {
                let result = f(call);
                self.finish(instance, &name, message, result);
            }
            SlotHandler::Cooperative(f) => {
                let owned = self.tasks.spawn(f(call));
                let instance = instance.clone();
                let message = message.clone();
                self.tasks.spawn_shielded(async move {
                    let inner = &instance.0;
                    match owned.await {
                        Ok(Some(result)) => inner.finish(&instance, &name, &message, result),
                        Ok(None) => {
                            debug!(slot = %name, instance_id = %inner.instance_id, "Slot cancelled");
                            inner.send(Outgoing::ReplyError {
                                message: message.clone(),
                                text: KaraboError::Cancelled.to_string(),
                                details: String::new(),
                            });
                            inner.hooks.on_cancelled(&instance, &name).await;
                        }
                        Err(join) => {
                            let err = anyhow::anyhow!("slot '{name}' panicked: {join}");
                            inner.finish(&instance, &name, &message, Err(err));
                        }
                    }
                });
            }
        }
    }
}

impl InboundHandler for InstanceInner {
    fn dispatch(&self, message: Message, slots: Vec<String>, kind: InboundKind) {
        let Some(instance) = self.handle() else {
            return;
        };
        let message = Arc::new(message);
        let resolved: Vec<(String, Option<SlotEntry>)> = slots
            .into_iter()
            .map(|name| {
                let entry = self.slots.get(&name).map(|e| e.value().clone());
                (name, entry)
            })
            .collect();

        if kind == InboundKind::Direct {
            if let Some((missing, _)) = resolved.iter().find(|(_, entry)| entry.is_none()) {
                let err = KaraboError::UnknownSlot {
                    instance_id: self.instance_id.clone(),
                    slot: missing.clone(),
                };
                warn!(caller = %message.sender(), "{err}");
                self.send(Outgoing::ReplyError {
                    message,
                    text: err.to_string(),
                    details: String::new(),
                });
                return;
            }
        }

        // Changes made by synchronous slots go out together once the
        // message is dispatched.
        let _batch = instance.batch();
        let clears_lock = resolved.iter().any(|(name, _)| name == CLEAR_LOCK_SLOT);
        for (name, entry) in resolved {
            let Some(entry) = entry else {
                trace!(slot = %name, ?kind, "No such slot, skipped");
                continue;
            };
            if entry.lockable && kind == InboundKind::Direct && !clears_lock {
                if let Some(locker) = self.locked_by_other(message.sender()) {
                    let err = KaraboError::Locked(locker);
                    debug!(slot = %name, caller = %message.sender(), "{err}");
                    self.send(Outgoing::ReplyError {
                        message: message.clone(),
                        text: err.to_string(),
                        details: String::new(),
                    });
                    continue;
                }
            }
            if entry.lockable && name != RECONFIGURE_SLOT && self.schema.read().slots().contains(&name) {
                instance.set("lastCommand", name.as_str());
            }
            self.run_slot(&instance, name, entry, &message);
        }
    }

    fn heartbeat(&self, instance_id: String, info: Hash) {
        if let (Some(tracker), Some(instance)) = (&self.tracker, self.handle()) {
            tracker.beat(&instance, &instance_id, &info);
        }
    }
}

async fn drain_outbox(
    session: Arc<BrokerSession>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    closed: CancellationToken,
) {
    loop {
        let outgoing = tokio::select! {
            biased;
            () = closed.cancelled() => break,
            outgoing = rx.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
        };
        let result = match outgoing {
            Outgoing::Emit { signal, args } => session.emit(&signal, args).await,
            Outgoing::Call { target, slot, args } => session.call(&target, &slot, args).await,
            Outgoing::Broadcast { slot, args } => session.broadcast(&slot, args).await,
            Outgoing::Reply { message, values } => session.reply(&message, values).await,
            Outgoing::ReplyError {
                message,
                text,
                details,
            } => session.reply_error(&message, &text, &details).await,
            Outgoing::Barrier(done) => {
                done.deliver(());
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(instance_id = %session.instance_id(), error = %e, "Outgoing message lost");
        }
    }
    trace!(instance_id = %session.instance_id(), "Outbox stopped");
}

/// A live network endpoint: slots, signals, properties and life cycle.
///
/// Cloning is cheap; all clones refer to the same instance. Build one with
/// [`SignalSlotable::builder`], then [`start`](Self::start) it.
#[derive(Clone)]
pub struct SignalSlotable(pub(crate) Arc<InstanceInner>);

impl fmt::Debug for SignalSlotable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalSlotable")
            .field("instance_id", &self.0.instance_id)
            .field("class_id", &self.0.class_id)
            .field("lifecycle", &self.lifecycle())
            .field("slots", &self.0.slots.len())
            .field("tasks", &self.0.tasks.len())
            .finish_non_exhaustive()
    }
}

/// Non-owning handle to a [`SignalSlotable`].
#[derive(Clone, Debug, Default)]
pub struct WeakInstance(Weak<InstanceInner>);

impl fmt::Debug for InstanceInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceInner")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl WeakInstance {
    /// The instance, if it still exists.
    pub fn upgrade(&self) -> Option<SignalSlotable> {
        self.0.upgrade().map(SignalSlotable)
    }
}

impl SignalSlotable {
    /// Starts building an instance named `instance_id`.
    pub fn builder(instance_id: &str) -> InstanceBuilder {
        InstanceBuilder::new(instance_id)
    }

    /// Non-owning handle.
    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance(Arc::downgrade(&self.0))
    }

    /// The unique id.
    pub fn instance_id(&self) -> &str {
        &self.0.instance_id
    }

    /// The class id.
    pub fn class_id(&self) -> &str {
        &self.0.class_id
    }

    /// Kind of instance.
    pub fn instance_type(&self) -> InstanceType {
        self.0.instance_type
    }

    /// Server hosting the instance, if any.
    pub fn server_id(&self) -> Option<&str> {
        self.0.server_id.as_deref()
    }

    /// The configuration the instance runs with.
    pub fn config(&self) -> &KaraboConfig {
        &self.0.config
    }

    /// The broker connector.
    pub fn connector(&self) -> &Arc<Connector> {
        &self.0.connector
    }

    /// Current life-cycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.0.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.0.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    /// Whether the instance is up.
    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Running
    }

    /// Tasks owned by the instance; they are cancelled at shutdown.
    pub fn tasks(&self) -> &TaskSet {
        &self.0.tasks
    }

    pub(crate) fn session(&self) -> Result<Arc<BrokerSession>> {
        self.0.session.read().clone().ok_or(KaraboError::NotConnected)
    }

    /// The broker session, once started.
    pub fn broker_session(&self) -> Option<Arc<BrokerSession>> {
        self.0.session.read().clone()
    }

    // --- properties ---

    /// Copy of the instance info.
    pub fn info(&self) -> Hash {
        self.0.info.read().clone()
    }

    /// Merges `update` into the instance info and broadcasts
    /// `slotInstanceUpdated`.
    pub fn update_instance_info(&self, update: &Hash) {
        let info = {
            let mut info = self.0.info.write();
            info.merge(update);
            info.clone()
        };
        if self.0.announced.load(Ordering::Acquire) {
            self.0.send(Outgoing::Broadcast {
                slot: "slotInstanceUpdated".to_string(),
                args: vec![HashValue::from(self.instance_id()), HashValue::Hash(info)],
            });
        }
    }

    /// Copy of the schema.
    pub fn schema(&self) -> Schema {
        self.0.schema.read().clone()
    }

    /// Merges `schema` into the current one, adds defaults of new
    /// properties and emits `signalSchemaUpdated`.
    pub fn set_schema(&self, schema: &Schema) {
        let merged = {
            let mut current = self.0.schema.write();
            current.merge(schema);
            current.clone()
        };
        {
            let defaults = merged.default_configuration();
            let now = Timestamp::now();
            let mut configuration = self.0.configuration.write();
            for path in defaults.paths() {
                if !configuration.contains(&path) {
                    if let Some(value) = defaults.get(&path) {
                        configuration.set_element(&path, value.clone(), now.to_attributes());
                    }
                }
            }
        }
        self.emit(
            "signalSchemaUpdated",
            vec![HashValue::Schema(merged), HashValue::from(self.instance_id())],
        );
    }

    /// Copy of the live configuration.
    pub fn configuration(&self) -> Hash {
        self.0.configuration.read().clone()
    }

    /// Current value of a property.
    pub fn get(&self, path: &str) -> Option<HashValue> {
        self.0.configuration.read().get(path).cloned()
    }

    /// Timestamp of a property.
    pub fn timestamp(&self, path: &str) -> Option<Timestamp> {
        self.0
            .configuration
            .read()
            .get_attributes(path)
            .and_then(Timestamp::from_attributes)
    }

    /// Sets a property stamped with the current time.
    ///
    /// Inside a synchronous slot the change is emitted together with every
    /// other change of that call. Elsewhere, in cooperative slots or
    /// spawned tasks, it goes out with a deferred flush that may run on
    /// another worker thread at any time, so changes that must arrive in one
    /// `signalChanged` have to be made inside [`batch`](Self::batch).
    pub fn set(&self, path: &str, value: impl Into<HashValue>) {
        self.set_with_timestamp(path, value, Timestamp::now());
    }

    /// Sets a property with an explicit timestamp (and train id).
    pub fn set_with_timestamp(&self, path: &str, value: impl Into<HashValue>, timestamp: Timestamp) {
        let node = {
            let mut configuration = self.0.configuration.write();
            let mut attrs = configuration
                .get_attributes(path)
                .cloned()
                .unwrap_or_else(Attributes::new);
            timestamp.apply_to(&mut attrs);
            let node = Node::with_attrs(value, attrs);
            configuration.set_node(path, node.clone());
            node
        };
        self.0.updates.lock().stage(path, node);
        self.schedule_flush();
    }

    /// Sets every leaf of `changes` at once. Leaves without timestamp
    /// attributes get the current time.
    pub fn set_hash(&self, changes: &Hash) {
        let now = Timestamp::now();
        {
            let mut configuration = self.0.configuration.write();
            let mut updates = self.0.updates.lock();
            for path in changes.paths() {
                let Some(node) = changes.get_node(&path) else {
                    continue;
                };
                let mut node = node.clone();
                if !node.attrs.contains("sec") {
                    now.apply_to(&mut node.attrs);
                }
                configuration.set_node(&path, node.clone());
                updates.stage(&path, node);
            }
        }
        self.schedule_flush();
    }

    /// Opens a scope in which changes are only staged.
    pub fn batch(&self) -> BulkUpdate {
        BulkUpdate::new(self.clone())
    }

    pub(crate) fn enter_batch(&self) {
        self.0.batch_depth.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn leave_batch(&self) {
        if self.0.batch_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.update();
        }
    }

    fn schedule_flush(&self) {
        if self.0.batch_depth.load(Ordering::Acquire) > 0 {
            return;
        }
        if self.0.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let instance = self.clone();
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    instance.0.flush_scheduled.store(false, Ordering::Release);
                    instance.update();
                });
            }
            Err(_) => {
                self.0.flush_scheduled.store(false, Ordering::Release);
                self.update();
            }
        }
    }

    /// Emits every staged change now: one `signalChanged` per train id,
    /// ascending.
    pub fn update(&self) {
        let buckets = self.0.updates.lock().take_buckets();
        for (tid, changes) in buckets {
            trace!(tid, changed = changes.len(), "Flushing changes");
            self.emit(
                "signalChanged",
                vec![HashValue::Hash(changes), HashValue::from(self.instance_id())],
            );
        }
    }

    // --- slots and messaging ---

    /// Registers (or replaces) a slot at runtime.
    pub fn register_slot(&self, name: &str, handler: SlotHandler) {
        self.0.slots.insert(
            name.to_string(),
            SlotEntry {
                handler,
                lockable: true,
            },
        );
    }

    /// Whether a slot of that name exists.
    pub fn has_slot(&self, name: &str) -> bool {
        self.0.slots.contains_key(name)
    }

    /// Emits a signal. Ordered with every other outgoing message of this
    /// instance.
    pub fn emit(&self, signal: &str, args: Vec<HashValue>) {
        self.0.send(Outgoing::Emit {
            signal: signal.to_string(),
            args,
        });
    }

    /// Fire-and-forget call, queued behind earlier outgoing messages.
    pub fn call_no_wait(&self, target: &str, slot: &str, args: Vec<HashValue>) {
        self.0.send(Outgoing::Call {
            target: target.to_string(),
            slot: slot.to_string(),
            args,
        });
    }

    /// Fire-and-forget call, published right away.
    pub async fn call(&self, target: &str, slot: &str, args: Vec<HashValue>) -> Result<()> {
        self.session()?.call(target, slot, args).await
    }

    /// Calls `slot` on every instance accepting broadcasts. Only the
    /// life-cycle slots may be broadcast.
    pub async fn broadcast(&self, slot: &str, args: Vec<HashValue>) -> Result<()> {
        if !BROADCAST_SLOTS.contains(&slot) {
            return Err(KaraboError::NotBroadcastable(slot.to_string()));
        }
        self.session()?.broadcast(slot, args).await
    }

    /// Calls `slot` on `target` and waits for its reply without deadline.
    pub async fn request(&self, target: &str, slot: &str, args: Vec<HashValue>) -> Result<Reply> {
        self.session()?.request(target, slot, args).await
    }

    /// Calls `slot` on `target` and waits at most `timeout` for the reply.
    pub async fn request_with_timeout(
        &self,
        target: &str,
        slot: &str,
        args: Vec<HashValue>,
        timeout: Duration,
    ) -> Result<Reply> {
        self.session()?
            .request_with_timeout(target, slot, args, timeout)
            .await
    }

    /// Like [`request_with_timeout`](Self::request_with_timeout), but if
    /// the first attempt times out, waits for `target` to announce itself
    /// and tries once more.
    pub async fn call_once_alive(
        &self,
        target: &str,
        slot: &str,
        args: Vec<HashValue>,
        timeout: Duration,
    ) -> Result<Reply> {
        let mut announcements = self.0.alive.subscribe();
        match self
            .request_with_timeout(target, slot, args.clone(), timeout)
            .await
        {
            Err(KaraboError::Timeout(_)) => {}
            other => return other,
        }
        debug!(target, slot, "No reply, waiting for the instance to come up");
        let wait = async {
            loop {
                match announcements.recv().await {
                    Ok(id) if id == target => return Ok(()),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return Err(KaraboError::Cancelled),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| KaraboError::Timeout(format!("{target} did not come up")))??;
        self.request_with_timeout(target, slot, args, timeout).await
    }

    /// Routes `signal` of `peer` to the local `slot`.
    pub async fn connect(&self, peer: &str, signal: &str, slot: &str) -> Result<()> {
        self.session()?.connect(peer, signal, slot).await
    }

    /// Undoes [`connect`](Self::connect).
    pub async fn disconnect(&self, peer: &str, signal: &str, slot: &str) -> Result<()> {
        self.session()?.disconnect(peer, signal, slot).await
    }

    /// Ties `timer` to this instance; it is destroyed at shutdown.
    pub fn register_timer(&self, timer: &AsyncTimer) {
        let mut timers = self.0.timers.lock();
        timers.retain(|t| !t.is_dead());
        timers.push(timer.downgrade());
    }

    /// Life-cycle bookkeeping for a peer that came up: proxies first,
    /// then waiters, then the topology.
    pub(crate) fn notice_instance_new(&self, id: &str, info: &Hash) {
        self.0.proxies.instance_new(self, id, info);
        let _ = self.0.alive.send(id.to_string());
        if let Some(tracker) = &self.0.tracker {
            tracker.instance_new(id, info);
        }
    }

    /// Life-cycle bookkeeping for a peer that went away.
    pub(crate) fn notice_instance_gone(&self, id: &str, info: &Hash) {
        self.0.proxies.instance_gone(id);
        if let Some(tracker) = &self.0.tracker {
            tracker.instance_gone(id, info);
        }
    }

    /// Copy of the topology view, if the instance tracks one.
    pub fn topology(&self) -> Option<Hash> {
        self.0.tracker.as_ref().map(|t| t.snapshot())
    }

    // --- life cycle ---

    /// Brings the instance onto the network.
    ///
    /// Opens the broker session, checks that no other instance uses the
    /// id, announces the instance and runs the initialization hooks. A
    /// failure shuts the instance down again and is returned.
    #[instrument(skip(self), fields(instance_id = %self.0.instance_id))]
    pub async fn start(&self) -> Result<()> {
        let inner = &self.0;
        if self.lifecycle() != Lifecycle::Instantiating || inner.session.read().is_some() {
            return Err(KaraboError::Validation(format!(
                "{} was already started",
                inner.instance_id
            )));
        }
        let session = BrokerSession::open(
            inner.connector.clone(),
            &inner.instance_id,
            &inner.class_id,
            inner.broadcast,
            &inner.config,
        )
        .await?;
        *inner.session.write() = Some(session.clone());

        let weak: Weak<InstanceInner> = Arc::downgrade(&self.0);
        let handler: Weak<dyn InboundHandler> = weak;
        if let Some(rx) = inner.outbox_rx.lock().take() {
            tokio::spawn(drain_outbox(session.clone(), rx, inner.closed.clone()));
        }
        if let Err(e) = session.consume(handler.clone()).await {
            self.shutdown_with(None).await;
            return Err(e);
        }

        let nonce = rand::rng().random_range(2..0x7fff_ffff_i32);
        inner.nonce.store(nonce, Ordering::Release);
        let ping = session
            .request_with_timeout(
                &inner.instance_id,
                "slotPing",
                vec![HashValue::Int32(nonce)],
                inner.config.timeouts.ping(),
            )
            .await;
        match ping {
            Ok(reply) => {
                let host = reply
                    .hash(0)
                    .and_then(|info| info.get_str("host"))
                    .unwrap_or("unknown host")
                    .to_string();
                error!(host = %host, "Instance id already in use");
                self.shutdown_with(None).await;
                return Err(KaraboError::AlreadyInUse(inner.instance_id.clone()));
            }
            Err(KaraboError::Timeout(_)) => {}
            Err(e) => {
                self.shutdown_with(None).await;
                return Err(e);
            }
        }
        inner.nonce.store(0, Ordering::Release);

        if let Some(tracker) = &inner.tracker {
            if let Err(e) = session.consume_beats(handler).await {
                self.shutdown_with(None).await;
                return Err(e);
            }
            tracker.clone().spawn_ticks(self);
        }

        let info = self.info();
        if let Err(e) = session
            .broadcast(
                "slotInstanceNew",
                vec![HashValue::from(self.instance_id()), HashValue::Hash(info)],
            )
            .await
        {
            self.shutdown_with(None).await;
            return Err(e);
        }
        inner.announced.store(true, Ordering::Release);
        if inner.tracker.is_some() {
            self.0.send(Outgoing::Broadcast {
                slot: "slotDiscover".to_string(),
                args: vec![HashValue::from(self.instance_id())],
            });
        }

        let pre_init = tokio::time::timeout(
            inner.config.timeouts.pre_initialization(),
            inner.hooks.pre_initialization(self),
        )
        .await;
        let pre_init_error = match pre_init {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{e:#}")),
            Err(_) => Some("preInitialization timed out".to_string()),
        };
        if let Some(reason) = pre_init_error {
            error!(reason = %reason, "Initialization failed");
            self.shutdown_with(None).await;
            return Err(KaraboError::Validation(reason));
        }

        self.set_lifecycle(Lifecycle::Running);
        let instance = self.clone();
        inner.tasks.spawn(async move {
            if let Err(e) = instance.0.hooks.on_initialization(&instance).await {
                error!(instance_id = %instance.0.instance_id, error = %format!("{e:#}"), "onInitialization failed");
                let killer = instance.clone();
                tokio::spawn(async move {
                    killer.shutdown().await;
                });
            }
        });

        self.spawn_heartbeats(session);
        info!("Instance up");
        Ok(())
    }

    fn spawn_heartbeats(&self, session: Arc<BrokerSession>) {
        let period = Duration::from_secs(u64::from(self.0.heartbeat_interval.max(1)));
        let beat = Hash::new()
            .with("type", self.0.instance_type.as_str())
            .with("heartbeatInterval", self.0.heartbeat_interval);
        self.0.tasks.spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticks.tick().await;
                if let Err(e) = session.heartbeat(beat.clone()).await {
                    debug!(error = %e, "Heartbeat not sent");
                }
            }
        });
    }

    /// Shuts the instance down. Returns whether every owned task finished
    /// within the drain limit.
    pub async fn shutdown(&self) -> bool {
        self.shutdown_with(None).await
    }

    /// Resolves once the instance is shut down.
    pub async fn wait_until_killed(&self) {
        self.0.killed.cancelled().await;
    }

    #[instrument(skip(self, kill_message), fields(instance_id = %self.0.instance_id))]
    pub(crate) async fn shutdown_with(&self, kill_message: Option<Arc<Message>>) -> bool {
        let inner = &self.0;
        if inner.stopping.swap(true, Ordering::AcqRel) {
            inner.killed.cancelled().await;
            return inner.drained.load(Ordering::Acquire);
        }
        debug!("Shutting down");

        match tokio::time::timeout(
            inner.config.timeouts.on_destruction(),
            inner.hooks.on_destruction(self),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{e:#}"), "onDestruction failed"),
            Err(_) => warn!("onDestruction timed out"),
        }

        let timers: Vec<WeakTimer> = std::mem::take(&mut *inner.timers.lock());
        for timer in timers.iter().filter_map(WeakTimer::upgrade) {
            timer.destroy();
        }
        let outputs: Vec<OutputChannel> = inner.outputs.iter().map(|e| e.value().clone()).collect();
        inner.outputs.clear();
        for output in outputs {
            output.close().await;
        }
        let inputs: Vec<InputChannel> = inner.inputs.iter().map(|e| e.value().clone()).collect();
        inner.inputs.clear();
        for input in inputs {
            input.close().await;
        }

        let drained = inner.tasks.shutdown(inner.config.timeouts.task_drain()).await;
        if !drained {
            warn!(remaining = inner.tasks.len(), "Tasks did not finish in time");
        }
        self.update();

        let session = inner.session.read().clone();
        if let Some(session) = session {
            if inner.announced.load(Ordering::Acquire) {
                inner.send(Outgoing::Broadcast {
                    slot: "slotInstanceGone".to_string(),
                    args: vec![HashValue::from(self.instance_id()), HashValue::Hash(self.info())],
                });
            }
            if let Some(message) = kill_message {
                inner.send(Outgoing::Reply {
                    message,
                    values: Vec::new(),
                });
            }
            let (done, flushed) = oneshot();
            inner.send(Outgoing::Barrier(done));
            if tokio::time::timeout(Duration::from_secs(1), flushed.wait())
                .await
                .is_err()
            {
                debug!("Outbox not flushed before close");
            }
            if let Err(e) = session.unsubscribe_all().await {
                debug!(error = %e, "Unsubscribe failed");
            }
            if let Err(e) = session.close().await {
                debug!(error = %e, "Session close failed");
            }
        }

        inner.closed.cancel();
        self.set_lifecycle(Lifecycle::Killed);
        inner.drained.store(drained, Ordering::Release);
        inner.killed.cancel();
        info!(drained, "Instance down");
        drained
    }
}
