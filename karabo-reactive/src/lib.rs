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

#![forbid(unsafe_code)]
#![deny(missing_docs)] // Keep this to enforce coverage

//! # Karabo Reactive
//!
//! The core of the Karabo middle layer: a network of named instances that
//! talk through an AMQP broker using signals and slots, keep typed proxies
//! of each other, stream bulk data over direct TCP pipelines and watch each
//! other's heartbeats.
//!
//! ## Key Concepts
//!
//! - **Hash (`Hash`)**: the ordered, attributed tree every message, schema
//!   and configuration is made of, with its binary codec.
//! - **Instances (`SignalSlotable`)**: network endpoints owning a slot table,
//!   a configuration described by a `Schema`, and every task they start.
//! - **Messaging**: calls, replies and signals travel as `header ++ body`
//!   Hashes over topic exchanges of one broker domain.
//! - **Proxies (`Proxy`)**: local mirrors of remote instances that follow
//!   their changes and batch writes.
//! - **Pipelines (`OutputChannel`, `InputChannel`)**: flow-controlled TCP
//!   streams of Hashes between instances.
//! - **Topology (`TopologyTracker`)**: the live view of all instances built
//!   from announcements and heartbeats.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use karabo_reactive::prelude::*;
//!
//! let connector = Arc::new(Connector::in_memory("demo", "lab")?);
//! let motor = SignalSlotable::builder("motor/1")
//!     .connector(connector.clone())
//!     .start()
//!     .await?;
//! let client = SignalSlotable::builder("client")
//!     .connector(connector)
//!     .start()
//!     .await?;
//!
//! let proxy = client.get_proxy("motor/1").await?;
//! let _scope = proxy.enter().await?;
//! proxy.set("lockedBy", "client")?;
//! proxy.update().await?;
//! ```

/// Configuration, errors, the broker connector and sessions.
pub mod common;

/// The Hash data model, its binary codec, schemas and time stamps.
pub mod hash;

/// Wire envelope of broker messages.
pub mod message;

/// Instance runtime: slots, signals, tasks, timers and bulk updates.
pub mod signalslot;

/// Proxies of remote instances.
pub mod proxy;

/// Out-of-band TCP data channels.
pub mod pipeline;

/// Heartbeat based topology tracking.
pub mod heartbeat;

/// Traits at the seams of the core.
pub mod traits;

/// A prelude module for conveniently importing the most commonly used items.
///
/// # Re-exports
///
/// ## External Crates
/// *   [`async_trait::async_trait`](https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html): needed to implement [`InstanceHooks`](crate::traits::InstanceHooks).
///
/// ## Core Types
/// *   [`crate::common::Connector`]: Broker URLs, domain and the shared connection.
/// *   [`crate::common::KaraboConfig`]: Process configuration.
/// *   [`crate::common::KaraboError`]: Error kinds of the core.
/// *   [`crate::hash::Hash`], [`crate::hash::HashValue`], [`crate::hash::Schema`], [`crate::hash::Timestamp`]: The data model.
/// *   [`crate::signalslot::SignalSlotable`]: A network instance.
/// *   [`crate::signalslot::SlotHandler`]: Entry of the slot table.
/// *   [`crate::proxy::Proxy`]: Mirror of a remote instance.
/// *   [`crate::pipeline::OutputChannel`], [`crate::pipeline::InputChannel`]: Pipeline endpoints.
/// *   [`crate::heartbeat::TopologyChange`]: What a topology tick found.
/// *   [`crate::traits::InstanceHooks`]: Life-cycle hooks.
pub mod prelude {
    pub use std::sync::Arc;

    // External crate re-exports
    pub use async_trait::async_trait;

    // Core types
    pub use crate::common::{Connector, HashCallback, KaraboConfig, KaraboError, Result};
    pub use crate::hash::{Element, Hash, HashValue, Schema, Timestamp, TypeCode};
    pub use crate::heartbeat::{TopologyCallback, TopologyChange};
    pub use crate::message::Reply;
    pub use crate::pipeline::{
        Distribution, InputBuilder, InputChannel, OutputChannel, PipelineMeta, Slowness,
    };
    pub use crate::proxy::{Proxy, ProxyUse};
    pub use crate::signalslot::{
        AsyncTimer, BulkUpdate, InstanceBuilder, InstanceType, SignalSlotable, SlotCall,
        SlotHandler, SlotReply,
    };
    pub use crate::traits::InstanceHooks;
}
