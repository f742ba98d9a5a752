//! Shared infrastructure of the Karabo core.
//!
//! This module gathers what every component builds on: the error type, the
//! configuration, and the broker plumbing that component C1 consists of.
//!
//! # Key Re-exported Components:
//!
//! *   [`KaraboError`] and [`Result`]: the error kinds of the library API.
//! *   [`KaraboConfig`] and [`CONFIG`]: configuration loaded from XDG locations.
//! *   [`Connector`]: the process-wide holder of the broker connection.
//! *   [`BrokerSession`]: the per-instance channel, queue and bindings, with
//!     send, request and subscription operations.
//! *   [`MemoryTransport`] and [`AmqpTransport`]: the transports a connector
//!     opens, chosen by URL scheme.

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

// --- Public Re-exports ---
pub use config::{
    BrokerConfig, HeartbeatConfig, KaraboConfig, PipelineConfig, ProxyConfig, TimeoutConfig,
    CONFIG,
};
pub use connector::{validate_topic, validate_urls, Connector, BROKER_ENV, TOPIC_ENV};
pub use session::{
    BrokerSession, InboundHandler, InboundKind, SessionStats, BROADCAST_SLOTS, HEARTBEAT_SIGNAL,
};
pub use subscriptions::{SubscriptionStats, SubscriptionTable};
pub use transport::{open_transport, AmqpTransport, MemoryTransport, MEMORY_SCHEME};
pub use types::*;

// --- Crate-Internal Re-exports ---
pub(crate) use session::monotonic_hex;

// --- Submodules ---

/// Error kinds and callback aliases.
mod types;

/// Defines the configuration system.
pub mod config;
/// Defines the [`Connector`].
mod connector;
/// Defines the [`BrokerSession`].
mod session;
/// Binding and signal connection book-keeping of a session.
mod subscriptions;
/// AMQP and in-process transports.
mod transport;
