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

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::common::Result;

/// A message taken off a queue, with the exchange and key it was routed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
    /// Encoded `header || body`.
    pub payload: Vec<u8>,
}

/// Arguments attached to every declared queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-max-length`
    pub max_length: u32,
    /// `x-overflow`
    pub overflow: String,
    /// `x-message-ttl` in milliseconds
    pub message_ttl_ms: u32,
    /// Delete the queue once its last consumer is gone.
    pub auto_delete: bool,
}

impl Default for QueueArguments {
    fn default() -> Self {
        Self {
            max_length: 10_000,
            overflow: "drop-head".to_string(),
            message_ttl_ms: 120_000,
            auto_delete: true,
        }
    }
}

/// An open connection to a broker.
///
/// Implementations exist for AMQP 0-9-1 and for an in-process broker used
/// by tests and single-process deployments.
#[async_trait]
pub trait Transport: Debug + Send + Sync + 'static {
    /// Opens a fresh channel on the connection.
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>>;

    /// Checks whether a queue of that name exists.
    ///
    /// Runs on a throw-away channel, as a failing passive declare closes
    /// the channel it was issued on.
    async fn queue_exists(&self, name: &str) -> Result<bool>;

    /// Whether the connection is still usable.
    fn is_connected(&self) -> bool;

    /// Closes the connection and every channel opened on it.
    async fn close(&self) -> Result<()>;
}

/// One channel of a [`Transport`], owned by a single broker session.
#[async_trait]
pub trait TransportChannel: Debug + Send + Sync + 'static {
    /// Declares a topic exchange. Declaring an existing one is a no-op.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declares a queue with the given arguments.
    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<()>;

    /// Binds `queue` to `exchange` under `routing_key`.
    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Removes a binding added with [`bind`](Self::bind).
    async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publishes a payload.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()>;

    /// Starts consuming `queue`, without acknowledgements.
    ///
    /// The returned receiver yields deliveries until the channel closes.
    async fn consume(&self, queue: &str, buffer: usize) -> Result<mpsc::Receiver<Delivery>>;

    /// Deletes a queue.
    async fn delete_queue(&self, name: &str) -> Result<()>;

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;

    /// Closes the channel. Auto-delete queues consumed here go away.
    async fn close(&self) -> Result<()>;
}
