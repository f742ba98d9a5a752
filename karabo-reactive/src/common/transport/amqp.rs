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

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::mpsc;
use tracing::{debug, instrument, trace, warn};

use crate::common::{KaraboError, Result};
use crate::traits::{Delivery, QueueArguments, Transport, TransportChannel};

/// AMQP 0-9-1 connection backed by `lapin`.
#[derive(Debug)]
pub struct AmqpTransport {
    url: String,
    connection: Connection,
}

impl AmqpTransport {
    /// Opens a connection to `url`.
    #[instrument(level = "debug")]
    pub async fn connect(url: &str) -> Result<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;
        debug!(url, "AMQP connection established");
        Ok(Self {
            url: url.to_string(),
            connection,
        })
    }

    /// The URL this connection was opened with.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open_channel(&self) -> Result<Arc<dyn TransportChannel>> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn queue_exists(&self, name: &str) -> Result<bool> {
        let check = self.connection.create_channel().await?;
        let options = QueueDeclareOptions {
            passive: true,
            ..QueueDeclareOptions::default()
        };
        let exists = check
            .queue_declare(name, options, FieldTable::default())
            .await
            .is_ok();
        if check.status().connected() {
            let _ = check.close(200, "queue check done").await;
        }
        trace!(queue = name, exists, "Passive queue check");
        Ok(exists)
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }
        Ok(())
    }
}

/// Channel on an [`AmqpTransport`].
#[derive(Debug)]
pub struct AmqpChannel {
    channel: Channel,
}

fn queue_table(args: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert(
        ShortString::from("x-max-length"),
        AMQPValue::LongInt(i32::try_from(args.max_length).unwrap_or(i32::MAX)),
    );
    table.insert(
        ShortString::from("x-overflow"),
        AMQPValue::LongString(LongString::from(args.overflow.as_str())),
    );
    table.insert(
        ShortString::from("x-message-ttl"),
        AMQPValue::LongInt(i32::try_from(args.message_ttl_ms).unwrap_or(i32::MAX)),
    );
    table
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<()> {
        let options = QueueDeclareOptions {
            auto_delete: args.auto_delete,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(name, options, queue_table(args))
            .await?;
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: Vec<u8>) -> Result<()> {
        if !self.channel.status().connected() {
            return Err(KaraboError::NotConnected);
        }
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, buffer: usize) -> Result<mpsc::Receiver<Delivery>> {
        let options = BasicConsumeOptions {
            no_ack: true,
            ..BasicConsumeOptions::default()
        };
        let mut consumer = self
            .channel
            .basic_consume(queue, "", options, FieldTable::default())
            .await?;
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                match item {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            payload: delivery.data,
                        };
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer stream failed");
                        break;
                    }
                }
            }
            trace!(queue = %queue, "Consumer stream ended");
        });
        Ok(rx)
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel.close(200, "closing").await?;
        }
        Ok(())
    }
}
