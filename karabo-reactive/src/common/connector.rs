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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::common::config::BrokerConfig;
use crate::common::transport::open_transport;
use crate::common::{KaraboError, Result};
use crate::traits::Transport;

const BROKER_URL_PATTERN: &str = r"^(amqp|memory)://[^:@/]+:[^:@/]+@[^:@/]+:\d+$";
const MEMORY_URL_PATTERN: &str = r"^memory://[A-Za-z0-9_.-]+$";

/// Environment variable holding the comma-separated broker URL list.
pub const BROKER_ENV: &str = "KARABO_BROKER";
/// Environment variable holding the broker topic.
pub const TOPIC_ENV: &str = "KARABO_BROKER_TOPIC";

/// Rejects the list if any entry is not a broker URL.
pub fn validate_urls(urls: &[String]) -> Result<()> {
    let broker = Regex::new(BROKER_URL_PATTERN).map_err(|e| KaraboError::Config(e.to_string()))?;
    let memory = Regex::new(MEMORY_URL_PATTERN).map_err(|e| KaraboError::Config(e.to_string()))?;
    if urls.is_empty() {
        return Err(KaraboError::Config("empty broker URL list".to_string()));
    }
    match urls
        .iter()
        .find(|url| !broker.is_match(url) && !memory.is_match(url))
    {
        Some(bad) => Err(KaraboError::Config(format!("invalid broker URL '{bad}'"))),
        None => Ok(()),
    }
}

/// Rejects empty topics and topics reserved for heartbeat queues.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(KaraboError::Config("empty broker topic".to_string()));
    }
    if topic.ends_with("_beats") {
        return Err(KaraboError::Config(format!(
            "topic '{topic}' must not end with '_beats'"
        )));
    }
    Ok(())
}

/// Holds the broker URL list, the topic and the lazily opened connection.
///
/// One connector is created per process and shared by every instance in it.
/// The connection is opened on first use under an async mutex; once it is
/// open the URL list can no longer change.
#[derive(Debug)]
pub struct Connector {
    urls: RwLock<Vec<String>>,
    topic: String,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connected: AtomicBool,
}

impl Connector {
    /// Creates a connector after validating `urls` and `topic`.
    pub fn new(urls: Vec<String>, topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        validate_urls(&urls)?;
        validate_topic(&topic)?;
        Ok(Self {
            urls: RwLock::new(urls),
            topic,
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    /// Creates a connector from configuration, with `KARABO_BROKER` and
    /// `KARABO_BROKER_TOPIC` taking precedence.
    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let urls = match std::env::var(BROKER_ENV) {
            Ok(list) if !list.trim().is_empty() => list
                .split(',')
                .map(|url| url.trim().to_string())
                .filter(|url| !url.is_empty())
                .collect(),
            _ => config.urls.clone(),
        };
        let topic = std::env::var(TOPIC_ENV)
            .ok()
            .filter(|topic| !topic.is_empty())
            .unwrap_or_else(|| config.topic.clone());
        Self::new(urls, topic)
    }

    /// Creates a connector to the in-process broker `name`.
    pub fn in_memory(name: &str, topic: impl Into<String>) -> Result<Self> {
        Self::new(vec![format!("memory://{name}")], topic)
    }

    /// The broker topic (domain).
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The configured URL list.
    pub fn urls(&self) -> Vec<String> {
        self.urls.read().clone()
    }

    /// Whether a connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Replaces the URL list. Rejected once a connection is open.
    pub fn set_urls(&self, urls: Vec<String>) -> Result<()> {
        if self.is_connected() {
            return Err(KaraboError::Config(
                "broker URLs cannot change once connected".to_string(),
            ));
        }
        validate_urls(&urls)?;
        *self.urls.write() = urls;
        Ok(())
    }

    /// Returns the open connection, opening it on first use.
    ///
    /// URLs are tried in order and the first one that opens is kept.
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn connection(&self) -> Result<Arc<dyn Transport>> {
        let mut guard = self.transport.lock().await;
        if let Some(transport) = guard.as_ref() {
            if transport.is_connected() {
                return Ok(transport.clone());
            }
        }
        let mut last_error = KaraboError::Transport("no broker URL".to_string());
        for url in self.urls() {
            match open_transport(&url).await {
                Ok(transport) => {
                    info!(url = %url, "Connected to broker");
                    *guard = Some(transport.clone());
                    self.connected.store(true, Ordering::Release);
                    return Ok(transport);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "Broker connection failed");
                    last_error = e;
                }
            }
        }
        self.connected.store(false, Ordering::Release);
        Err(last_error)
    }

    /// Closes the connection if one is open.
    pub async fn close(&self) -> Result<()> {
        let transport = self.transport.lock().await.take();
        self.connected.store(false, Ordering::Release);
        if let Some(transport) = transport {
            transport.close().await?;
        }
        Ok(())
    }
}
