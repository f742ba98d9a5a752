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

//! Broker transports selected by URL scheme.

use std::sync::Arc;

pub use amqp::{AmqpChannel, AmqpTransport};
pub use memory::{MemoryChannel, MemoryTransport};

use crate::common::{KaraboError, Result};
use crate::traits::Transport;

mod amqp;
mod memory;

/// URL scheme of the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// Opens the transport named by `url`.
pub async fn open_transport(url: &str) -> Result<Arc<dyn Transport>> {
    if let Some(name) = url.strip_prefix(MEMORY_SCHEME) {
        let name = name.rsplit('@').next().unwrap_or(name);
        return Ok(Arc::new(MemoryTransport::open(name)));
    }
    if url.starts_with("amqp://") {
        return Ok(Arc::new(AmqpTransport::connect(url).await?));
    }
    Err(KaraboError::Config(format!("unsupported broker URL '{url}'")))
}
