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

//! Error kinds and shared callback aliases used throughout `karabo-reactive`.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::hash::Hash;

/// Error kinds surfaced by the core.
///
/// Payloads are plain strings so that one error can be cloned to every
/// waiter of a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KaraboError {
    /// The broker is unreachable or a channel failed mid-operation.
    Transport(String),

    /// A send was attempted while the session has no open channel.
    NotConnected,

    /// A deadline passed. The payload names what was waited for.
    Timeout(String),

    /// An inbound message addressed a slot that is not registered.
    UnknownSlot {
        /// The addressed instance.
        instance_id: String,
        /// The missing slot.
        slot: String,
    },

    /// A peer answered a request with `error=true`.
    Remote {
        /// First reply argument.
        text: String,
        /// Optional second reply argument, usually a traceback.
        details: Option<String>,
    },

    /// The target is locked by another instance.
    Locked(String),

    /// The peer behind a proxy is gone.
    DeviceDied(String),

    /// The surrounding task was cancelled.
    Cancelled,

    /// A reconfiguration named unknown or non-writable paths.
    Validation(String),

    /// Startup found another live instance with the same id.
    AlreadyInUse(String),

    /// Only the fixed broadcast slots may be broadcast.
    NotBroadcastable(String),

    /// Invalid configuration such as a bad broker URL or topic.
    Config(String),

    /// Malformed binary Hash.
    Codec(String),

    /// Pipeline protocol violation.
    Protocol(String),

    /// A key, property, channel or instance does not exist.
    NotFound(String),

    /// Socket or file I/O failure.
    Io(String),
}

impl fmt::Display for KaraboError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::NotConnected => write!(f, "Broker channel is not open"),
            Self::Timeout(what) => write!(f, "Timeout while waiting for {what}"),
            Self::UnknownSlot { instance_id, slot } => {
                write!(f, "Slot does not exist: '{slot}' on '{instance_id}'")
            }
            Self::Remote { text, details } => match details {
                Some(d) if !d.is_empty() => write!(f, "{text}\nDETAILS: {d}"),
                _ => write!(f, "{text}"),
            },
            Self::Locked(locker) => write!(f, "Device locked by \"{locker}\""),
            Self::DeviceDied(id) => write!(f, "device \"{id}\" died"),
            Self::Cancelled => write!(f, "Operation cancelled"),
            Self::Validation(msg) => write!(f, "{msg}"),
            Self::AlreadyInUse(id) => write!(f, "deviceId \"{id}\" already in use"),
            Self::NotBroadcastable(slot) => write!(f, "Slot '{slot}' may not be broadcast"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Codec(e) => write!(f, "Malformed Hash: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::NotFound(what) => write!(f, "Not found: {what}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for KaraboError {}

impl From<std::io::Error> for KaraboError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<lapin::Error> for KaraboError {
    fn from(err: lapin::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for KaraboError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout("operation".to_string())
    }
}

impl KaraboError {
    /// Renders a user error into the `(text, details)` pair carried by an error reply.
    pub fn reply_parts(err: &anyhow::Error) -> (String, String) {
        match err.downcast_ref::<Self>() {
            Some(Self::Remote { text, details }) => {
                (text.clone(), details.clone().unwrap_or_default())
            }
            _ => (err.to_string(), format!("{err:?}")),
        }
    }
}

/// Result alias for the library API.
pub type Result<T> = std::result::Result<T, KaraboError>;

/// Callback receiving a Hash and finishing asynchronously, used for
/// pipeline data and change notifications.
pub type HashCallback = Arc<dyn Fn(Hash) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Callback without arguments, used by timers.
pub type UnitCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
