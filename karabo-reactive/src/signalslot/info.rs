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
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::common::KaraboError;
use crate::hash::{Hash, HashValue};

/// Kind of a network instance, as carried in its instance info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceType {
    /// Hosts devices.
    Server,
    /// A device.
    #[default]
    Device,
    /// A scripted client.
    Macro,
    /// Any other client, such as a GUI.
    Client,
    /// Not known.
    Unknown,
}

impl InstanceType {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Device => "device",
            Self::Macro => "macro",
            Self::Client => "client",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceType {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "device" => Ok(Self::Device),
            "macro" => Ok(Self::Macro),
            "client" => Ok(Self::Client),
            "unknown" => Ok(Self::Unknown),
            other => Err(KaraboError::Validation(format!("unknown instance type '{other}'"))),
        }
    }
}

/// Health reported in the `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstanceStatus {
    /// Running normally.
    #[default]
    Ok,
    /// In error.
    Error,
    /// Not known.
    Unknown,
}

impl InstanceStatus {
    /// Wire name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

/// Builder for the instance info Hash broadcast with `slotInstanceNew`.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    hash: Hash,
}

impl InstanceInfo {
    /// Info with the mandatory fields.
    pub fn new(instance_type: InstanceType, class_id: &str, host: &str, heartbeat_interval: u32) -> Self {
        let hash = Hash::new()
            .with("type", instance_type.as_str())
            .with("classId", class_id)
            .with("host", host)
            .with("status", InstanceStatus::Ok.as_str())
            .with("heartbeatInterval", heartbeat_interval)
            .with("karaboVersion", env!("CARGO_PKG_VERSION"));
        Self { hash }
    }

    /// Server the instance runs on.
    #[must_use]
    pub fn server_id(mut self, server_id: &str) -> Self {
        self.hash.set("serverId", server_id);
        self
    }

    /// Health status.
    #[must_use]
    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.hash.set("status", status.as_str());
        self
    }

    /// Capability bit mask.
    #[must_use]
    pub fn capabilities(mut self, mask: u32) -> Self {
        self.hash.set("capabilities", mask);
        self
    }

    /// Interface bit mask.
    #[must_use]
    pub fn interfaces(mut self, mask: u32) -> Self {
        self.hash.set("interfaces", mask);
        self
    }

    /// Server flag bit mask.
    #[must_use]
    pub fn server_flags(mut self, mask: u32) -> Self {
        self.hash.set("serverFlags", mask);
        self
    }

    /// Log level of the instance.
    #[must_use]
    pub fn log(mut self, level: &str) -> Self {
        self.hash.set("log", level);
        self
    }

    /// The finished Hash.
    pub fn into_hash(self) -> Hash {
        self.hash
    }
}

/// Reads the instance type out of an info Hash; missing or unknown types
/// map to [`InstanceType::Unknown`].
pub fn instance_type_of(info: &Hash) -> InstanceType {
    info.get_str("type")
        .and_then(|t| t.parse().ok())
        .unwrap_or(InstanceType::Unknown)
}

/// Reads `heartbeatInterval` in seconds out of an info Hash.
pub fn heartbeat_interval_of(info: &Hash) -> Option<f64> {
    info.get("heartbeatInterval").and_then(HashValue::as_f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_fields() {
        let info = InstanceInfo::new(InstanceType::Device, "Motor", "host1", 20)
            .server_id("srv")
            .capabilities(0b101)
            .into_hash();
        assert_eq!(info.get_str("type"), Some("device"));
        assert_eq!(info.get_str("serverId"), Some("srv"));
        assert_eq!(info.get_str("status"), Some("ok"));
        assert_eq!(info.get("capabilities"), Some(&HashValue::UInt32(5)));
        assert_eq!(instance_type_of(&info), InstanceType::Device);
        assert_eq!(heartbeat_interval_of(&info), Some(20.0));
    }

    #[test]
    fn unknown_type_names() {
        assert!("gadget".parse::<InstanceType>().is_err());
        assert_eq!(instance_type_of(&Hash::new()), InstanceType::Unknown);
    }
}
