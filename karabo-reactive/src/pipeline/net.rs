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

use std::net::{IpAddr, Ipv4Addr};

use tokio::net::TcpStream;
use tracing::trace;

use crate::common::{KaraboError, PipelineConfig, Result};

/// Type-of-service value asking for low delay.
pub(crate) const IPTOS_LOWDELAY: u32 = 0x10;

/// Turns the configured hostname into an address to bind on.
///
/// `default` is the machine's hostname; an IPv4 address or CIDR range picks
/// the first local interface inside it; anything else names an interface.
pub(crate) fn resolve_hostname(setting: &str) -> Result<String> {
    if setting == "default" {
        return hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .map_err(|e| KaraboError::Io(e.to_string()));
    }
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| KaraboError::Io(format!("cannot list network interfaces: {e}")))?;
    if let Some((network, prefix)) = parse_network(setting) {
        return interfaces
            .iter()
            .find_map(|(_, ip)| match ip {
                IpAddr::V4(v4) if in_network(*v4, network, prefix) => Some(v4.to_string()),
                _ => None,
            })
            .ok_or_else(|| KaraboError::Config(format!("no local interface inside {setting}")));
    }
    interfaces
        .iter()
        .find_map(|(name, ip)| (name == setting && ip.is_ipv4()).then(|| ip.to_string()))
        .ok_or_else(|| KaraboError::Config(format!("{setting} cannot be found in network configuration")))
}

fn parse_network(text: &str) -> Option<(Ipv4Addr, u32)> {
    let (address, prefix) = match text.split_once('/') {
        Some((address, prefix)) => (address, prefix.parse().ok().filter(|p| *p <= 32)?),
        None => (text, 32),
    };
    Some((address.parse().ok()?, prefix))
}

fn in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u32) -> bool {
    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    u32::from(ip) & mask == u32::from(network) & mask
}

/// Low delay and keepalive settings for a pipeline connection.
pub(crate) fn tune(stream: &TcpStream, config: &PipelineConfig) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| KaraboError::Io(e.to_string()))?;
    let socket = socket2::SockRef::from(stream);
    if let Ok(IpAddr::V4(_)) = stream.peer_addr().map(|a| a.ip()) {
        socket
            .set_tos(IPTOS_LOWDELAY)
            .map_err(|e| KaraboError::Io(e.to_string()))?;
    }
    #[cfg(target_os = "linux")]
    {
        use std::time::Duration;
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(config.keepalive_idle_secs))
            .with_interval(Duration::from_secs(config.keepalive_interval_secs))
            .with_retries(config.keepalive_count);
        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| KaraboError::Io(e.to_string()))?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = config;
    trace!(peer = ?stream.peer_addr().ok(), "Pipeline socket tuned");
    Ok(())
}
