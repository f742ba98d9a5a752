//! Local shadows of remote instances.
//!
//! A [`Proxy`] mirrors the schema and configuration of one peer, batches
//! writes into `slotReconfigure` calls and follows the peer through its
//! life cycle: when the peer leaves, pending calls fail with
//! [`DeviceDied`](crate::common::KaraboError::DeviceDied) and `state`
//! turns `UNKNOWN`; when it comes back the proxy refetches everything.
//!
//! Proxies are obtained with [`SignalSlotable::get_proxy`](crate::signalslot::SignalSlotable::get_proxy).

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
pub use handle::{Proxy, ProxyUse};
pub(crate) use registry::ProxyRegistry;

// --- Submodules ---

/// The proxy handle and its usage scope.
mod handle;
/// Per-instance proxy cache and the proxy factory.
mod registry;
