//! Traits at the seams of the core.
//!
//! # Key Traits
//!
//! *   [`InstanceHooks`]: user code run at the life-cycle points of an instance
//!     and when slots fail or are cancelled.
//! *   [`Transport`] and [`TransportChannel`]: the broker operations a session
//!     needs, implemented for AMQP and for the in-process broker.

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
pub use hooks::{InstanceHooks, NoHooks};
pub use transport::{Delivery, QueueArguments, Transport, TransportChannel};

// --- Submodules ---

/// Defines [`InstanceHooks`].
mod hooks;
/// Defines the broker transport traits.
mod transport;
