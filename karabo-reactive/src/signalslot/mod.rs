//! The signal-slot engine: live instances and their slots.
//!
//! A [`SignalSlotable`] is a network endpoint. It owns a broker session,
//! a slot table, a live configuration described by a schema, and every task
//! it spawns. Incoming calls are dispatched to registered slots whose
//! results become replies; failures become error replies.
//!
//! # Key Components
//!
//! *   [`SignalSlotable`] / [`InstanceBuilder`]: the instance and its set-up.
//! *   [`SlotHandler`], [`SlotCall`], [`SlotReply`]: slot registration and calls.
//! *   [`BulkUpdate`]: grouping property changes into `signalChanged` bulks.
//! *   [`TaskSet`]: tasks owned by an instance and cancelled with it.
//! *   [`AsyncTimer`]: snoozable timers.
//! *   [`OneShot`]: single-value hand-off usable from async and sync code.

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
pub use info::{heartbeat_interval_of, instance_type_of, InstanceInfo, InstanceStatus, InstanceType};
pub use init::{InitConfiguration, InitEntry};
pub use instance::{validate_instance_id, InstanceBuilder, Lifecycle, SignalSlotable, WeakInstance};
pub use oneshot::{oneshot, OneShot, OneShotSender};
pub use slots::{CooperativeSlotFn, SlotCall, SlotHandler, SlotReply, SyncSlotFn};
pub use tasks::TaskSet;
pub use timer::AsyncTimer;
pub use updates::BulkUpdate;

// --- Submodules ---

/// Slots every instance answers.
mod builtin;
/// Instance type and info Hash helpers.
mod info;
/// Start-up configuration documents.
mod init;
/// The instance runtime.
mod instance;
/// Single-value hand-off.
mod oneshot;
/// Slot handlers and calls.
mod slots;
/// Task ownership.
mod tasks;
/// Snoozable timers.
mod timer;
/// Bulk property updates.
mod updates;
