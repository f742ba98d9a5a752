//! Heartbeat-driven topology tracking.
//!
//! Every instance emits a heartbeat at its configured interval. A tracking
//! instance consumes all of them on a dedicated queue and keeps a
//! [`TopologyTracker`] view of who is alive. Instances that miss too many
//! beats are removed, and a server that disappears takes its devices with it.

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
pub use tracker::{TopologyCallback, TopologyChange, TopologyTracker, TrackerStats};

// --- Submodules ---

/// The topology view and its expiry.
mod tracker;
