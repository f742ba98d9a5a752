//! Out-of-band TCP channels for bulk data.
//!
//! An [`OutputChannel`] listens on a TCP port that its owning instance
//! advertises through `slotGetOutputChannelInformation`. An
//! [`InputChannel`] asks for that address, connects, greets the output with
//! its distribution and slowness policy and acknowledges every frame it
//! reads. The output sends a connection its next frame only after the
//! previous one was acknowledged.

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
pub use input::{ChannelHandler, DataHandler, InputBuilder, InputChannel, InputStats};
pub use output::{ConnectionEntry, OutputChannel, OutputStats};
pub use protocol::{Distribution, Frame, Hello, Item, PipelineMeta, Slowness};

// --- Submodules ---

/// Receiving side with reconnection and handler dispatch.
mod input;
/// Hostname resolution and socket options.
mod net;
/// Listener, connection table and frame distribution.
mod output;
/// Length-prefixed Hash framing.
pub mod protocol;
/// Bounded and ring queues feeding connections.
mod queue;
