//! Wire envelope of broker messages.
//!
//! A message is a header Hash followed by a body Hash whose keys `a1..an`
//! hold the positional arguments. The header names the sender, the addressed
//! slots and, for requests and replies, the correlation token.
//!
//! # Key Components
//!
//! *   [`Message`]: header and body, with encoding and argument access.
//! *   [`SlotTargets`]: the `slotFunctions` addressing of calls and broadcasts.
//! *   [`Reply`]: the values of a successful reply.

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

pub use envelope::{pack_args, Message};
pub use header::{
    call_header, reply_header, signal_header, SlotTargets, BROADCAST_TARGET, CALL_FUNCTION,
    REPLY_FUNCTION,
};
pub use reply::Reply;

/// Defines [`Message`].
mod envelope;
/// Header construction and slot addressing.
mod header;
/// Defines [`Reply`].
mod reply;
