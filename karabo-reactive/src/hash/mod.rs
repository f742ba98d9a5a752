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

//! The hierarchical attributed dictionary and its companions.
//!
//! Everything that crosses the network is a [`Hash`]: message headers and
//! bodies, configurations, [`Schema`]s and pipeline data. The [`codec`]
//! module holds the binary wire format.

/// Binary serialization.
pub mod codec;
mod container;
mod ndarray;
mod schema;
mod timestamp;
mod value;

pub use container::{Attributes, Hash, Node, PATH_SEPARATOR};
pub use ndarray::NDArray;
pub use schema::{AccessMode, Assignment, Element, NodeType, Schema, SchemaBuilder};
pub use timestamp::{Timestamp, ATTOSEC_PER_SEC};
pub use value::{HashValue, TypeCode};
