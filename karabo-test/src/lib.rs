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

//! Test support for Karabo instances.
//!
//! The [`karabo_test`](prelude::karabo_test) attribute turns an `async fn` into a
//! regular `#[test]` that runs on a fresh multi-threaded tokio runtime. Panics
//! raised anywhere inside the runtime are captured with their location and
//! re-raised on the test thread so the failure points at the offending line.

/// Everything a test module usually needs.
pub mod prelude {
    pub use karabo_test_macro::karabo_test;
}

#[doc(hidden)]
pub mod __private {
    pub use parking_lot;
    pub use tokio;
    pub use tracing;
}
