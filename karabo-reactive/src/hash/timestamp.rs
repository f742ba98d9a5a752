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

use std::cmp::Ordering;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{Attributes, HashValue};

/// Attoseconds per second.
pub const ATTOSEC_PER_SEC: u64 = 1_000_000_000_000_000_000;
const ATTOSEC_PER_NANOSEC: u64 = 1_000_000_000;

/// A point in time with attosecond resolution and an optional train id.
///
/// Timestamps compare by `(sec, frac)` only; the train id is carried along
/// for bucketing but does not take part in ordering.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub sec: u64,
    /// Fractional part in attoseconds.
    pub frac: u64,
    /// Train id, `0` when unknown.
    pub tid: u64,
}

impl Timestamp {
    /// Current wall clock time without a train id.
    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self {
            sec: since.as_secs(),
            frac: u64::from(since.subsec_nanos()) * ATTOSEC_PER_NANOSEC,
            tid: 0,
        }
    }

    /// Copy with a different train id.
    #[must_use]
    pub fn with_tid(mut self, tid: u64) -> Self {
        self.tid = tid;
        self
    }

    /// Seconds since the epoch as a float.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.frac as f64 / ATTOSEC_PER_SEC as f64
    }

    /// Wall clock time elapsed since this timestamp, zero if it lies in the future.
    pub fn elapsed(&self) -> Duration {
        let me = Duration::new(self.sec, u32::try_from(self.frac / ATTOSEC_PER_NANOSEC).unwrap_or(0));
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        now.saturating_sub(me)
    }

    /// The `sec`, `frac` and `tid` attributes of this timestamp.
    pub fn to_attributes(&self) -> Attributes {
        Attributes::new()
            .with("sec", self.sec)
            .with("frac", self.frac)
            .with("tid", self.tid)
    }

    /// Writes the timestamp attributes into an existing map.
    pub fn apply_to(&self, attrs: &mut Attributes) {
        attrs.set("sec", self.sec);
        attrs.set("frac", self.frac);
        attrs.set("tid", self.tid);
    }

    /// Reads a timestamp back from attributes; `tid` defaults to `0`.
    pub fn from_attributes(attrs: &Attributes) -> Option<Self> {
        let sec = attrs.get("sec").and_then(HashValue::as_u64)?;
        let frac = attrs.get("frac").and_then(HashValue::as_u64)?;
        let tid = attrs.get("tid").and_then(HashValue::as_u64).unwrap_or(0);
        Some(Self { sec, frac, tid })
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.sec == other.sec && self.frac == other.frac
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.sec, self.frac).cmp(&(other.sec, other.frac))
    }
}
