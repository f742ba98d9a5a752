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

use std::time::{SystemTime, UNIX_EPOCH};

use crate::common::{KaraboError, Result};
use crate::hash::{codec, Hash, HashValue};

/// Wraps user arguments as body keys `a1..an`.
pub fn pack_args(args: Vec<HashValue>) -> Hash {
    let mut body = Hash::new();
    for (i, arg) in args.into_iter().enumerate() {
        body.set(&format!("a{}", i + 1), arg);
    }
    body
}

/// One broker message: a header Hash and a body Hash of positional arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Routing and correlation fields.
    pub header: Hash,
    /// Arguments at `a1..an`.
    pub body: Hash,
}

impl Message {
    /// Builds a message from a header and positional arguments.
    pub fn new(header: Hash, args: Vec<HashValue>) -> Self {
        Self {
            header,
            body: pack_args(args),
        }
    }

    /// Stamps sender and send time into the header.
    pub fn stamp(&mut self, sender: &str) {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        self.header.set("MQTimestamp", millis);
        self.header.set("signalInstanceId", sender);
    }

    /// Wire form `encode(header) || encode(body)`.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = codec::encode(&self.header);
        codec::encode_into(&mut out, &self.body);
        out
    }

    /// Parses the wire form.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (header, pos) = codec::decode_pos(payload)?;
        let body = codec::decode(&payload[pos..])?;
        Ok(Self { header, body })
    }

    /// Positional arguments in order, stopping at the first missing index.
    pub fn args(&self) -> Vec<HashValue> {
        (1..)
            .map_while(|i| self.body.get(&format!("a{i}")).cloned())
            .collect()
    }

    /// Argument `index`, counting from zero.
    pub fn arg(&self, index: usize) -> Option<&HashValue> {
        self.body.get(&format!("a{}", index + 1))
    }

    /// The sending instance, empty if the header does not name one.
    pub fn sender(&self) -> &str {
        self.header.get_str("signalInstanceId").unwrap_or_default()
    }

    /// `signalFunction` header field.
    pub fn signal_function(&self) -> Option<&str> {
        self.header.get_str("signalFunction")
    }

    /// Reply token the sender waits on.
    pub fn reply_to(&self) -> Option<&str> {
        self.header.get_str("replyTo").filter(|t| !t.is_empty())
    }

    /// Token this message answers.
    pub fn reply_from(&self) -> Option<&str> {
        self.header.get_str("replyFrom")
    }

    /// Whether this is an error reply.
    pub fn is_error(&self) -> bool {
        self.header
            .get("error")
            .and_then(HashValue::as_bool)
            .unwrap_or(false)
    }

    /// Send time in milliseconds since the epoch.
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.header.get("MQTimestamp").and_then(HashValue::as_i64)
    }

    /// The error text and details of an error reply.
    pub fn error_parts(&self) -> (String, Option<String>) {
        let text = self
            .arg(0)
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string))
            .unwrap_or_default();
        let details = self
            .arg(1)
            .and_then(HashValue::as_str)
            .map(str::to_string);
        (text, details)
    }

    /// Converts an error reply into the matching error.
    pub fn to_remote_error(&self) -> KaraboError {
        let (text, details) = self.error_parts();
        KaraboError::Remote { text, details }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_keep_their_order() {
        let msg = Message::new(
            Hash::new(),
            vec![HashValue::from("x"), HashValue::from(3_i32), HashValue::None],
        );
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.args().len(), 3);
        assert_eq!(decoded.arg(1), Some(&HashValue::Int32(3)));
        assert_eq!(decoded.body.keys().collect::<Vec<_>>(), vec!["a1", "a2", "a3"]);
    }

    #[test]
    fn stamp_sets_sender_and_time() {
        let mut msg = Message::new(Hash::new(), Vec::new());
        msg.stamp("alpha");
        assert_eq!(msg.sender(), "alpha");
        assert!(msg.timestamp_ms().unwrap() > 0);
    }

    #[test]
    fn error_reply_text_and_details() {
        let header = Hash::new().with("replyFrom", "t").with("error", true);
        let msg = Message::new(header, vec!["bad".into(), "trace".into()]);
        assert!(msg.is_error());
        assert_eq!(msg.to_remote_error().to_string(), "bad\nDETAILS: trace");
    }

    #[test]
    fn truncated_body_is_rejected() {
        let msg = Message::new(Hash::new().with("k", 1_i32), Vec::new());
        let mut bytes = msg.encode();
        bytes.truncate(bytes.len() - 1);
        assert!(Message::decode(&bytes).is_err());
    }
}
