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

//! Wire format of pipeline connections.
//!
//! Every message is a little-endian `u32` length followed by that many
//! bytes. A data frame is a header Hash message followed by one body
//! message holding the concatenated encoded items.

use std::fmt;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::{KaraboError, Result};
use crate::hash::{codec, Hash, HashValue, Timestamp};

/// One element travelling through an output.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// A data Hash and the time it belongs to.
    Data {
        /// Payload.
        data: Hash,
        /// Stamp sent along in `sourceInfo`.
        timestamp: Timestamp,
    },
    /// The producer finished a stream.
    EndOfStream,
}

/// Metadata delivered alongside each received Hash.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineMeta {
    /// `<instanceId>:<channel>` of the sending output.
    pub source: String,
    /// Time stamp the producer attached.
    pub timestamp: Option<Timestamp>,
}

/// A decoded frame on the input side.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Items with their metadata, in sending order.
    Data(Vec<(Hash, PipelineMeta)>),
    /// The producer signalled end of stream.
    EndOfStream,
}

/// How an output spreads frames over several inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Each frame goes to exactly one shared input.
    Shared,
    /// Every copy input gets its own stream.
    #[default]
    Copy,
}

impl Distribution {
    /// Wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Copy => "copy",
        }
    }
}

impl FromStr for Distribution {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "shared" => Ok(Self::Shared),
            "copy" => Ok(Self::Copy),
            other => Err(KaraboError::Protocol(format!("unknown dataDistribution '{other}'"))),
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens when an input cannot keep up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slowness {
    /// Frames the input is not ready for are lost.
    #[default]
    Drop,
    /// The producer waits for the input.
    Wait,
    /// A ring buffer holds the newest frames.
    QueueDrop,
}

impl Slowness {
    /// Wire spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Wait => "wait",
            Self::QueueDrop => "queueDrop",
        }
    }
}

impl FromStr for Slowness {
    type Err = KaraboError;

    /// Accepts the legacy spelling `queue` for [`Slowness::QueueDrop`].
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drop" => Ok(Self::Drop),
            "wait" => Ok(Self::Wait),
            "queueDrop" | "queue" => Ok(Self::QueueDrop),
            other => Err(KaraboError::Protocol(format!("unknown onSlowness '{other}'"))),
        }
    }
}

impl fmt::Display for Slowness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First message of an input after connecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    /// `<instanceId>:<input name>` of the input.
    pub instance_id: String,
    /// Requested distribution.
    pub distribution: Distribution,
    /// Requested slowness policy, only used for copy inputs.
    pub on_slowness: Slowness,
    /// Requested ring size for `queueDrop`.
    pub max_queue_length: u32,
}

impl Hello {
    /// Wire form of the greeting.
    pub fn to_hash(&self) -> Hash {
        Hash::new()
            .with("reason", "hello")
            .with("instanceId", self.instance_id.as_str())
            .with("memoryLocation", "remote")
            .with("dataDistribution", self.distribution.as_str())
            .with("onSlowness", self.on_slowness.as_str())
            .with("maxQueueLength", self.max_queue_length)
    }

    /// Parses a greeting; a missing `maxQueueLength` takes the default.
    pub fn from_hash(hash: &Hash, default_queue_length: u32) -> Result<Self> {
        if hash.get_str("reason") != Some("hello") {
            return Err(KaraboError::Protocol("expected a hello message".into()));
        }
        let field = |key: &str| {
            hash.get_str(key)
                .ok_or_else(|| KaraboError::Protocol(format!("hello without {key}")))
        };
        let max_queue_length = hash
            .get("maxQueueLength")
            .and_then(HashValue::as_u64)
            .map_or(default_queue_length, |n| u32::try_from(n).unwrap_or(u32::MAX));
        Ok(Self {
            instance_id: field("instanceId")?.to_string(),
            distribution: field("dataDistribution")?.parse()?,
            on_slowness: field("onSlowness")?.parse()?,
            max_queue_length,
        })
    }
}

/// Acknowledgement an input sends after each frame.
pub fn update_message(instance_id: &str) -> Hash {
    Hash::new()
        .with("reason", "update")
        .with("instanceId", instance_id)
}

/// Whether `hash` is a flow-control acknowledgement.
pub fn is_update(hash: &Hash) -> bool {
    hash.get_str("reason") == Some("update")
}

/// Encodes the data items of `items` as header plus body.
///
/// Returns `None` when there is nothing to send.
pub fn encode_data(items: &[Item], source: &str) -> Option<Vec<u8>> {
    let mut sizes = Vec::new();
    let mut infos = Vec::new();
    let mut body = Vec::new();
    for item in items {
        let Item::Data { data, timestamp } = item else {
            continue;
        };
        let start = body.len();
        codec::encode_into(&mut body, data);
        sizes.push(u32::try_from(body.len() - start).unwrap_or(u32::MAX));
        let mut info = Hash::new().with("source", source);
        info.set_element("timestamp", true, timestamp.to_attributes());
        infos.push(info);
    }
    if sizes.is_empty() {
        return None;
    }
    let header = Hash::new()
        .with("nData", u32::try_from(sizes.len()).unwrap_or(u32::MAX))
        .with("byteSizes", HashValue::VectorUInt32(sizes))
        .with("sourceInfo", HashValue::VectorHash(infos));
    let mut out = Vec::with_capacity(body.len() + 64);
    push_message(&mut out, &codec::encode(&header));
    push_message(&mut out, &body);
    Some(out)
}

/// End-of-stream header plus its empty body.
pub fn encode_end_of_stream() -> Vec<u8> {
    let header = Hash::new()
        .with("endOfStream", true)
        .with("byteSizes", HashValue::VectorUInt32(Vec::new()));
    let mut out = Vec::new();
    push_message(&mut out, &codec::encode(&header));
    push_message(&mut out, &[]);
    out
}

fn push_message(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Splits a header and its body into items.
pub fn decode_frame(header: &Hash, body: &[u8]) -> Result<Frame> {
    if header.get("endOfStream").and_then(HashValue::as_bool) == Some(true) {
        return Ok(Frame::EndOfStream);
    }
    let sizes = header
        .get("byteSizes")
        .and_then(HashValue::as_vec_u32)
        .ok_or_else(|| KaraboError::Protocol("frame header without byteSizes".into()))?;
    let infos = header
        .get("sourceInfo")
        .and_then(HashValue::as_vec_hash)
        .unwrap_or_default();
    let total: usize = sizes.iter().map(|&n| n as usize).sum();
    if total != body.len() {
        return Err(KaraboError::Protocol(format!(
            "frame body has {} bytes, header announces {total}",
            body.len()
        )));
    }
    let mut items = Vec::with_capacity(sizes.len());
    let mut pos = 0;
    for (index, &size) in sizes.iter().enumerate() {
        let end = pos + size as usize;
        let data = codec::decode(&body[pos..end])?;
        pos = end;
        let meta = match infos.get(index) {
            Some(info) => PipelineMeta {
                source: info.get_str("source").unwrap_or_default().to_string(),
                timestamp: info
                    .get_attributes("timestamp")
                    .and_then(Timestamp::from_attributes),
            },
            None => PipelineMeta {
                source: String::new(),
                timestamp: None,
            },
        };
        items.push((data, meta));
    }
    Ok(Frame::Data(items))
}

/// Reads one length-prefixed message.
///
/// `Ok(None)` means the peer closed the connection between messages.
pub async fn read_message<R>(reader: &mut R, max_size: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await.map_err(io_error)?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(KaraboError::Protocol("connection closed inside a size prefix".into()))
            };
        }
        filled += n;
    }
    let size = u32::from_le_bytes(prefix) as usize;
    if size > max_size {
        return Err(KaraboError::Protocol(format!(
            "message of {size} bytes exceeds the limit of {max_size}"
        )));
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await.map_err(io_error)?;
    Ok(Some(payload))
}

/// Reads one Hash message; `Ok(None)` on a clean close.
pub async fn read_hash<R>(reader: &mut R, max_size: usize) -> Result<Option<Hash>>
where
    R: AsyncRead + Unpin,
{
    match read_message(reader, max_size).await? {
        Some(bytes) => Ok(Some(codec::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Writes one Hash message and flushes.
pub async fn write_hash<W>(writer: &mut W, hash: &Hash) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = Vec::new();
    push_message(&mut out, &codec::encode(hash));
    writer.write_all(&out).await.map_err(io_error)?;
    writer.flush().await.map_err(io_error)
}

pub(crate) fn io_error(e: std::io::Error) -> KaraboError {
    KaraboError::Io(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(n: i32, tid: u64) -> Item {
        Item::Data {
            data: Hash::new().with("n", n),
            timestamp: Timestamp::now().with_tid(tid),
        }
    }

    async fn split_frame(bytes: Vec<u8>) -> (Hash, Vec<u8>) {
        let mut reader = bytes.as_slice();
        let header = read_hash(&mut reader, 1 << 20).await.unwrap().unwrap();
        let body = read_message(&mut reader, 1 << 20).await.unwrap().unwrap();
        assert!(reader.is_empty());
        (header, body)
    }

    #[tokio::test]
    async fn data_frame_carries_sizes_and_sources() {
        let bytes = encode_data(&[item(1, 7), item(2, 8)], "cam/1:output").unwrap();
        let (header, body) = split_frame(bytes).await;

        assert_eq!(header.get("nData").and_then(HashValue::as_u64), Some(2));
        let sizes = header.get("byteSizes").and_then(HashValue::as_vec_u32).unwrap();
        assert_eq!(sizes.iter().map(|&n| n as usize).sum::<usize>(), body.len());

        let Frame::Data(items) = decode_frame(&header, &body).unwrap() else {
            panic!("expected data");
        };
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].0.get("n"), Some(&HashValue::Int32(2)));
        assert_eq!(items[0].1.source, "cam/1:output");
        assert_eq!(items[1].1.timestamp.map(|t| t.tid), Some(8));
    }

    #[tokio::test]
    async fn end_of_stream_has_empty_body() {
        let (header, body) = split_frame(encode_end_of_stream()).await;
        assert!(body.is_empty());
        assert_eq!(decode_frame(&header, &body).unwrap(), Frame::EndOfStream);
        assert!(encode_data(&[Item::EndOfStream], "x:y").is_none());
    }

    #[tokio::test]
    async fn truncated_and_oversized_messages_fail() {
        let mut reader: &[u8] = &[3, 0];
        assert!(matches!(read_message(&mut reader, 16).await, Err(KaraboError::Protocol(_))));

        let mut reader: &[u8] = &[32, 0, 0, 0];
        assert!(matches!(read_message(&mut reader, 16).await, Err(KaraboError::Protocol(_))));

        let mut reader: &[u8] = &[];
        assert_eq!(read_message(&mut reader, 16).await, Ok(None));
    }

    #[test]
    fn hello_accepts_legacy_queue_policy() {
        let mut hash = Hello {
            instance_id: "sink:input".into(),
            distribution: Distribution::Copy,
            on_slowness: Slowness::QueueDrop,
            max_queue_length: 5,
        }
        .to_hash();
        hash.set("onSlowness", "queue");
        hash.remove("maxQueueLength");

        let hello = Hello::from_hash(&hash, 2).unwrap();
        assert_eq!(hello.on_slowness, Slowness::QueueDrop);
        assert_eq!(hello.max_queue_length, 2);
        assert!(Hello::from_hash(&update_message("sink:input"), 2).is_err());
    }
}
