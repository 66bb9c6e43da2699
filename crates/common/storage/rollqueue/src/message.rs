// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entry framing inside a cycle file.
//!
//! ```text
//! ┌──────────────────────┬──────────────────────┬──────────┬─────────┬─────┐
//! │ header word (8B)     │ history (optional)   │ payload  │ crc (4B)│ pad │
//! └──────────────────────┴──────────────────────┴──────────┴─────────┴─────┘
//! header word: bits 0..32 body length, bits 32..40 kind, bit 40 history flag
//! history:     count (u16) then count × { source_id (u32), index (u64) }
//! crc:         CRC-32 (IEEE) over the header word (LE) and the body
//! ```
//!
//! The header word is stored last, with release ordering, so a reader that
//! sees a nonzero header also sees the complete body. Entries are padded to
//! 8 bytes to keep every header word aligned.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32fast::Hasher;
use snafu::ensure;

use crate::{Result, error::EncodingOverflowSnafu};

/// A message read from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Global index: cycle in the high bits, sequence in the low bits.
    pub index: u64,

    /// Source id of the queue the message was read from.
    pub source_id: u32,

    /// Indices of this message in the queues it was replayed from.
    pub history: MessageHistory,

    /// The message payload.
    pub payload: Bytes,
}

/// One hop of a replayed message: where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceEntry {
    pub source_id: u32,
    pub index:     u64,
}

/// Ordered list of the `(source_id, index)` pairs a message passed through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageHistory {
    entries: Vec<SourceEntry>,
}

impl MessageHistory {
    #[must_use]
    pub const fn new() -> Self { Self { entries: Vec::new() } }

    pub fn push(&mut self, source_id: u32, index: u64) {
        self.entries.push(SourceEntry { source_id, index });
    }

    #[must_use]
    pub fn entries(&self) -> &[SourceEntry] { &self.entries }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Index recorded for `source_id`, taking the latest hop if the message
    /// passed through that source more than once.
    #[must_use]
    pub fn index_for_source(&self, source_id: u32) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.source_id == source_id)
            .map(|entry| entry.index)
    }

    fn encoded_len(&self) -> usize { 2 + self.entries.len() * HISTORY_ENTRY_SIZE }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.entries.len() as u16);
        for entry in &self.entries {
            buf.put_u32_le(entry.source_id);
            buf.put_u64_le(entry.index);
        }
    }

    fn decode_from(buf: &mut &[u8]) -> Option<Self> {
        if buf.remaining() < 2 {
            return None;
        }
        let count = usize::from(buf.get_u16_le());
        if buf.remaining() < count * HISTORY_ENTRY_SIZE {
            return None;
        }
        let entries = (0..count)
            .map(|_| SourceEntry {
                source_id: buf.get_u32_le(),
                index:     buf.get_u64_le(),
            })
            .collect();
        Some(Self { entries })
    }
}

/// Size of the header word that precedes every entry.
pub(crate) const ENTRY_HEADER_SIZE: u64 = 8;

/// Size of the trailing CRC.
pub(crate) const ENTRY_CRC_SIZE: u64 = 4;

/// Most history hops a single message may carry.
pub const MAX_HISTORY_ENTRIES: usize = u16::MAX as usize;

const HISTORY_ENTRY_SIZE: usize = 4 + 8;

const KIND_SHIFT: u32 = 32;
const KIND_MASK: u64 = 0xff << KIND_SHIFT;
const KIND_DATA: u64 = 1 << KIND_SHIFT;
const KIND_EOF: u64 = 2 << KIND_SHIFT;
const HISTORY_FLAG: u64 = 1 << 40;
const LENGTH_MASK: u64 = 0xffff_ffff;

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryHeader {
    /// Nothing written here yet.
    Empty,
    Data { body_len: u32, has_history: bool },
    /// The appender moved on to a later cycle.
    EndOfCycle,
}

impl EntryHeader {
    /// Decode a header word; `None` for bit patterns no writer produces.
    pub(crate) const fn decode(word: u64) -> Option<Self> {
        if word == 0 {
            return Some(Self::Empty);
        }
        if word & !(LENGTH_MASK | KIND_MASK | HISTORY_FLAG) != 0 {
            return None;
        }
        match word & KIND_MASK {
            KIND_DATA => Some(Self::Data {
                body_len:    (word & LENGTH_MASK) as u32,
                has_history: word & HISTORY_FLAG != 0,
            }),
            KIND_EOF if word == KIND_EOF => Some(Self::EndOfCycle),
            _ => None,
        }
    }

    pub(crate) const fn end_of_cycle_word() -> u64 { KIND_EOF }

    /// Header word of a data entry.
    pub(crate) const fn data_word(body_len: u32, has_history: bool) -> u64 {
        let word = KIND_DATA | body_len as u64;
        if has_history { word | HISTORY_FLAG } else { word }
    }

    /// Bytes the entry occupies in the file, padding included.
    pub(crate) const fn disk_size(&self) -> u64 {
        match self {
            Self::Empty => 0,
            Self::EndOfCycle => ENTRY_HEADER_SIZE,
            Self::Data { body_len, .. } => entry_disk_size(*body_len as u64),
        }
    }
}

/// Bytes an entry with a `body_len`-byte body occupies, padded to 8.
#[inline]
pub(crate) const fn entry_disk_size(body_len: u64) -> u64 {
    (ENTRY_HEADER_SIZE + body_len + ENTRY_CRC_SIZE + 7) & !7
}

/// An entry ready to be copied into a cycle file.
#[derive(Debug)]
pub(crate) struct EncodedEntry {
    /// Header word, published after `body` is in place.
    pub header: u64,
    /// Body followed by CRC and padding.
    pub body:   Bytes,
}

impl EncodedEntry {
    /// Frame `payload`, preceded by `history` when it has hops.
    pub(crate) fn new(history: Option<&MessageHistory>, payload: &[u8]) -> Result<Self> {
        let history = history.filter(|h| !h.is_empty());
        let body_len = history.map_or(0, MessageHistory::encoded_len) + payload.len();
        let header = EntryHeader::data_word(checked_body_len(body_len)?, history.is_some());
        let disk_size = entry_disk_size(body_len as u64);

        let mut body = BytesMut::with_capacity((disk_size - ENTRY_HEADER_SIZE) as usize);
        if let Some(history) = history {
            history.encode_into(&mut body);
        }
        body.put_slice(payload);
        body.put_u32_le(entry_checksum(header, &body));
        body.resize((disk_size - ENTRY_HEADER_SIZE) as usize, 0);

        Ok(Self {
            header,
            body: body.freeze(),
        })
    }

    pub(crate) fn disk_size(&self) -> u64 { ENTRY_HEADER_SIZE + self.body.len() as u64 }
}

/// Body lengths must fit the 32-bit length field of the header word.
fn checked_body_len(body_len: usize) -> Result<u32> {
    ensure!(
        body_len as u64 <= LENGTH_MASK,
        EncodingOverflowSnafu {
            field: "body length",
            value: body_len as u64,
            bits:  32_u32,
        }
    );
    Ok(body_len as u32)
}

/// CRC-32 of a framed entry: its header word, then its body.
pub(crate) fn entry_checksum(header: u64, body: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&header.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Split a body into history and payload.
pub(crate) fn decode_body(body: Bytes, has_history: bool) -> Option<(MessageHistory, Bytes)> {
    if !has_history {
        return Some((MessageHistory::new(), body));
    }
    let mut cursor: &[u8] = &body;
    let history = MessageHistory::decode_from(&mut cursor)?;
    let consumed = body.len() - cursor.len();
    Some((history, body.slice(consumed..)))
}
