// ODB - Origin Debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Binary layout of the trace file.
//!
//! ```text
//! Header (36 B):  magic "RTRC" | version u16 | flags u16 | thread_count u16
//!                 | reserved u16 | created_ns u64 | code_table_offset u64
//!                 | index_offset u64
//! Segments:       per-thread chunks, each
//!                 { thread_id u16, seg_len u64, start_counter u64 } + events
//! Event:          tag u8 | payload_len varint | payload | crc32 u32
//! Code table:     count varint | entries | crc32 u32
//! Index tail:     count varint | (key varint, offset varint)* | crc32 u32
//! ```
//!
//! The fixed-width header and segment headers are little-endian; everything
//! inside payloads is varint-encoded. Every event carries its own checksum so
//! a torn tail is detected record-by-record.
//!
//! Forward compatibility: the low nibble of an event tag names the record
//! kind and the high nibble hints its produced arity; a reader that does not
//! know a kind skips the record wholesale via `payload_len`, and known kinds
//! ignore unrecognized trailing payload bytes.

use std::io::Write;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use odb_common::opcode::Opcode;
use odb_common::types::{
    AbortEvent, AbortReason, Binding, CodeInfo, ExternalCall, InstructionEvent, Tok, TraceEvent,
};
use smallvec::SmallVec;

use crate::error::ReplayError;

/// Magic byte sequence opening every trace file.
pub const MAGIC: &[u8; 4] = b"RTRC";
/// Current format version.
pub const VERSION: u16 = 1;
/// Fixed header length in bytes.
pub const HEADER_LEN: u64 = 36;
/// Fixed segment-header length in bytes.
pub const SEGMENT_HEADER_LEN: u64 = 18;
/// One sparse index entry is emitted every this many events per thread.
pub const INDEX_STRIDE: u64 = 4096;

/// Header flag: the session aborted and the trace is incomplete.
pub const FLAG_TRUNCATED: u16 = 1 << 0;
/// Header flag: this file continues a parent process's trace after a fork.
pub const FLAG_CONTINUATION: u16 = 1 << 1;

/// Event-tag kind: an executed opcode.
pub const TAG_KIND_INSTR: u8 = 0x01;
/// Event-tag kind: early session termination.
pub const TAG_KIND_ABORT: u8 = 0x02;
/// Mask extracting the kind nibble from a tag.
pub const TAG_KIND_MASK: u8 = 0x0f;

/// Compose an event tag from its kind and produced-arity hint.
pub fn tag_for(kind: u8, produced_arity: usize) -> u8 {
    ((produced_arity.min(15) as u8) << 4) | (kind & TAG_KIND_MASK)
}

/// Variable-length integer coding shared by all payloads.
pub mod varint {
    use crate::error::ReplayError;

    /// Append `value` as a little-endian base-128 varint.
    pub fn encode(mut value: u64, buf: &mut Vec<u8>) {
        loop {
            if value < 0x80 {
                buf.push(value as u8);
                break;
            }
            buf.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
    }

    /// Decode a varint from `buf` at `*pos`, advancing `*pos`.
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<u64, ReplayError> {
        let mut result = 0u64;
        let mut shift = 0;

        loop {
            let Some(&byte) = buf.get(*pos) else {
                return Err(ReplayError::Corrupt {
                    offset: *pos as u64,
                    detail: "unexpected end of file in varint".to_string(),
                });
            };
            *pos += 1;

            result |= ((byte & 0x7f) as u64) << shift;

            if byte & 0x80 == 0 {
                return Ok(result);
            }

            shift += 7;
            if shift >= 64 {
                return Err(ReplayError::Corrupt {
                    offset: *pos as u64,
                    detail: "varint longer than 64 bits".to_string(),
                });
            }
        }
    }
}

fn encode_str(s: &str, buf: &mut Vec<u8>) {
    varint::encode(s.len() as u64, buf);
    buf.extend_from_slice(s.as_bytes());
}

fn decode_str(buf: &[u8], pos: &mut usize) -> Result<String, ReplayError> {
    let len = varint::decode(buf, pos)? as usize;
    let end = pos.checked_add(len).filter(|end| *end <= buf.len()).ok_or_else(|| {
        ReplayError::Corrupt {
            offset: *pos as u64,
            detail: "string runs past end of buffer".to_string(),
        }
    })?;
    let s = std::str::from_utf8(&buf[*pos..end])
        .map_err(|_| ReplayError::Corrupt {
            offset: *pos as u64,
            detail: "string is not valid UTF-8".to_string(),
        })?
        .to_string();
    *pos = end;
    Ok(s)
}

/// Fixed-width file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    /// Format version
    pub version: u16,
    /// [`FLAG_TRUNCATED`] / [`FLAG_CONTINUATION`] bits
    pub flags: u16,
    /// Number of guest threads with at least one event
    pub thread_count: u16,
    /// Wall-clock creation time, nanoseconds since the Unix epoch
    pub created_ns: u64,
    /// Absolute offset of the code table; `0` until the file is finalized
    pub code_table_offset: u64,
    /// Absolute offset of the index tail; `0` until the file is finalized
    pub index_offset: u64,
}

impl TraceHeader {
    /// Serialize the header into its fixed 36-byte form.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_all(MAGIC)?;
        out.write_u16::<LittleEndian>(self.version)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.thread_count)?;
        out.write_u16::<LittleEndian>(0)?; // reserved
        out.write_u64::<LittleEndian>(self.created_ns)?;
        out.write_u64::<LittleEndian>(self.code_table_offset)?;
        out.write_u64::<LittleEndian>(self.index_offset)?;
        Ok(())
    }

    /// Parse a header from the start of `data`.
    pub fn read_from(data: &[u8]) -> Result<Self, ReplayError> {
        if data.len() < HEADER_LEN as usize {
            return Err(ReplayError::Corrupt {
                offset: 0,
                detail: format!("file shorter than the {HEADER_LEN}-byte header"),
            });
        }
        if &data[..4] != MAGIC {
            return Err(ReplayError::Corrupt {
                offset: 0,
                detail: "bad magic; not a trace file".to_string(),
            });
        }
        let mut rest = &data[4..];
        let version = rest.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(ReplayError::Corrupt {
                offset: 4,
                detail: format!("unsupported trace version {version} (expected {VERSION})"),
            });
        }
        let flags = rest.read_u16::<LittleEndian>()?;
        let thread_count = rest.read_u16::<LittleEndian>()?;
        let _reserved = rest.read_u16::<LittleEndian>()?;
        let created_ns = rest.read_u64::<LittleEndian>()?;
        let code_table_offset = rest.read_u64::<LittleEndian>()?;
        let index_offset = rest.read_u64::<LittleEndian>()?;
        Ok(Self { version, flags, thread_count, created_ns, code_table_offset, index_offset })
    }
}

/// Per-thread segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Thread whose events this segment holds
    pub thread_id: u16,
    /// Length in bytes of the event payload following this header
    pub seg_len: u64,
    /// Counter of the first event in the segment
    pub start_counter: u64,
}

impl SegmentHeader {
    /// Serialize into the fixed 18-byte form.
    pub fn write_to<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        out.write_u16::<LittleEndian>(self.thread_id)?;
        out.write_u64::<LittleEndian>(self.seg_len)?;
        out.write_u64::<LittleEndian>(self.start_counter)?;
        Ok(())
    }

    /// Parse a segment header at `*pos`, advancing `*pos`.
    pub fn read_from(data: &[u8], pos: &mut usize) -> Result<Self, ReplayError> {
        let end = *pos + SEGMENT_HEADER_LEN as usize;
        if end > data.len() {
            return Err(ReplayError::Corrupt {
                offset: *pos as u64,
                detail: "truncated segment header".to_string(),
            });
        }
        let mut slice = &data[*pos..end];
        let thread_id = slice.read_u16::<LittleEndian>()?;
        let seg_len = slice.read_u64::<LittleEndian>()?;
        let start_counter = slice.read_u64::<LittleEndian>()?;
        *pos = end;
        Ok(Self { thread_id, seg_len, start_counter })
    }
}

const EVENT_FLAG_FAULT: u64 = 1 << 0;
const EVENT_FLAG_EXT: u64 = 1 << 1;

fn encode_binding(binding: &Binding, buf: &mut Vec<u8>) {
    varint::encode(binding.name_id as u64, buf);
    varint::encode(binding.tok.raw(), buf);
    match &binding.repr {
        Some(repr) => {
            varint::encode(repr.len() as u64 + 1, buf);
            buf.extend_from_slice(repr.as_bytes());
        }
        None => varint::encode(0, buf),
    }
}

fn decode_binding(buf: &[u8], pos: &mut usize) -> Result<Binding, ReplayError> {
    let name_id = varint::decode(buf, pos)? as u32;
    let tok = Tok::from_raw(varint::decode(buf, pos)?);
    let repr_tag = varint::decode(buf, pos)? as usize;
    let repr = if repr_tag == 0 {
        None
    } else {
        let len = repr_tag - 1;
        let end = pos.checked_add(len).filter(|end| *end <= buf.len()).ok_or_else(|| {
            ReplayError::Corrupt {
                offset: *pos as u64,
                detail: "binding repr runs past end of buffer".to_string(),
            }
        })?;
        let s = String::from_utf8_lossy(&buf[*pos..end]).into_owned();
        *pos = end;
        Some(s)
    };
    Ok(Binding { name_id, tok, repr })
}

fn encode_tok_list(toks: &[Tok], buf: &mut Vec<u8>) {
    varint::encode(toks.len() as u64, buf);
    for tok in toks {
        varint::encode(tok.raw(), buf);
    }
}

fn decode_tok_list<const N: usize>(
    buf: &[u8],
    pos: &mut usize,
) -> Result<SmallVec<[Tok; N]>, ReplayError> {
    let count = varint::decode(buf, pos)? as usize;
    let mut toks = SmallVec::new();
    for _ in 0..count {
        toks.push(Tok::from_raw(varint::decode(buf, pos)?));
    }
    Ok(toks)
}

/// Append one event record (tag, length, payload, checksum) to `buf`.
pub fn encode_event(event: &TraceEvent, buf: &mut Vec<u8>) {
    let mut payload = Vec::with_capacity(64);
    let tag = match event {
        TraceEvent::Instr(e) => {
            varint::encode(e.counter, &mut payload);
            varint::encode(e.frame_ord, &mut payload);
            varint::encode(e.thread_id as u64, &mut payload);
            varint::encode(e.opcode.as_u16() as u64, &mut payload);
            varint::encode(e.arg as u64, &mut payload);
            varint::encode(e.code_id as u64, &mut payload);
            varint::encode(e.instr_offset as u64, &mut payload);
            let mut flags = 0u64;
            if e.fault {
                flags |= EVENT_FLAG_FAULT;
            }
            if e.ext.is_some() {
                flags |= EVENT_FLAG_EXT;
            }
            varint::encode(flags, &mut payload);
            encode_tok_list(&e.consumed, &mut payload);
            encode_tok_list(&e.produced, &mut payload);
            varint::encode(e.reads.len() as u64, &mut payload);
            for binding in &e.reads {
                encode_binding(binding, &mut payload);
            }
            varint::encode(e.writes.len() as u64, &mut payload);
            for binding in &e.writes {
                encode_binding(binding, &mut payload);
            }
            if let Some(ext) = &e.ext {
                encode_str(&ext.callee_name, &mut payload);
                varint::encode(ext.signature_hash, &mut payload);
            }
            tag_for(TAG_KIND_INSTR, e.produced.len())
        }
        TraceEvent::Abort(e) => {
            varint::encode(e.counter, &mut payload);
            varint::encode(e.thread_id as u64, &mut payload);
            encode_str(e.reason.as_str(), &mut payload);
            tag_for(TAG_KIND_ABORT, 0)
        }
    };

    buf.push(tag);
    varint::encode(payload.len() as u64, buf);
    let crc = crc32fast::hash(&payload);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Decode one event record at `*pos`, advancing `*pos` past it.
///
/// Returns `Ok(None)` for records of unknown kind, which are skipped via
/// their length field.
pub fn decode_event(data: &[u8], pos: &mut usize) -> Result<Option<TraceEvent>, ReplayError> {
    let Some(&tag) = data.get(*pos) else {
        return Err(ReplayError::Corrupt {
            offset: *pos as u64,
            detail: "truncated event record".to_string(),
        });
    };
    *pos += 1;
    let payload_len = varint::decode(data, pos)? as usize;
    let payload_start = *pos;
    let payload_end =
        payload_start.checked_add(payload_len).filter(|end| *end + 4 <= data.len()).ok_or_else(
            || ReplayError::Corrupt {
                offset: payload_start as u64,
                detail: "event payload runs past end of buffer".to_string(),
            },
        )?;
    let payload = &data[payload_start..payload_end];
    let stored_crc = u32::from_le_bytes(
        data[payload_end..payload_end + 4].try_into().expect("bounds checked above"),
    );
    if crc32fast::hash(payload) != stored_crc {
        return Err(ReplayError::Corrupt {
            offset: payload_start as u64,
            detail: "event checksum mismatch".to_string(),
        });
    }
    *pos = payload_end + 4;

    let mut p = 0usize;
    match tag & TAG_KIND_MASK {
        TAG_KIND_INSTR => {
            let counter = varint::decode(payload, &mut p)?;
            let frame_ord = varint::decode(payload, &mut p)?;
            let thread_id = varint::decode(payload, &mut p)? as u16;
            let raw_opcode = varint::decode(payload, &mut p)? as u16;
            let arg = varint::decode(payload, &mut p)? as u32;
            let code_id = varint::decode(payload, &mut p)? as u32;
            let instr_offset = varint::decode(payload, &mut p)? as u32;
            let flags = varint::decode(payload, &mut p)?;
            let consumed = decode_tok_list::<2>(payload, &mut p)?;
            let produced = decode_tok_list::<1>(payload, &mut p)?;
            let n_reads = varint::decode(payload, &mut p)? as usize;
            let mut reads = SmallVec::new();
            for _ in 0..n_reads {
                reads.push(decode_binding(payload, &mut p)?);
            }
            let n_writes = varint::decode(payload, &mut p)? as usize;
            let mut writes = SmallVec::new();
            for _ in 0..n_writes {
                writes.push(decode_binding(payload, &mut p)?);
            }
            let ext = if flags & EVENT_FLAG_EXT != 0 {
                let callee_name = decode_str(payload, &mut p)?;
                let signature_hash = varint::decode(payload, &mut p)?;
                Some(ExternalCall { callee_name, signature_hash })
            } else {
                None
            };
            let Some(opcode) = Opcode::from_u16(raw_opcode) else {
                // Opcode added by a newer writer: drop the record, like an
                // unknown tag. The arity hint in the tag keeps summaries sane.
                return Ok(None);
            };
            // Trailing payload bytes belong to fields from a newer writer
            // and are deliberately ignored.
            Ok(Some(TraceEvent::Instr(InstructionEvent {
                counter,
                frame_ord,
                thread_id,
                opcode,
                arg,
                code_id,
                instr_offset,
                consumed,
                produced,
                reads,
                writes,
                fault: flags & EVENT_FLAG_FAULT != 0,
                ext,
            })))
        }
        TAG_KIND_ABORT => {
            let counter = varint::decode(payload, &mut p)?;
            let thread_id = varint::decode(payload, &mut p)? as u16;
            let reason_str = decode_str(payload, &mut p)?;
            let reason =
                AbortReason::from_str_opt(&reason_str).unwrap_or(AbortReason::TraceCorruption);
            Ok(Some(TraceEvent::Abort(AbortEvent { counter, thread_id, reason })))
        }
        _ => Ok(None),
    }
}

/// Serialize the code table (with trailing checksum).
pub fn encode_code_table(codes: &[CodeInfo], buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    varint::encode(codes.len() as u64, &mut payload);
    for code in codes {
        varint::encode(code.code_id as u64, &mut payload);
        encode_str(&code.name, &mut payload);
        encode_str(&code.source_path.to_string_lossy(), &mut payload);
        varint::encode(code.line_map.len() as u64, &mut payload);
        for (offset, line) in &code.line_map {
            varint::encode(*offset as u64, &mut payload);
            varint::encode(*line as u64, &mut payload);
        }
        varint::encode(code.local_names.len() as u64, &mut payload);
        for name in &code.local_names {
            encode_str(name, &mut payload);
        }
        varint::encode(code.const_reprs.len() as u64, &mut payload);
        for repr in &code.const_reprs {
            encode_str(repr, &mut payload);
        }
    }
    let crc = crc32fast::hash(&payload);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Parse the code table at `*pos`.
pub fn decode_code_table(data: &[u8], pos: &mut usize) -> Result<Vec<CodeInfo>, ReplayError> {
    let payload_start = *pos;
    let count = varint::decode(data, pos)? as usize;
    let mut codes = Vec::with_capacity(count);
    for _ in 0..count {
        let code_id = varint::decode(data, pos)? as u32;
        let name = decode_str(data, pos)?;
        let source_path = decode_str(data, pos)?.into();
        let n_lines = varint::decode(data, pos)? as usize;
        let mut line_map = Vec::with_capacity(n_lines);
        for _ in 0..n_lines {
            let offset = varint::decode(data, pos)? as u32;
            let line = varint::decode(data, pos)? as u32;
            line_map.push((offset, line));
        }
        let n_names = varint::decode(data, pos)? as usize;
        let mut local_names = Vec::with_capacity(n_names);
        for _ in 0..n_names {
            local_names.push(decode_str(data, pos)?);
        }
        let n_consts = varint::decode(data, pos)? as usize;
        let mut const_reprs = Vec::with_capacity(n_consts);
        for _ in 0..n_consts {
            const_reprs.push(decode_str(data, pos)?);
        }
        codes.push(CodeInfo { code_id, name, source_path, line_map, local_names, const_reprs });
    }
    let payload_end = *pos;
    if payload_end + 4 > data.len() {
        return Err(ReplayError::Corrupt {
            offset: payload_end as u64,
            detail: "code table missing checksum".to_string(),
        });
    }
    let stored_crc =
        u32::from_le_bytes(data[payload_end..payload_end + 4].try_into().expect("bounds checked"));
    if crc32fast::hash(&data[payload_start..payload_end]) != stored_crc {
        return Err(ReplayError::Corrupt {
            offset: payload_start as u64,
            detail: "code table checksum mismatch".to_string(),
        });
    }
    *pos = payload_end + 4;
    Ok(codes)
}

/// One sparse-index entry: a `(thread, counter)` key and the absolute file
/// offset of that event's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// `thread_id << 48 | counter`, the same packing as a token
    pub key: u64,
    /// Absolute byte offset of the event record
    pub offset: u64,
}

/// Serialize the index tail (with trailing checksum).
pub fn encode_index(entries: &[IndexEntry], buf: &mut Vec<u8>) {
    let mut payload = Vec::new();
    varint::encode(entries.len() as u64, &mut payload);
    for entry in entries {
        varint::encode(entry.key, &mut payload);
        varint::encode(entry.offset, &mut payload);
    }
    let crc = crc32fast::hash(&payload);
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Parse the index tail at `*pos`.
pub fn decode_index(data: &[u8], pos: &mut usize) -> Result<Vec<IndexEntry>, ReplayError> {
    let payload_start = *pos;
    let count = varint::decode(data, pos)? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let key = varint::decode(data, pos)?;
        let offset = varint::decode(data, pos)?;
        entries.push(IndexEntry { key, offset });
    }
    let payload_end = *pos;
    if payload_end + 4 > data.len() {
        return Err(ReplayError::Corrupt {
            offset: payload_end as u64,
            detail: "index missing checksum".to_string(),
        });
    }
    let stored_crc =
        u32::from_le_bytes(data[payload_end..payload_end + 4].try_into().expect("bounds checked"));
    if crc32fast::hash(&data[payload_start..payload_end]) != stored_crc {
        return Err(ReplayError::Corrupt {
            offset: payload_start as u64,
            detail: "index checksum mismatch".to_string(),
        });
    }
    *pos = payload_end + 4;
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn sample_event() -> InstructionEvent {
        InstructionEvent {
            counter: 7,
            frame_ord: 2,
            thread_id: 0,
            opcode: Opcode::BinaryOp,
            arg: 2,
            code_id: 1,
            instr_offset: 14,
            consumed: smallvec![Tok::new(0, 5), Tok::new(0, 6)],
            produced: smallvec![Tok::new(0, 7)],
            reads: smallvec![],
            writes: smallvec![Binding { name_id: 3, tok: Tok::new(0, 7), repr: Some("0.3".into()) }],
            fault: false,
            ext: None,
        }
    }

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            varint::encode(value, &mut buf);
            let mut pos = 0;
            assert_eq!(varint::decode(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn test_event_round_trip() {
        let event = TraceEvent::Instr(sample_event());
        let mut buf = Vec::new();
        encode_event(&event, &mut buf);

        let mut pos = 0;
        let decoded = decode_event(&buf, &mut pos).unwrap().unwrap();
        assert_eq!(decoded, event);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_abort_event_round_trip() {
        let event = TraceEvent::Abort(AbortEvent {
            counter: 41,
            thread_id: 0,
            reason: AbortReason::ForkedChild,
        });
        let mut buf = Vec::new();
        encode_event(&event, &mut buf);
        let mut pos = 0;
        assert_eq!(decode_event(&buf, &mut pos).unwrap().unwrap(), event);
    }

    #[test]
    fn test_unknown_tag_is_skipped() {
        let mut buf = Vec::new();
        // Forge a record with kind nibble 0x0f and a valid frame
        let payload = [1u8, 2, 3];
        buf.push(tag_for(0x0f, 1));
        varint::encode(payload.len() as u64, &mut buf);
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        encode_event(&TraceEvent::Instr(sample_event()), &mut buf);

        let mut pos = 0;
        assert!(decode_event(&buf, &mut pos).unwrap().is_none());
        let second = decode_event(&buf, &mut pos).unwrap().unwrap();
        assert_eq!(second.counter(), 7);
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_unknown_trailing_fields_are_ignored() {
        // Re-frame a valid event with extra payload bytes appended, as a
        // newer writer would
        let event = sample_event();
        let mut framed = Vec::new();
        encode_event(&TraceEvent::Instr(event.clone()), &mut framed);

        let mut pos = 0;
        let tag = framed[pos];
        pos += 1;
        let payload_len = varint::decode(&framed, &mut pos).unwrap() as usize;
        let mut payload = framed[pos..pos + payload_len].to_vec();
        payload.extend_from_slice(&[0xaa, 0xbb, 0xcc]);

        let mut buf = vec![tag];
        varint::encode(payload.len() as u64, &mut buf);
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

        let mut pos = 0;
        let decoded = decode_event(&buf, &mut pos).unwrap().unwrap();
        assert_eq!(decoded, TraceEvent::Instr(event));
    }

    #[test]
    fn test_corrupt_checksum_is_detected() {
        let mut buf = Vec::new();
        encode_event(&TraceEvent::Instr(sample_event()), &mut buf);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut pos = 0;
        assert!(matches!(
            decode_event(&buf, &mut pos),
            Err(ReplayError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_header_round_trip() {
        let header = TraceHeader {
            version: VERSION,
            flags: FLAG_TRUNCATED,
            thread_count: 2,
            created_ns: 1_700_000_000_000_000_000,
            code_table_offset: 4096,
            index_offset: 8192,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len() as u64, HEADER_LEN);
        assert_eq!(TraceHeader::read_from(&buf).unwrap(), header);
    }

    #[test]
    fn test_code_table_round_trip() {
        let codes = vec![CodeInfo {
            code_id: 0,
            name: "main".into(),
            source_path: "pipeline.dyn".into(),
            line_map: vec![(0, 1), (4, 2)],
            local_names: vec!["a".into(), "b".into()],
            const_reprs: vec!["30".into(), "0.01".into()],
        }];
        let mut buf = Vec::new();
        encode_code_table(&codes, &mut buf);
        let mut pos = 0;
        assert_eq!(decode_code_table(&buf, &mut pos).unwrap(), codes);
        assert_eq!(pos, buf.len());
    }
}
