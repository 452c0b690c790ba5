use std::collections::HashSet;

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use crate::decode::decode_stream;
use crate::lexer::Cursor;
use crate::object::{RawAtom, RawDict};
use crate::parser::{parse_indirect_at, ObjParser};

/// Where a cross-reference entry says an object lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefEntry {
    /// Classic entry or xref-stream type 1: byte offset of `N G obj`.
    InFile { id: u32, offset: u64 },
    /// Xref-stream type 2: stored inside an object stream.
    InStream { id: u32, container: u32, index: u32 },
}

impl XrefEntry {
    pub fn id(&self) -> u32 {
        match self {
            XrefEntry::InFile { id, .. } | XrefEntry::InStream { id, .. } => *id,
        }
    }
}

/// One incremental revision: its entry table and trailer dictionary.
#[derive(Debug)]
pub struct Revision {
    pub offset: u64,
    pub entries: Vec<XrefEntry>,
    pub trailer: Option<RawDict>,
}

#[derive(Debug, Default)]
pub struct XrefChain {
    pub revisions: Vec<Revision>,
    pub errors: Vec<String>,
}

/// Follows the `startxref` -> `/Prev` chain, newest revision first. A seen
/// set breaks reference loops planted to stall the walker.
pub fn read_xref_chain(bytes: &[u8], max_decode_bytes: usize) -> XrefChain {
    let mut chain = XrefChain::default();
    let Some(start) = last_startxref(bytes) else {
        chain.errors.push("startxref marker not found".into());
        return chain;
    };
    let mut next = Some(start);
    let mut seen = HashSet::new();
    while let Some(off) = next {
        if !seen.insert(off) {
            warn!(
                security = true,
                domain = "pdf.xref",
                kind = "xref_loop_detected",
                offset = off,
                "Cross-reference chain loops"
            );
            chain.errors.push(format!("xref loop at offset {off}"));
            break;
        }
        if off as usize >= bytes.len() {
            warn!(
                security = true,
                domain = "pdf.xref",
                kind = "xref_offset_oob",
                offset = off,
                bytes_len = bytes.len(),
                "Cross-reference offset out of range"
            );
            chain.errors.push(format!("xref offset {off} out of range"));
            break;
        }
        let result = if bytes[off as usize..].starts_with(b"xref") {
            read_table(bytes, off as usize)
        } else {
            read_stream_section(bytes, off as usize, max_decode_bytes)
        };
        match result {
            Ok((revision, prev)) => {
                debug!(offset = off, entries = revision.entries.len(), "Parsed xref revision");
                chain.revisions.push(revision);
                next = prev;
            }
            Err(e) => {
                chain.errors.push(format!("xref section at {off}: {e}"));
                break;
            }
        }
    }
    chain
}

pub fn last_startxref(bytes: &[u8]) -> Option<u64> {
    let pos = memchr::memmem::rfind(bytes, b"startxref")?;
    let mut cur = Cursor::new(bytes, pos + b"startxref".len());
    cur.skip_ws();
    cur.read_uint()
}

fn read_table(bytes: &[u8], offset: usize) -> Result<(Revision, Option<u64>)> {
    let mut cur = Cursor::new(bytes, offset);
    cur.eat(b"xref");
    let mut entries = Vec::new();
    loop {
        cur.skip_ws();
        if cur.bytes[cur.pos..].starts_with(b"trailer") {
            break;
        }
        let Some(start_id) = cur.read_uint() else { break };
        cur.skip_ws();
        let Some(count) = cur.read_uint() else { break };
        for n in 0..count {
            cur.skip_ws();
            let Some(field_offset) = cur.read_uint() else {
                return Err(anyhow!("short xref subsection"));
            };
            cur.skip_ws();
            let Some(_gen) = cur.read_uint() else {
                return Err(anyhow!("short xref subsection"));
            };
            cur.skip_ws();
            let kind = cur.bump().ok_or_else(|| anyhow!("short xref subsection"))?;
            let id = (start_id + n) as u32;
            if kind == b'n' {
                entries.push(XrefEntry::InFile { id, offset: field_offset });
            }
        }
    }
    let mut trailer = None;
    let mut prev = None;
    if let Some(pos) = memchr::memmem::find(&bytes[cur.pos..], b"trailer") {
        let mut p = ObjParser::new(bytes, cur.pos + pos + b"trailer".len());
        p.skip_ws();
        if let Ok(RawAtom::Dict(d)) = p.parse_atom() {
            prev = prev_offset(&d);
            trailer = Some(d);
        }
    }
    Ok((Revision { offset: offset as u64, entries, trailer }, prev))
}

fn read_stream_section(
    bytes: &[u8],
    offset: usize,
    max_decode_bytes: usize,
) -> Result<(Revision, Option<u64>)> {
    let obj = parse_indirect_at(bytes, offset)?;
    let RawAtom::Stream { dict, data } = obj.atom else {
        return Err(anyhow!("no xref table or stream at offset"));
    };
    if !dict.has_name(b"/Type", b"/XRef") {
        return Err(anyhow!("stream at xref offset is not /Type /XRef"));
    }
    let widths = field_widths(&dict)?;
    let size = dict.get_int(b"/Size").unwrap_or(0).max(0) as u64;
    let index = index_pairs(&dict, size);
    let decoded = decode_stream(bytes, &dict, data, max_decode_bytes)?;
    let row_len: usize = widths.iter().sum();
    if row_len == 0 {
        return Err(anyhow!("xref stream has zero-width rows"));
    }
    let mut entries = Vec::new();
    let mut rows = decoded.data.chunks_exact(row_len);
    'outer: for (first, count) in index {
        for n in 0..count {
            let Some(row) = rows.next() else { break 'outer };
            let mut fields = [0u64; 3];
            let mut at = 0usize;
            for (slot, w) in widths.iter().enumerate() {
                let mut v = 0u64;
                for &b in &row[at..at + w] {
                    v = (v << 8) | b as u64;
                }
                fields[slot] = v;
                at += w;
            }
            // A zero-width type field defaults to type 1.
            let kind = if widths[0] == 0 { 1 } else { fields[0] };
            let id = (first + n) as u32;
            match kind {
                1 => entries.push(XrefEntry::InFile { id, offset: fields[1] }),
                2 => entries.push(XrefEntry::InStream {
                    id,
                    container: fields[1] as u32,
                    index: fields[2] as u32,
                }),
                _ => {}
            }
        }
    }
    let prev = prev_offset(&dict);
    Ok((Revision { offset: offset as u64, entries, trailer: Some(dict) }, prev))
}

fn field_widths(dict: &RawDict) -> Result<[usize; 3]> {
    let Some(RawAtom::Array(items)) = dict.get(b"/W") else {
        return Err(anyhow!("xref stream missing /W"));
    };
    if items.len() < 3 {
        return Err(anyhow!("xref stream /W too short"));
    }
    let mut widths = [0usize; 3];
    for (slot, item) in items.iter().take(3).enumerate() {
        match item {
            RawAtom::Int(i) if (0..=8).contains(i) => widths[slot] = *i as usize,
            _ => return Err(anyhow!("xref stream /W field out of range")),
        }
    }
    Ok(widths)
}

fn index_pairs(dict: &RawDict, size: u64) -> Vec<(u64, u64)> {
    if let Some(RawAtom::Array(items)) = dict.get(b"/Index") {
        let mut out = Vec::new();
        let mut iter = items.iter();
        while let (Some(RawAtom::Int(first)), Some(RawAtom::Int(count))) =
            (iter.next(), iter.next())
        {
            if *first >= 0 && *count >= 0 {
                out.push((*first as u64, *count as u64));
            }
        }
        if !out.is_empty() {
            return out;
        }
    }
    vec![(0, size)]
}

fn prev_offset(dict: &RawDict) -> Option<u64> {
    match dict.get_int(b"/Prev") {
        Some(v) if v >= 0 => Some(v as u64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{read_xref_chain, XrefEntry};

    #[test]
    fn classic_table_entries_and_trailer() {
        let doc = b"%PDF-1.4\n1 0 obj<<>>endobj\nxref\n0 2\n0000000000 65535 f \n0000000009 00000 n \ntrailer\n<< /Size 2 /Root 1 0 R >>\nstartxref\n27\n%%EOF";
        let chain = read_xref_chain(doc, 1 << 20);
        assert_eq!(chain.revisions.len(), 1);
        let rev = &chain.revisions[0];
        assert_eq!(rev.entries, vec![XrefEntry::InFile { id: 1, offset: 9 }]);
        assert!(rev.trailer.is_some());
    }

    #[test]
    fn missing_startxref_is_reported() {
        let chain = read_xref_chain(b"%PDF-1.4 nothing here", 1 << 20);
        assert!(chain.revisions.is_empty());
        assert!(!chain.errors.is_empty());
    }

    #[test]
    fn prev_loop_terminates() {
        // A table whose trailer /Prev points back at itself.
        let doc = b"xref\n0 1\n0000000000 65535 f \ntrailer\n<< /Size 1 /Prev 0 >>\nstartxref\n0\n%%EOF";
        let chain = read_xref_chain(doc, 1 << 20);
        assert_eq!(chain.revisions.len(), 1);
        assert!(chain.errors.iter().any(|e| e.contains("loop")));
    }
}
