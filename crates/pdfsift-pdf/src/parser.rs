use anyhow::{anyhow, Result};
use tracing::{trace, warn};

use crate::lexer::{is_delimiter, is_whitespace, Cursor, Span};
use crate::object::{IndirectObject, RawAtom, RawDict};

const MAX_ARRAY_ELEMENTS: usize = 100_000;
const MAX_DICT_ENTRIES: usize = 10_000;
const MAX_PARSE_DEPTH: usize = 64;

pub struct ObjParser<'a> {
    cur: Cursor<'a>,
}

impl<'a> ObjParser<'a> {
    pub fn new(bytes: &'a [u8], pos: usize) -> Self {
        Self { cur: Cursor::new(bytes, pos) }
    }

    pub fn position(&self) -> usize {
        self.cur.pos
    }

    pub fn skip_ws(&mut self) {
        self.cur.skip_ws();
    }

    pub fn eat(&mut self, token: &[u8]) -> bool {
        self.cur.eat(token)
    }

    pub fn parse_atom(&mut self) -> Result<RawAtom> {
        self.parse_atom_at_depth(0)
    }

    fn parse_atom_at_depth(&mut self, depth: usize) -> Result<RawAtom> {
        if depth >= MAX_PARSE_DEPTH {
            warn!(
                security = true,
                domain = "pdf.parser",
                kind = "parse_depth_exceeded",
                depth,
                "Value nesting too deep"
            );
            return Err(anyhow!("parse depth exceeded"));
        }
        self.cur.skip_ws();
        let b = self.cur.peek().ok_or_else(|| anyhow!("eof"))?;
        match b {
            b'/' => Ok(RawAtom::Name(self.parse_name()?)),
            b'<' => {
                if self.cur.peek_at(1) == Some(b'<') {
                    let dict = self.parse_dict(depth + 1)?;
                    if self.at_stream_keyword() {
                        self.parse_stream(dict)
                    } else {
                        Ok(RawAtom::Dict(dict))
                    }
                } else {
                    Ok(RawAtom::Str(self.parse_hex_string()))
                }
            }
            b'(' => Ok(RawAtom::Str(self.parse_literal_string())),
            b'[' => self.parse_array(depth + 1),
            b't' => {
                if self.cur.eat(b"true") {
                    Ok(RawAtom::Bool(true))
                } else {
                    Err(anyhow!("unexpected token at {}", self.cur.pos))
                }
            }
            b'f' => {
                if self.cur.eat(b"false") {
                    Ok(RawAtom::Bool(false))
                } else {
                    Err(anyhow!("unexpected token at {}", self.cur.pos))
                }
            }
            b'n' => {
                if self.cur.eat(b"null") {
                    Ok(RawAtom::Null)
                } else {
                    Err(anyhow!("unexpected token at {}", self.cur.pos))
                }
            }
            b'+' | b'-' | b'.' | b'0'..=b'9' => self.parse_number_or_ref(),
            other => Err(anyhow!("unexpected byte 0x{:02x} at {}", other, self.cur.pos)),
        }
    }

    /// A number may open an `N G R` indirect reference. Backtracks when the
    /// two-ints-then-R shape does not materialize.
    fn parse_number_or_ref(&mut self) -> Result<RawAtom> {
        let first = self.read_number_token()?;
        let after_first = self.cur.mark();
        self.cur.skip_ws();
        if let Ok(second) = self.read_number_token() {
            self.cur.skip_ws();
            if self.cur.eat(b"R") {
                if let (Number::Int(id), Number::Int(gen)) = (&first, &second) {
                    if *id >= 0 && *gen >= 0 && *id <= u32::MAX as i64 && *gen <= u16::MAX as i64 {
                        return Ok(RawAtom::Ref { id: *id as u32, gen: *gen as u16 });
                    }
                }
            }
        }
        self.cur.restore(after_first);
        Ok(match first {
            Number::Int(i) => RawAtom::Int(i),
            Number::Real(f) => RawAtom::Real(f),
        })
    }

    fn parse_array(&mut self, depth: usize) -> Result<RawAtom> {
        let _ = self.cur.bump();
        let mut out = Vec::new();
        loop {
            self.cur.skip_ws();
            if self.cur.peek() == Some(b']') {
                self.cur.bump();
                break;
            }
            if self.cur.eof() {
                break;
            }
            if out.len() >= MAX_ARRAY_ELEMENTS {
                warn!(
                    security = true,
                    domain = "pdf.parser",
                    kind = "array_size_limit_exceeded",
                    max_elements = MAX_ARRAY_ELEMENTS,
                    "Array size limit exceeded"
                );
                return Err(anyhow!("array size limit exceeded"));
            }
            out.push(self.parse_atom_at_depth(depth + 1)?);
        }
        Ok(RawAtom::Array(out))
    }

    fn parse_dict(&mut self, depth: usize) -> Result<RawDict> {
        self.cur.eat(b"<<");
        let mut entries = Vec::new();
        loop {
            self.cur.skip_ws();
            if self.cur.eat(b">>") {
                break;
            }
            if self.cur.eof() {
                break;
            }
            let key = self.parse_name()?;
            self.cur.skip_ws();
            if self.cur.peek() == Some(b'>') {
                // Value missing before dict close; tolerate.
                entries.push((key, RawAtom::Null));
                continue;
            }
            match self.parse_atom_at_depth(depth + 1) {
                Ok(val) => entries.push((key, val)),
                Err(_) => entries.push((key, RawAtom::Null)),
            }
            if entries.len() >= MAX_DICT_ENTRIES {
                warn!(
                    security = true,
                    domain = "pdf.parser",
                    kind = "dict_size_limit_exceeded",
                    max_entries = MAX_DICT_ENTRIES,
                    "Dictionary size limit exceeded"
                );
                return Err(anyhow!("dict size limit exceeded"));
            }
        }
        Ok(RawDict { entries })
    }

    fn parse_name(&mut self) -> Result<Vec<u8>> {
        if self.cur.peek() != Some(b'/') {
            return Err(anyhow!("expected name at {}", self.cur.pos));
        }
        self.cur.bump();
        let start = self.cur.pos;
        while let Some(b) = self.cur.peek() {
            if is_whitespace(b) || is_delimiter(b) {
                break;
            }
            self.cur.pos += 1;
        }
        Ok(decode_name(&self.cur.bytes[start..self.cur.pos]))
    }

    fn parse_literal_string(&mut self) -> Vec<u8> {
        let _ = self.cur.bump();
        let mut depth = 1usize;
        let mut out = Vec::new();
        while let Some(b) = self.cur.bump() {
            match b {
                b'(' => {
                    depth += 1;
                    out.push(b);
                }
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    out.push(b);
                }
                b'\\' => match self.cur.bump() {
                    Some(b'n') => out.push(b'\n'),
                    Some(b'r') => out.push(b'\r'),
                    Some(b't') => out.push(b'\t'),
                    Some(b'b') => out.push(0x08),
                    Some(b'f') => out.push(0x0c),
                    Some(c @ (b'(' | b')' | b'\\')) => out.push(c),
                    Some(c @ (b'\n' | b'\r')) => {
                        // Line continuation; \r\n collapses to nothing.
                        if c == b'\r' && self.cur.peek() == Some(b'\n') {
                            self.cur.bump();
                        }
                    }
                    Some(c @ b'0'..=b'7') => {
                        let mut val = c - b'0';
                        for _ in 0..2 {
                            match self.cur.peek() {
                                Some(d @ b'0'..=b'7') => {
                                    val = val.wrapping_mul(8).wrapping_add(d - b'0');
                                    self.cur.bump();
                                }
                                _ => break,
                            }
                        }
                        out.push(val);
                    }
                    Some(other) => out.push(other),
                    None => break,
                },
                _ => out.push(b),
            }
        }
        out
    }

    fn parse_hex_string(&mut self) -> Vec<u8> {
        let _ = self.cur.bump();
        let mut digits = Vec::new();
        while let Some(b) = self.cur.bump() {
            if b == b'>' {
                break;
            }
            if is_whitespace(b) {
                continue;
            }
            digits.push(b);
        }
        let mut out = Vec::with_capacity(digits.len() / 2 + 1);
        let mut i = 0;
        while i < digits.len() {
            let hi = digits[i];
            let lo = if i + 1 < digits.len() { digits[i + 1] } else { b'0' };
            if let (Some(h), Some(l)) = (hex_val(hi), hex_val(lo)) {
                out.push((h << 4) | l);
            }
            i += 2;
        }
        out
    }

    fn read_number_token(&mut self) -> Result<Number> {
        let start = self.cur.pos;
        if let Some(b) = self.cur.peek() {
            if b == b'+' || b == b'-' {
                self.cur.bump();
            }
        }
        let mut saw_digit = false;
        let mut saw_dot = false;
        while let Some(b) = self.cur.peek() {
            if b.is_ascii_digit() {
                saw_digit = true;
                self.cur.bump();
            } else if b == b'.' && !saw_dot {
                saw_dot = true;
                self.cur.bump();
            } else {
                break;
            }
        }
        if !saw_digit && !saw_dot {
            self.cur.restore(start);
            return Err(anyhow!("not a number at {}", start));
        }
        let text = std::str::from_utf8(&self.cur.bytes[start..self.cur.pos])?;
        if saw_dot {
            Ok(Number::Real(text.parse::<f64>()?))
        } else {
            Ok(Number::Int(text.parse::<i64>()?))
        }
    }

    fn at_stream_keyword(&mut self) -> bool {
        let mark = self.cur.mark();
        self.cur.skip_ws();
        let hit = self.cur.bytes[self.cur.pos..].starts_with(b"stream");
        self.cur.restore(mark);
        hit
    }

    fn parse_stream(&mut self, dict: RawDict) -> Result<RawAtom> {
        self.cur.skip_ws();
        self.cur.eat(b"stream");
        if self.cur.peek() == Some(b'\r') {
            self.cur.bump();
        }
        if self.cur.peek() == Some(b'\n') {
            self.cur.bump();
        }
        let data_start = self.cur.pos;
        let data_end = match dict.get_int(b"/Length") {
            Some(len) if len >= 0 => {
                let end = data_start.saturating_add(len as usize);
                if end > self.cur.bytes.len() {
                    warn!(
                        security = true,
                        domain = "pdf.parser",
                        kind = "truncated_stream_data",
                        declared = len,
                        "Stream /Length runs past end of file"
                    );
                }
                end.min(self.cur.bytes.len())
            }
            _ => memchr::memmem::find(&self.cur.bytes[data_start..], b"endstream")
                .map(|off| data_start + off)
                .unwrap_or(self.cur.bytes.len()),
        };
        self.cur.pos = data_end;
        // A bogus /Length can leave us short of the real terminator.
        if !self.cur.eat(b"endstream") {
            self.cur.skip_ws();
            if !self.cur.eat(b"endstream") {
                if let Some(off) = memchr::memmem::find(&self.cur.bytes[self.cur.pos..], b"endstream")
                {
                    self.cur.pos += off + b"endstream".len();
                }
            }
        }
        Ok(RawAtom::Stream {
            dict,
            data: Span { start: data_start as u64, end: data_end as u64 },
        })
    }
}

#[derive(Debug)]
enum Number {
    Int(i64),
    Real(f64),
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(10 + b - b'a'),
        b'A'..=b'F' => Some(10 + b - b'A'),
        _ => None,
    }
}

fn decode_name(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len() + 1);
    out.push(b'/');
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'#' && i + 2 < raw.len() {
            if let (Some(h), Some(l)) = (hex_val(raw[i + 1]), hex_val(raw[i + 2])) {
                out.push((h << 4) | l);
                i += 3;
                continue;
            }
        }
        out.push(raw[i]);
        i += 1;
    }
    out
}

/// Parses the `N G obj ... endobj` wrapper at `offset`.
pub fn parse_indirect_at(bytes: &[u8], offset: usize) -> Result<IndirectObject> {
    let mut p = ObjParser::new(bytes, offset);
    p.cur.skip_ws();
    let header_start = p.cur.pos;
    let id = p.cur.read_uint().ok_or_else(|| anyhow!("missing object number"))?;
    p.cur.skip_ws();
    let gen = p.cur.read_uint().ok_or_else(|| anyhow!("missing generation number"))?;
    p.cur.skip_ws();
    if !p.cur.eat(b"obj") {
        return Err(anyhow!("missing obj keyword at {}", p.cur.pos));
    }
    let atom = p.parse_atom()?;
    p.cur.skip_ws();
    if !p.cur.eat(b"endobj") {
        if let Some(off) = memchr::memmem::find(&bytes[p.cur.pos..], b"endobj") {
            p.cur.pos += off + b"endobj".len();
        }
    }
    let id = u32::try_from(id).map_err(|_| anyhow!("object number out of range"))?;
    let gen = u16::try_from(gen).map_err(|_| anyhow!("generation out of range"))?;
    trace!(domain = "pdf.parser", id, gen, "Parsed indirect object");
    Ok(IndirectObject {
        id,
        gen,
        atom,
        full_span: Span { start: header_start as u64, end: p.cur.pos as u64 },
    })
}

/// Brute-force recovery scan for `N G obj` headers, used when no usable
/// cross-reference information survives.
pub fn scan_indirect_objects(bytes: &[u8], max_objects: usize) -> Vec<IndirectObject> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i + 7 < bytes.len() {
        if max_objects > 0 && out.len() >= max_objects {
            warn!(
                security = true,
                domain = "pdf.parser",
                kind = "max_objects_reached",
                max_objects,
                "Recovery scan halted at object budget"
            );
            break;
        }
        if !bytes[i].is_ascii_digit() {
            i += 1;
            continue;
        }
        match parse_indirect_at(bytes, i) {
            Ok(entry) => {
                let end = entry.full_span.end as usize;
                out.push(entry);
                i = end.max(i + 1);
            }
            Err(_) => i += 1,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{parse_indirect_at, scan_indirect_objects, ObjParser};
    use crate::object::RawAtom;

    #[test]
    fn parses_scalars_and_refs() {
        let mut p = ObjParser::new(b"<< /Kids [3 0 R] /Count 1 /F 1.5 >>", 0);
        let atom = p.parse_atom().unwrap();
        let RawAtom::Dict(d) = atom else { panic!("expected dict") };
        assert_eq!(d.get_int(b"/Count"), Some(1));
        assert!(matches!(d.get(b"/F"), Some(RawAtom::Real(f)) if *f == 1.5));
        let Some(RawAtom::Array(kids)) = d.get(b"/Kids") else { panic!("expected array") };
        assert!(matches!(kids[0], RawAtom::Ref { id: 3, gen: 0 }));
    }

    #[test]
    fn literal_string_escapes() {
        let mut p = ObjParser::new(br"(a\(b\)c\n\101)", 0);
        let RawAtom::Str(s) = p.parse_atom().unwrap() else { panic!("expected string") };
        assert_eq!(s, b"a(b)c\nA");
    }

    #[test]
    fn hex_string_pads_odd_digit() {
        let mut p = ObjParser::new(b"<48656C6C6F2>", 0);
        let RawAtom::Str(s) = p.parse_atom().unwrap() else { panic!("expected string") };
        assert_eq!(s, b"Hello ");
    }

    #[test]
    fn name_hash_escape() {
        let mut p = ObjParser::new(b"/Open#41ction", 0);
        let RawAtom::Name(n) = p.parse_atom().unwrap() else { panic!("expected name") };
        assert_eq!(n, b"/OpenAction");
    }

    #[test]
    fn indirect_object_roundtrip() {
        let doc = b"1 0 obj << /Type /Catalog >> endobj";
        let obj = parse_indirect_at(doc, 0).unwrap();
        assert_eq!(obj.id, 1);
        let RawAtom::Dict(d) = obj.atom else { panic!("expected dict") };
        assert!(d.has_name(b"/Type", b"/Catalog"));
    }

    #[test]
    fn stream_uses_length_then_recovers_terminator() {
        let doc = b"5 0 obj << /Length 4 >> stream\nDATA\nendstream endobj";
        let obj = parse_indirect_at(doc, 0).unwrap();
        let RawAtom::Stream { data, .. } = obj.atom else { panic!("expected stream") };
        assert_eq!(&doc[data.start as usize..data.end as usize], b"DATA");
    }

    #[test]
    fn recovery_scan_finds_all_objects() {
        let doc = b"garbage 1 0 obj<<>>endobj more 2 0 obj 42 endobj";
        let found = scan_indirect_objects(doc, 0);
        assert_eq!(found.iter().map(|o| o.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
