use anyhow::{anyhow, Result};
use tracing::warn;

use crate::decode::decode_stream;
use crate::object::{RawAtom, RawDict};
use crate::parser::ObjParser;

/// A decoded `/Type /ObjStm` container: its payload plus the
/// `id offset` header pairs locating each member object.
#[derive(Debug)]
pub struct ObjStmContents {
    pub data: Vec<u8>,
    pub members: Vec<(u32, usize)>,
    pub first: usize,
}

pub fn open_objstm(
    bytes: &[u8],
    dict: &RawDict,
    data: crate::lexer::Span,
    max_decode_bytes: usize,
) -> Result<ObjStmContents> {
    if !dict.has_name(b"/Type", b"/ObjStm") {
        return Err(anyhow!("container is not /Type /ObjStm"));
    }
    let n = match dict.get_int(b"/N") {
        Some(v) if v >= 0 => v as usize,
        _ => return Err(anyhow!("object stream missing /N")),
    };
    let first = match dict.get_int(b"/First") {
        Some(v) if v >= 0 => v as usize,
        _ => return Err(anyhow!("object stream missing /First")),
    };
    let decoded = decode_stream(bytes, dict, data, max_decode_bytes)?;
    if decoded.data.len() < first {
        return Err(anyhow!("object stream shorter than /First"));
    }
    let members = header_pairs(&decoded.data[..first], n);
    if members.len() < n {
        warn!(
            security = true,
            domain = "pdf.object_stream",
            kind = "objstm_header_short",
            declared = n,
            found = members.len(),
            "Object stream header shorter than /N"
        );
    }
    Ok(ObjStmContents { data: decoded.data, members, first })
}

impl ObjStmContents {
    /// Parses the member with the given object id out of the decoded payload.
    pub fn member(&self, id: u32) -> Result<RawAtom> {
        let (_, rel) = self
            .members
            .iter()
            .find(|(member_id, _)| *member_id == id)
            .ok_or_else(|| anyhow!("object {id} not in stream header"))?;
        let at = self.first.saturating_add(*rel);
        if at >= self.data.len() {
            return Err(anyhow!("object {id} offset past stream end"));
        }
        let mut p = ObjParser::new(&self.data, at);
        p.parse_atom()
    }
}

fn header_pairs(header: &[u8], n: usize) -> Vec<(u32, usize)> {
    let mut cur = crate::lexer::Cursor::new(header, 0);
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        cur.skip_ws();
        let Some(id) = cur.read_uint() else { break };
        cur.skip_ws();
        let Some(offset) = cur.read_uint() else { break };
        out.push((id as u32, offset as usize));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::open_objstm;
    use crate::lexer::Span;
    use crate::object::{RawAtom, RawDict};

    fn objstm_dict(n: i64, first: i64) -> RawDict {
        RawDict {
            entries: vec![
                (b"/Type".to_vec(), RawAtom::Name(b"/ObjStm".to_vec())),
                (b"/N".to_vec(), RawAtom::Int(n)),
                (b"/First".to_vec(), RawAtom::Int(first)),
            ],
        }
    }

    #[test]
    fn members_parse_at_recorded_offsets() {
        let payload = b"11 0 12 8 <</A 1>> (hidden)";
        let dict = objstm_dict(2, 10);
        let span = Span { start: 0, end: payload.len() as u64 };
        let contents = open_objstm(payload, &dict, span, 1 << 16).unwrap();
        assert!(matches!(contents.member(11).unwrap(), RawAtom::Dict(_)));
        let RawAtom::Str(s) = contents.member(12).unwrap() else { panic!("expected string") };
        assert_eq!(s, b"hidden");
        assert!(contents.member(99).is_err());
    }
}
