use crate::lexer::Span;

/// A decoded PDF value as it appears in the byte stream. Stream payloads stay
/// as spans into the original buffer; everything else is owned.
#[derive(Debug, Clone, PartialEq)]
pub enum RawAtom {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    /// Name object, decoded (`#xx` escapes resolved), retaining the leading `/`.
    Name(Vec<u8>),
    /// Literal or hex string, decoded to raw bytes.
    Str(Vec<u8>),
    Array(Vec<RawAtom>),
    Dict(RawDict),
    Stream { dict: RawDict, data: Span },
    Ref { id: u32, gen: u16 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawDict {
    pub entries: Vec<(Vec<u8>, RawAtom)>,
}

impl RawDict {
    pub fn get(&self, name: &[u8]) -> Option<&RawAtom> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn get_int(&self, name: &[u8]) -> Option<i64> {
        match self.get(name)? {
            RawAtom::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn has_name(&self, key: &[u8], value: &[u8]) -> bool {
        matches!(self.get(key), Some(RawAtom::Name(n)) if n.eq_ignore_ascii_case(value))
    }
}

/// An `N G obj` header together with its parsed body.
#[derive(Debug, Clone)]
pub struct IndirectObject {
    pub id: u32,
    pub gen: u16,
    pub atom: RawAtom,
    pub full_span: Span,
}
