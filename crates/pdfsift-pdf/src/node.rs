use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use tracing::{debug, info, warn};

use crate::classify::{extract_script_blocks, looks_like_flash, looks_like_script};
use crate::decode::decode_stream;
use crate::object::{RawAtom, RawDict};
use crate::objstm::{open_objstm, ObjStmContents};
use crate::parser::{parse_indirect_at, scan_indirect_objects};
use crate::xref::{read_xref_chain, XrefEntry};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PdfNumber {
    Int(i64),
    Real(f64),
}

impl std::fmt::Display for PdfNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PdfNumber::Int(i) => write!(f, "{i}"),
            PdfNumber::Real(r) => write!(f, "{r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    Data(Vec<u8>),
    /// Decode filter was unsupported or threw; the object survives with an
    /// inline marker instead of failing the revision.
    DecodeError(String),
}

/// One materialized document object. `Ref` is a shallow pointer and never
/// embeds the target, which keeps traversal cycle-safe.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectNode {
    Null,
    Number(PdfNumber),
    Keyword(String),
    Literal(String),
    String(Vec<u8>),
    Dict(Vec<(String, ObjectNode)>),
    List(Vec<ObjectNode>),
    Stream { props: Vec<(String, ObjectNode)>, payload: StreamPayload },
    Ref(u32),
    Malformed { id: u32, raw: Vec<u8>, reason: String },
}

/// Script payload flagged by the classifier, with the id of the object it
/// was lifted from.
#[derive(Debug, Clone)]
pub struct ScriptCandidate {
    pub source_id: u32,
    pub text: String,
}

#[derive(Debug, Default)]
pub struct ObjectGraph {
    /// Materialization order; ids are unique (visited-set enforced).
    pub objects: Vec<(u32, ObjectNode)>,
    /// One trailer dict per revision, newest first.
    pub trailers: Vec<ObjectNode>,
    /// Raw bytes trailing the logical end-of-file marker.
    pub binary_tail: Vec<u8>,
    /// Logical document size: one past the final `%%EOF`.
    pub bytes_read: u64,
    pub file_size: u64,
    /// Ledger of objects that could not be materialized, keyed by category.
    pub malformed: BTreeMap<String, Vec<u32>>,
    pub scripts: Vec<ScriptCandidate>,
    pub flash: Vec<Vec<u8>>,
    pub errors: Vec<String>,
}

impl ObjectGraph {
    pub fn get(&self, id: u32) -> Option<&ObjectNode> {
        self.objects.iter().find(|(oid, _)| *oid == id).map(|(_, n)| n)
    }

    pub fn ids(&self) -> Vec<u32> {
        self.objects.iter().map(|(id, _)| *id).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_decode_bytes: usize,
    pub max_objects: usize,
    pub malformed_window: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self { max_decode_bytes: 32 * 1024 * 1024, max_objects: 500_000, malformed_window: 4096 }
    }
}

struct Materializer<'a> {
    bytes: &'a [u8],
    limits: ParseLimits,
    graph: ObjectGraph,
    current_id: u32,
    objstm_cache: HashMap<u32, Option<Rc<ObjStmContents>>>,
    offsets: HashMap<u32, u64>,
}

/// Rebuilds the document's object graph: walks each revision's
/// cross-reference table, materializes every not-yet-visited id, and runs the
/// content classifier as values convert. Never fails as a whole; damage
/// degrades to `Malformed` nodes, ledger entries, and error strings.
pub fn parse_document(bytes: &[u8], limits: ParseLimits) -> ObjectGraph {
    let span = tracing::info_span!("parse_document", bytes_len = bytes.len());
    let _guard = span.enter();

    let chain = read_xref_chain(bytes, limits.max_decode_bytes);
    let mut m = Materializer {
        bytes,
        limits,
        graph: ObjectGraph { file_size: bytes.len() as u64, ..ObjectGraph::default() },
        current_id: 0,
        objstm_cache: HashMap::new(),
        offsets: HashMap::new(),
    };
    m.graph.errors.extend(chain.errors.iter().cloned());
    for rev in &chain.revisions {
        for entry in &rev.entries {
            if let XrefEntry::InFile { id, offset } = entry {
                m.offsets.entry(*id).or_insert(*offset);
            }
        }
    }

    let mut visited: HashSet<u32> = HashSet::new();
    let has_entries = chain.revisions.iter().any(|r| !r.entries.is_empty());
    if has_entries {
        for rev in &chain.revisions {
            for entry in &rev.entries {
                let id = entry.id();
                if id == 0 || !visited.insert(id) {
                    continue;
                }
                if m.graph.objects.len() >= m.limits.max_objects {
                    warn!(
                        security = true,
                        domain = "pdf.graph",
                        kind = "max_objects_reached",
                        max_objects = m.limits.max_objects,
                        "Materialization halted at object budget"
                    );
                    break;
                }
                m.materialize_entry(*entry);
            }
        }
    } else {
        debug!("No cross-reference entries; falling back to recovery scan");
        for obj in scan_indirect_objects(bytes, limits.max_objects) {
            if !visited.insert(obj.id) {
                continue;
            }
            m.current_id = obj.id;
            let node = m.node_from_atom(obj.atom);
            m.graph.objects.push((obj.id, node));
        }
    }

    for rev in &chain.revisions {
        if let Some(trailer) = &rev.trailer {
            m.current_id = 0;
            let node = m.dict_node(trailer.clone());
            m.graph.trailers.push(ObjectNode::Dict(node));
        }
    }

    m.settle_dangling_refs(&mut visited);
    m.read_binary_tail();

    info!(
        objects = m.graph.objects.len(),
        trailers = m.graph.trailers.len(),
        scripts = m.graph.scripts.len(),
        flash = m.graph.flash.len(),
        errors = m.graph.errors.len(),
        "Materialized object graph"
    );
    m.graph
}

impl<'a> Materializer<'a> {
    fn materialize_entry(&mut self, entry: XrefEntry) {
        let id = entry.id();
        self.current_id = id;
        let result = match entry {
            XrefEntry::InFile { offset, .. } => {
                match parse_indirect_at(self.bytes, offset as usize) {
                    Ok(obj) if obj.id == id => Ok(obj.atom),
                    Ok(obj) => Err((offset, format!("object header says {} not {}", obj.id, id))),
                    Err(e) => Err((offset, e.to_string())),
                }
            }
            XrefEntry::InStream { container, .. } => match self.objstm_member(container, id) {
                Ok(atom) => Ok(atom),
                Err(reason) => {
                    let offset = self.offsets.get(&container).copied().unwrap_or(0);
                    Err((offset, reason))
                }
            },
        };
        match result {
            Ok(atom) => {
                let node = self.node_from_atom(atom);
                self.graph.objects.push((id, node));
            }
            Err((offset, reason)) => self.record_malformed(id, offset, reason),
        }
    }

    fn objstm_member(&mut self, container: u32, id: u32) -> Result<RawAtom, String> {
        if !self.objstm_cache.contains_key(&container) {
            let opened = self.open_container(container);
            self.objstm_cache.insert(container, opened);
        }
        match self.objstm_cache.get(&container) {
            Some(Some(contents)) => contents.clone().member(id).map_err(|e| e.to_string()),
            _ => Err(format!("object stream {container} unavailable")),
        }
    }

    fn open_container(&mut self, container: u32) -> Option<Rc<ObjStmContents>> {
        let offset = *self.offsets.get(&container)?;
        let obj = parse_indirect_at(self.bytes, offset as usize).ok()?;
        let RawAtom::Stream { dict, data } = obj.atom else {
            return None;
        };
        match open_objstm(self.bytes, &dict, data, self.limits.max_decode_bytes) {
            Ok(contents) => Some(Rc::new(contents)),
            Err(e) => {
                self.graph.errors.push(format!("object stream {container}: {e}"));
                None
            }
        }
    }

    /// A missing or undecodable object becomes a `Malformed` node carrying a
    /// bounded raw window from its recorded offset, markup-sensitive bytes
    /// neutralized.
    fn record_malformed(&mut self, id: u32, offset: u64, reason: String) {
        warn!(
            security = true,
            domain = "pdf.graph",
            kind = "malformed_object",
            id,
            offset,
            reason = reason.as_str(),
            "Object could not be materialized"
        );
        let raw = self.raw_window(offset as usize);
        self.graph.malformed.entry("objects".to_string()).or_default().push(id);
        self.graph.errors.push(format!("object {id}: {reason}"));
        self.graph.objects.push((id, ObjectNode::Malformed { id, raw, reason }));
    }

    fn raw_window(&self, offset: usize) -> Vec<u8> {
        if offset >= self.bytes.len() {
            return Vec::new();
        }
        let end = (offset + self.limits.malformed_window).min(self.bytes.len());
        let mut out = Vec::with_capacity(end - offset);
        for &b in &self.bytes[offset..end] {
            if b == b'<' {
                out.extend_from_slice(b"0x3C");
            } else {
                out.push(b);
            }
        }
        out
    }

    fn node_from_atom(&mut self, atom: RawAtom) -> ObjectNode {
        match atom {
            RawAtom::Null => ObjectNode::Null,
            RawAtom::Bool(b) => {
                let kw = if b { "true" } else { "false" };
                self.classify_text(kw);
                ObjectNode::Keyword(kw.to_string())
            }
            RawAtom::Int(i) => {
                let n = PdfNumber::Int(i);
                self.classify_text(&n.to_string());
                ObjectNode::Number(n)
            }
            RawAtom::Real(r) => {
                let n = PdfNumber::Real(r);
                self.classify_text(&n.to_string());
                ObjectNode::Number(n)
            }
            RawAtom::Name(name) => {
                let text = literal_name(&name);
                self.classify_text(&text);
                ObjectNode::Literal(text)
            }
            RawAtom::Str(bytes) => {
                self.classify_text(&String::from_utf8_lossy(&bytes));
                ObjectNode::String(bytes)
            }
            RawAtom::Array(items) => {
                ObjectNode::List(items.into_iter().map(|a| self.node_from_atom(a)).collect())
            }
            RawAtom::Dict(dict) => ObjectNode::Dict(self.dict_node(dict)),
            RawAtom::Stream { dict, data } => {
                let payload = match decode_stream(self.bytes, &dict, data, self.limits.max_decode_bytes)
                {
                    Ok(decoded) => {
                        self.classify_stream(&decoded.data);
                        StreamPayload::Data(decoded.data)
                    }
                    Err(e) => StreamPayload::DecodeError(e.to_string()),
                };
                ObjectNode::Stream { props: self.dict_node(dict), payload }
            }
            RawAtom::Ref { id, .. } => ObjectNode::Ref(id),
        }
    }

    fn dict_node(&mut self, dict: RawDict) -> Vec<(String, ObjectNode)> {
        dict.entries
            .into_iter()
            .map(|(k, v)| {
                let key = literal_name(&k);
                let script_key =
                    key.eq_ignore_ascii_case("JS") || key.eq_ignore_ascii_case("JavaScript");
                let node = self.node_from_atom(v);
                if script_key {
                    self.lift_script_value(&node);
                }
                (key, node)
            })
            .collect()
    }

    /// Values under `/JS`-style action keys are script by declaration, even
    /// when too short for the token heuristic to fire.
    fn lift_script_value(&mut self, node: &ObjectNode) {
        let text = match node {
            ObjectNode::String(bytes) => String::from_utf8_lossy(bytes).to_string(),
            ObjectNode::Stream { payload: StreamPayload::Data(data), .. } => {
                String::from_utf8_lossy(data).to_string()
            }
            _ => return,
        };
        if text.is_empty() || looks_like_script(&text) {
            // The classifier already captured it during conversion.
            return;
        }
        self.graph.scripts.push(ScriptCandidate { source_id: self.current_id, text });
    }

    fn classify_text(&mut self, text: &str) {
        if !looks_like_script(text) {
            return;
        }
        let body = extract_script_blocks(text).unwrap_or_else(|| text.to_string());
        self.graph.scripts.push(ScriptCandidate { source_id: self.current_id, text: body });
    }

    fn classify_stream(&mut self, data: &[u8]) {
        self.classify_text(&String::from_utf8_lossy(data));
        if looks_like_flash(data) {
            self.graph.flash.push(data.to_vec());
        }
    }

    /// References to ids no revision materialized get a ledger entry and an
    /// empty `Malformed` node so downstream traversal stays closed.
    fn settle_dangling_refs(&mut self, visited: &mut HashSet<u32>) {
        let mut targets = Vec::new();
        for (_, node) in &self.graph.objects {
            collect_ref_targets(node, &mut targets);
        }
        for trailer in &self.graph.trailers {
            collect_ref_targets(trailer, &mut targets);
        }
        for target in targets {
            if target == 0 || !visited.insert(target) {
                continue;
            }
            let reason = "referenced object not present in any revision".to_string();
            self.graph.malformed.entry("objects".to_string()).or_default().push(target);
            self.graph.errors.push(format!("object {target}: {reason}"));
            self.graph.objects.push((
                target,
                ObjectNode::Malformed { id: target, raw: Vec::new(), reason },
            ));
        }
    }

    fn read_binary_tail(&mut self) {
        let Some(pos) = memchr::memmem::rfind(self.bytes, b"%%EOF") else {
            self.graph.bytes_read = self.bytes.len() as u64;
            return;
        };
        let mut after = pos + b"%%EOF".len();
        self.graph.bytes_read = after as u64;
        if self.bytes.get(after) == Some(&b'\r') {
            after += 1;
        }
        if self.bytes.get(after) == Some(&b'\n') {
            after += 1;
        }
        let tail = &self.bytes[after..];
        if tail.len() > 3 {
            debug!(tail_len = tail.len(), "Retaining binary tail after end-of-file marker");
            self.graph.binary_tail = tail.to_vec();
        }
    }
}

fn collect_ref_targets(node: &ObjectNode, out: &mut Vec<u32>) {
    match node {
        ObjectNode::Ref(target) => out.push(*target),
        ObjectNode::Dict(entries) | ObjectNode::Stream { props: entries, .. } => {
            for (_, v) in entries {
                collect_ref_targets(v, out);
            }
        }
        ObjectNode::List(items) => {
            for item in items {
                collect_ref_targets(item, out);
            }
        }
        _ => {}
    }
}

/// Decoded name without its leading slash, lossily stringified.
fn literal_name(name: &[u8]) -> String {
    let trimmed = name.strip_prefix(b"/").unwrap_or(name);
    String::from_utf8_lossy(trimmed).to_string()
}

#[cfg(test)]
mod tests {
    use super::{parse_document, ObjectNode, ParseLimits};

    #[test]
    fn duplicate_xref_ids_materialize_once() {
        // Two revisions both listing object 1; visited set keeps the newest.
        let body = b"1 0 obj << /Type /Catalog >> endobj\n";
        let mut doc = Vec::new();
        doc.extend_from_slice(b"%PDF-1.4\n");
        let first = doc.len();
        doc.extend_from_slice(body);
        let xref1 = doc.len();
        doc.extend_from_slice(
            format!(
                "xref\n0 2\n0000000000 65535 f \n{:010} 00000 n \ntrailer\n<< /Size 2 >>\n",
                first
            )
            .as_bytes(),
        );
        let xref2 = doc.len();
        doc.extend_from_slice(
            format!(
                "xref\n0 2\n0000000000 65535 f \n{:010} 00000 n \ntrailer\n<< /Size 2 /Prev {} >>\nstartxref\n{}\n%%EOF",
                first, xref1, xref2
            )
            .as_bytes(),
        );
        let graph = parse_document(&doc, ParseLimits::default());
        assert_eq!(graph.objects.iter().filter(|(id, _)| *id == 1).count(), 1);
        assert_eq!(graph.trailers.len(), 2);
    }

    #[test]
    fn missing_object_degrades_to_malformed_node() {
        let doc = b"%PDF-1.4\nxref\n0 2\n0000000000 65535 f \n0000009999 00000 n \ntrailer\n<< /Size 2 >>\nstartxref\n9\n%%EOF";
        let graph = parse_document(doc, ParseLimits::default());
        assert_eq!(graph.malformed.get("objects"), Some(&vec![1]));
        assert!(matches!(graph.get(1), Some(ObjectNode::Malformed { .. })));
        assert!(!graph.errors.is_empty());
    }

    #[test]
    fn binary_tail_kept_when_past_minimum_distance() {
        let doc = b"%PDF-1.4\n1 0 obj null endobj\nstartxref\n9\n%%EOF\nBLOBBYTES";
        let graph = parse_document(doc, ParseLimits::default());
        assert_eq!(graph.binary_tail, b"BLOBBYTES");
        assert!(graph.bytes_read < graph.file_size);
    }

    #[test]
    fn recovery_scan_when_no_xref() {
        let doc = b"%PDF-1.4\n1 0 obj << /Kids [2 0 R] >> endobj\n2 0 obj (hi) endobj\n";
        let graph = parse_document(doc, ParseLimits::default());
        assert_eq!(graph.ids(), vec![1, 2]);
    }
}
