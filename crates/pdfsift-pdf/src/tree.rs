use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::node::{ObjectGraph, ObjectNode, StreamPayload};

/// Serializes the object graph into the textual tree grammar. Dict and list
/// size attributes are written with a `%` placeholder that readers must strip
/// before parsing the count; see `parse_size_attr`.
pub fn serialize_tree(graph: &ObjectGraph) -> String {
    let mut out = String::from("<pdf>");
    for (id, node) in &graph.objects {
        match node {
            ObjectNode::Malformed { raw, .. } => {
                out.push_str(&format!(
                    "<object id=\"{}\" type=\"malformed\">\n{}\n</object>\n\n",
                    id,
                    String::from_utf8_lossy(raw)
                ));
            }
            _ => {
                out.push_str(&format!("<object id=\"{id}\">\n"));
                write_node(&mut out, node);
                out.push_str("\n</object>\n\n");
            }
        }
    }
    for trailer in &graph.trailers {
        out.push_str("<trailer>\n");
        write_node(&mut out, trailer);
        out.push_str("\n</trailer>\n\n");
    }
    out.push_str("</pdf>");
    out
}

fn write_node(out: &mut String, node: &ObjectNode) {
    match node {
        ObjectNode::Null => out.push_str("<null />"),
        ObjectNode::Number(n) => out.push_str(&format!("<number>{}</number>", escape_text(n.to_string().as_bytes()))),
        ObjectNode::Keyword(k) => {
            out.push_str(&format!("<keyword>{}</keyword>", escape_text(k.as_bytes())))
        }
        ObjectNode::Literal(l) => {
            out.push_str(&format!("<literal>{}</literal>", escape_text(l.as_bytes())))
        }
        ObjectNode::String(bytes) => {
            out.push_str(&format!("<string>{}</string>", BASE64.encode(escape_text(bytes))))
        }
        ObjectNode::Dict(entries) => write_dict(out, entries),
        ObjectNode::List(items) => {
            out.push_str(&format!("<list size=\"%{}\">\n", items.len()));
            for item in items {
                write_node(out, item);
                out.push('\n');
            }
            out.push_str("</list>");
        }
        ObjectNode::Stream { props, payload } => {
            out.push_str("<stream>\n<props>\n");
            write_dict(out, props);
            out.push_str("\n</props>\n");
            match payload {
                StreamPayload::Data(data) => out.push_str(&format!(
                    "<data size=\"{}\">{}</data>\n",
                    data.len(),
                    BASE64.encode(escape_text(data))
                )),
                StreamPayload::DecodeError(reason) => out.push_str(&format!(
                    "<StreamException>{}</StreamException>\n",
                    escape_text(reason.as_bytes())
                )),
            }
            out.push_str("</stream>");
        }
        ObjectNode::Ref(target) => out.push_str(&format!("<ref id=\"{target}\" />")),
        ObjectNode::Malformed { id, raw, .. } => {
            // Only reachable when nested, which materialization never produces.
            out.push_str(&format!(
                "<object id=\"{}\" type=\"malformed\">{}</object>",
                id,
                String::from_utf8_lossy(raw)
            ));
        }
    }
}

fn write_dict(out: &mut String, entries: &[(String, ObjectNode)]) {
    out.push_str(&format!("<dict size=\"%{}\">\n", entries.len()));
    for (key, value) in entries {
        let tag = sanitize_key(key);
        out.push_str(&format!("<{tag}>"));
        write_node(out, value);
        out.push_str(&format!("</{tag}>\n"));
    }
    out.push_str("</dict>");
}

/// Dict keys become element names, so anything outside `[A-Za-z0-9_]` is
/// dropped and digit-leading or emptied keys get a stable prefix.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_').collect();
    if cleaned.is_empty() || cleaned.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        format!("field_{cleaned}")
    } else {
        cleaned
    }
}

/// Numeric-entity escape for control and markup-significant bytes, applied to
/// raw content before it is embedded (and before base64 for payload fields).
pub fn escape_text(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &b in bytes {
        let must_escape = b < 0x20
            || b >= 0x7f
            || matches!(b, b'&' | b'<' | b'>' | b'(' | b')' | b'"' | b'\'' | b'\\');
        if must_escape {
            out.push_str(&format!("&#{b};"));
        } else {
            out.push(b as char);
        }
    }
    out
}

/// Strips the `%` size placeholder before parsing the count. The writer adds
/// the marker; readers must tolerate both marked and bare attributes.
pub fn parse_size_attr(value: &str) -> Option<usize> {
    value.trim().trim_start_matches('%').parse().ok()
}

/// Recovers the set of object ids from a serialized tree.
pub fn object_ids(tree: &str) -> Vec<u32> {
    let mut out = Vec::new();
    let mut rest = tree;
    while let Some(pos) = rest.find("<object id=\"") {
        rest = &rest[pos + "<object id=\"".len()..];
        let end = match rest.find('"') {
            Some(e) => e,
            None => break,
        };
        if let Ok(id) = rest[..end].parse::<u32>() {
            out.push(id);
        }
        rest = &rest[end..];
    }
    out
}

/// Pre-order walk emitting one `(parent, child)` pair per `Ref` followed.
/// Containment is not recorded; only reference structure is.
pub fn edges(graph: &ObjectGraph) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    for (id, node) in &graph.objects {
        walk_refs(*id, node, &mut out);
    }
    out
}

fn walk_refs(parent: u32, node: &ObjectNode, out: &mut Vec<(u32, u32)>) {
    match node {
        ObjectNode::Ref(target) => out.push((parent, *target)),
        ObjectNode::Dict(entries) | ObjectNode::Stream { props: entries, .. } => {
            for (_, value) in entries {
                walk_refs(parent, value, out);
            }
        }
        ObjectNode::List(items) => {
            for item in items {
                walk_refs(parent, item, out);
            }
        }
        _ => {}
    }
}

/// `"<parent> <child>"` lines, one per reference edge.
pub fn render_edges(edges: &[(u32, u32)]) -> String {
    edges.iter().map(|(p, c)| format!("{p} {c}\n")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{ObjectGraph, ObjectNode, PdfNumber, StreamPayload};

    fn sample_graph() -> ObjectGraph {
        ObjectGraph {
            objects: vec![
                (
                    1,
                    ObjectNode::Dict(vec![
                        ("Type".into(), ObjectNode::Literal("Catalog".into())),
                        ("Pages".into(), ObjectNode::Ref(2)),
                    ]),
                ),
                (
                    2,
                    ObjectNode::List(vec![
                        ObjectNode::Ref(1),
                        ObjectNode::Number(PdfNumber::Int(7)),
                    ]),
                ),
            ],
            ..ObjectGraph::default()
        }
    }

    #[test]
    fn size_attributes_carry_placeholder() {
        let tree = serialize_tree(&sample_graph());
        assert!(tree.contains("<dict size=\"%2\">"));
        assert!(tree.contains("<list size=\"%2\">"));
        assert_eq!(parse_size_attr("%2"), Some(2));
        assert_eq!(parse_size_attr("2"), Some(2));
    }

    #[test]
    fn roundtrip_recovers_object_ids() {
        let graph = sample_graph();
        let tree = serialize_tree(&graph);
        assert_eq!(object_ids(&tree), graph.ids());
    }

    #[test]
    fn cyclic_refs_serialize_without_recursion() {
        // 1 -> 2 -> 1 is a reference cycle; shallow refs keep it finite.
        let tree = serialize_tree(&sample_graph());
        assert!(tree.contains("<ref id=\"2\" />"));
        assert!(tree.contains("<ref id=\"1\" />"));
    }

    #[test]
    fn edges_follow_refs_only() {
        let graph = sample_graph();
        assert_eq!(edges(&graph), vec![(1, 2), (2, 1)]);
        assert_eq!(render_edges(&[(1, 2)]), "1 2\n");
    }

    #[test]
    fn escape_covers_markup_and_control_bytes() {
        assert_eq!(escape_text(b"a<b"), "a&#60;b");
        assert_eq!(escape_text(b"\x00"), "&#0;");
        assert_eq!(escape_text(b"plain"), "plain");
    }

    #[test]
    fn stream_decode_error_is_inline() {
        let graph = ObjectGraph {
            objects: vec![(
                3,
                ObjectNode::Stream {
                    props: vec![],
                    payload: StreamPayload::DecodeError("unsupported filter /JBIG2Decode".into()),
                },
            )],
            ..ObjectGraph::default()
        };
        let tree = serialize_tree(&graph);
        assert!(tree.contains("<StreamException>"));
    }

    #[test]
    fn dict_keys_are_sanitized() {
        let graph = ObjectGraph {
            objects: vec![(
                1,
                ObjectNode::Dict(vec![
                    ("3D".into(), ObjectNode::Null),
                    ("A B".into(), ObjectNode::Null),
                ]),
            )],
            ..ObjectGraph::default()
        };
        let tree = serialize_tree(&graph);
        assert!(tree.contains("<field_3D>"));
        assert!(tree.contains("<AB>"));
    }
}
