use pdfsift_pdf::node::{parse_document, ObjectNode, ParseLimits};
use pdfsift_pdf::tree::{edges, object_ids, serialize_tree};

/// Assembles a well-formed single-revision document with a correct xref
/// table, one subsection per object id.
fn build_pdf(objects: &[(u32, &[u8])]) -> Vec<u8> {
    let mut doc = b"%PDF-1.4\n".to_vec();
    let mut offsets = Vec::new();
    for (id, body) in objects {
        offsets.push((*id, doc.len()));
        doc.extend_from_slice(format!("{id} 0 obj ").as_bytes());
        doc.extend_from_slice(body);
        doc.extend_from_slice(b" endobj\n");
    }
    let xref_at = doc.len();
    doc.extend_from_slice(b"xref\n0 1\n0000000000 65535 f \n");
    for (id, off) in &offsets {
        doc.extend_from_slice(format!("{id} 1\n{off:010} 00000 n \n").as_bytes());
    }
    doc.extend_from_slice(
        format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF",
            objects.len() + 1,
            xref_at
        )
        .as_bytes(),
    );
    doc
}

fn catalog_page_openaction() -> Vec<u8> {
    build_pdf(&[
        (1, b"<< /Type /Catalog /Pages 2 0 R /OpenAction 3 0 R >>"),
        (2, b"<< /Type /Pages /Kids [3 0 R] /Count 1 >>"),
        (3, b"<< /Type /Action /S /JavaScript /JS (app.alert\\(1\\)) >>"),
    ])
}

#[test]
fn three_object_document_materializes_cleanly() {
    let doc = catalog_page_openaction();
    let graph = parse_document(&doc, ParseLimits::default());
    assert_eq!(graph.ids(), vec![1, 2, 3]);
    assert!(graph.malformed.is_empty());
    assert!(graph.flash.is_empty());
    assert_eq!(graph.scripts.len(), 1);
    assert_eq!(graph.scripts[0].text, "app.alert(1)");
    assert_eq!(graph.scripts[0].source_id, 3);
}

#[test]
fn serialization_roundtrip_preserves_id_set() {
    let doc = catalog_page_openaction();
    let graph = parse_document(&doc, ParseLimits::default());
    let tree = serialize_tree(&graph);
    assert_eq!(object_ids(&tree), graph.ids());
}

#[test]
fn reference_edges_match_document_structure() {
    let doc = catalog_page_openaction();
    let graph = parse_document(&doc, ParseLimits::default());
    let got = edges(&graph);
    assert_eq!(got, vec![(1, 2), (1, 3), (2, 3)]);
}

#[test]
fn dangling_reference_gets_one_ledger_entry() {
    let doc = build_pdf(&[(1, b"<< /Type /Catalog /Pages 9 0 R >>")]);
    let graph = parse_document(&doc, ParseLimits::default());
    assert_eq!(graph.malformed.get("objects"), Some(&vec![9]));
    assert!(matches!(graph.get(9), Some(ObjectNode::Malformed { .. })));
    assert!(!graph.errors.is_empty());
    // The valid object still materialized.
    assert!(matches!(graph.get(1), Some(ObjectNode::Dict(_))));
}

#[test]
fn reference_cycle_terminates() {
    let doc = build_pdf(&[
        (1, b"<< /Next 2 0 R >>"),
        (2, b"<< /Next 1 0 R >>"),
    ]);
    let graph = parse_document(&doc, ParseLimits::default());
    let tree = serialize_tree(&graph);
    assert_eq!(object_ids(&tree), vec![1, 2]);
    assert_eq!(edges(&graph), vec![(1, 2), (2, 1)]);
}

#[test]
fn flate_stream_with_script_is_classified() {
    use std::io::Write;
    let script =
        b"var payload = unescape('%41'); function go() { if (payload) { eval(payload); } } go();";
    let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(script).unwrap();
    let packed = enc.finish().unwrap();
    let mut body = format!("<< /Length {} /Filter /FlateDecode >> stream\n", packed.len())
        .into_bytes();
    body.extend_from_slice(&packed);
    body.extend_from_slice(b"\nendstream");
    let doc = build_pdf(&[(1, &body)]);
    let graph = parse_document(&doc, ParseLimits::default());
    assert_eq!(graph.scripts.len(), 1);
    assert_eq!(graph.scripts[0].text.as_bytes(), script);
}

#[test]
fn unsupported_filter_degrades_inline() {
    let doc = build_pdf(&[(1, b"<< /Length 3 /Filter /JBIG2Decode >> stream\nabc\nendstream")]);
    let graph = parse_document(&doc, ParseLimits::default());
    let tree = serialize_tree(&graph);
    assert!(tree.contains("<StreamException>"));
    assert!(graph.malformed.is_empty());
}

#[test]
fn flash_stream_is_collected() {
    let doc = build_pdf(&[(1, b"<< /Length 11 >> stream\nFWS\x09abcdefg\nendstream")]);
    let graph = parse_document(&doc, ParseLimits::default());
    assert_eq!(graph.flash.len(), 1);
    assert!(graph.flash[0].starts_with(b"FWS"));
    assert!(pdfsift_pdf::swf::parse_swf_header(&graph.flash[0]).is_some());
}
