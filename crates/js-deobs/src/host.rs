use serde_json::{json, Map, Value};

use pdfsift_pdf::node::{ObjectGraph, ObjectNode, PdfNumber, StreamPayload};

/// Viewer attributes mirrored onto `app.doc` when the document carries them.
const APP_ATTRS: &[&str] = &[
    "calculate",
    "formsVersion",
    "fullscreen",
    "language",
    "numPlugins",
    "openInPlace",
    "platform",
    "toolbar",
    "toolbarHorizontal",
    "toolbarVertical",
];

const INFO_ATTRS: &[&str] = &[
    "author", "creator", "creationDate", "Date", "keywords", "modDate", "producer", "subject",
    "title", "trapped",
];

const EVENT_ATTRS: &[&str] = &[
    "author",
    "calculate",
    "creator",
    "creationDate",
    "delay",
    "dirty",
    "external",
    "filesize",
    "keywords",
    "modDate",
    "numFields",
    "numPages",
    "numTemplates",
    "path",
    "pageNum",
    "producer",
    "subject",
    "title",
    "zoom",
    "zoomType",
];

const MAX_REF_DEPTH: usize = 4;

/// The mimicked host objects a viewer would expose to document script,
/// synthesized from the object graph. Plain data; the sandbox bindings are
/// installed separately by the engine.
#[derive(Debug, Clone)]
pub struct HostEnvironment {
    pub app: Value,
    pub info: Value,
    pub event: Value,
}

pub fn build_host_environment(graph: &ObjectGraph) -> HostEnvironment {
    HostEnvironment {
        app: build_app(graph),
        info: build_info(graph),
        event: build_event(graph),
    }
}

fn build_app(graph: &ObjectGraph) -> Value {
    let mut doc = Map::new();
    for attr in APP_ATTRS {
        if let Some(val) = scan_field(graph, attr) {
            doc.insert((*attr).to_string(), val);
        }
    }
    doc.insert("viewerType".into(), json!("Reader"));
    doc.insert("annots".into(), Value::Array(gather_annots(graph)));

    let mut app = Map::new();
    // Viewer identity defaults keep capability probes deterministic.
    app.insert("viewerType".into(), json!("Reader"));
    app.insert("viewerVersion".into(), json!(5.0));
    app.insert(
        "plugIns".into(),
        json!([
            { "version": 6.0 },
            { "version": 7.5 },
            { "version": 8.7 },
            { "version": 9.1 },
            { "version": 10 }
        ]),
    );
    if !doc.contains_key("language") {
        app.insert("language".into(), json!("ENU"));
    }
    if !doc.contains_key("platform") {
        app.insert("platform".into(), json!("WIN"));
    }
    app.insert("doc".into(), Value::Object(doc));
    Value::Object(app)
}

fn build_info(graph: &ObjectGraph) -> Value {
    let mut info = Map::new();
    for attr in INFO_ATTRS {
        if let Some(val) = scan_field(graph, attr) {
            info.insert((*attr).to_string(), val);
        }
    }
    Value::Object(info)
}

fn build_event(graph: &ObjectGraph) -> Value {
    let mut target = Map::new();
    for attr in EVENT_ATTRS {
        if let Some(val) = scan_field(graph, attr) {
            target.insert((*attr).to_string(), val);
        }
    }
    json!({ "target": Value::Object(target) })
}

/// Case-folded search over every dict in the graph for a conventionally-named
/// field; the last occurrence wins, matching incremental-update shadowing.
fn scan_field(graph: &ObjectGraph, name: &str) -> Option<Value> {
    let mut found = None;
    for (_, node) in &graph.objects {
        scan_node(graph, node, name, &mut found);
    }
    for trailer in &graph.trailers {
        scan_node(graph, trailer, name, &mut found);
    }
    found
}

fn scan_node(graph: &ObjectGraph, node: &ObjectNode, name: &str, found: &mut Option<Value>) {
    match node {
        ObjectNode::Dict(entries) | ObjectNode::Stream { props: entries, .. } => {
            for (key, value) in entries {
                if key.eq_ignore_ascii_case(name) {
                    if let Some(v) = value_of(graph, value, 0) {
                        *found = Some(v);
                    }
                }
                scan_node(graph, value, name, found);
            }
        }
        ObjectNode::List(items) => {
            for item in items {
                scan_node(graph, item, name, found);
            }
        }
        _ => {}
    }
}

/// Converts a node into plain data, chasing `Ref`s a bounded number of hops.
fn value_of(graph: &ObjectGraph, node: &ObjectNode, depth: usize) -> Option<Value> {
    match node {
        ObjectNode::Literal(s) | ObjectNode::Keyword(s) => Some(json!(s)),
        ObjectNode::Number(PdfNumber::Int(i)) => Some(json!(i)),
        ObjectNode::Number(PdfNumber::Real(r)) => serde_json::Number::from_f64(*r).map(Value::Number),
        ObjectNode::String(bytes) => Some(json!(String::from_utf8_lossy(bytes))),
        ObjectNode::Stream { payload: StreamPayload::Data(data), .. } => {
            Some(json!(String::from_utf8_lossy(data)))
        }
        ObjectNode::Ref(id) => {
            if depth >= MAX_REF_DEPTH {
                return None;
            }
            value_of(graph, graph.get(*id)?, depth + 1)
        }
        ObjectNode::Dict(entries) => {
            let mut out = Map::new();
            for (key, value) in entries {
                if let Some(v) = value_of(graph, value, depth) {
                    out.insert(key.clone(), v);
                }
            }
            Some(Value::Object(out))
        }
        ObjectNode::List(items) => {
            Some(Value::Array(items.iter().filter_map(|i| value_of(graph, i, depth)).collect()))
        }
        _ => None,
    }
}

/// Annotation dicts referenced from `/Annots` arrays, with `Subj` renamed to
/// the scripting-visible `subject` field.
fn gather_annots(graph: &ObjectGraph) -> Vec<Value> {
    let mut out = Vec::new();
    for (_, node) in &graph.objects {
        collect_annots(graph, node, &mut out);
    }
    out
}

fn collect_annots(graph: &ObjectGraph, node: &ObjectNode, out: &mut Vec<Value>) {
    match node {
        ObjectNode::Dict(entries) | ObjectNode::Stream { props: entries, .. } => {
            for (key, value) in entries {
                if key.eq_ignore_ascii_case("Annots") {
                    if let Some(Value::Array(items)) = value_of(graph, value, 0) {
                        for item in items {
                            if let Value::Object(mut annot) = item {
                                if let Some(subj) = annot.remove("Subj") {
                                    annot.insert("subject".into(), subj);
                                }
                                out.push(Value::Object(annot));
                            }
                        }
                    }
                } else {
                    collect_annots(graph, value, out);
                }
            }
        }
        ObjectNode::List(items) => {
            for item in items {
                collect_annots(graph, item, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::build_host_environment;
    use pdfsift_pdf::node::{ObjectGraph, ObjectNode};
    use serde_json::json;

    fn dict(entries: Vec<(&str, ObjectNode)>) -> ObjectNode {
        ObjectNode::Dict(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn defaults_present_on_empty_graph() {
        let env = build_host_environment(&ObjectGraph::default());
        assert_eq!(env.app["viewerType"], json!("Reader"));
        assert_eq!(env.app["viewerVersion"], json!(5.0));
        assert_eq!(env.app["language"], json!("ENU"));
        assert_eq!(env.app["platform"], json!("WIN"));
        assert_eq!(env.app["plugIns"].as_array().unwrap().len(), 5);
        assert_eq!(env.app["doc"]["annots"], json!([]));
        assert_eq!(env.info, json!({}));
        assert_eq!(env.event, json!({ "target": {} }));
    }

    #[test]
    fn metadata_fields_are_case_folded_and_ref_chased() {
        let graph = ObjectGraph {
            objects: vec![
                (
                    1,
                    dict(vec![
                        ("Author", ObjectNode::String(b"mallory".to_vec())),
                        ("Title", ObjectNode::Ref(2)),
                    ]),
                ),
                (2, ObjectNode::String(b"invoice".to_vec())),
            ],
            ..ObjectGraph::default()
        };
        let env = build_host_environment(&graph);
        assert_eq!(env.info["author"], json!("mallory"));
        assert_eq!(env.info["title"], json!("invoice"));
        assert_eq!(env.event["target"]["author"], json!("mallory"));
    }

    #[test]
    fn annots_rename_subj() {
        let graph = ObjectGraph {
            objects: vec![
                (1, dict(vec![("Annots", ObjectNode::List(vec![ObjectNode::Ref(2)]))])),
                (2, dict(vec![("Subj", ObjectNode::String(b"payload-part".to_vec()))])),
            ],
            ..ObjectGraph::default()
        };
        let env = build_host_environment(&graph);
        assert_eq!(env.app["doc"]["annots"], json!([{ "subject": "payload-part" }]));
    }
}
