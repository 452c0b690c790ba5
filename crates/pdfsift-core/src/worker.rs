use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use js_deobs::{DeobOptions, DeobOutcome};
use pdfsift_pdf::classify::unescape_entities;
use pdfsift_pdf::node::{parse_document, ObjectGraph};
use pdfsift_pdf::swf::parse_swf_header;
use pdfsift_pdf::tree::{edges, render_edges, serialize_tree};

use crate::config::PipelineConfig;
use crate::counter::ProgressCounter;
use crate::hunt::hunt_urls;
use crate::job::Job;
use crate::record::ResultRecord;
use crate::sdhash::SimilarityOracle;
use crate::sink::Outcome;

/// One worker unit: pulls jobs until its sentinel arrives, forwards exactly
/// one record per job and one `Finished` at shutdown. Nothing on any path
/// may swallow a job without producing a record.
pub fn run_worker(
    id: usize,
    jobs: Receiver<Job>,
    results: Sender<Outcome>,
    counter: Arc<ProgressCounter>,
    config: Arc<PipelineConfig>,
    oracle: Arc<dyn SimilarityOracle>,
) {
    loop {
        let job = match jobs.recv() {
            Ok(job) => job,
            // Channel gone means the producer died; treat as shutdown.
            Err(_) => Job::Shutdown,
        };
        match job {
            Job::Shutdown => {
                debug!(worker = id, "Worker received sentinel");
                let _ = results.send(Outcome::Finished);
                return;
            }
            Job::Document(path) => {
                info!(
                    worker = id,
                    done = counter.value(),
                    ceiling = counter.ceiling(),
                    path = %path.display(),
                    "Hashing document"
                );
                let record = catch_unwind(AssertUnwindSafe(|| {
                    process_document(&path, &config, oracle.as_ref())
                }))
                .unwrap_or_else(|panic| {
                    warn!(worker = id, path = %path.display(), "Worker stage panicked");
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    ResultRecord::degraded(
                        &document_key(&path),
                        &config.category,
                        format!("UNCAUGHT PIPELINE PANIC: {reason}"),
                    )
                });
                let _ = results.send(Outcome::Record(Box::new(record)));
                counter.inc();
            }
        }
    }
}

fn document_key(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| {
        path.to_string_lossy().to_string()
    })
}

/// Fixed stage order: parse, classify-derived extraction, deobfuscate,
/// digest, record. A failing stage degrades its own fields and the rest
/// still run.
fn process_document(path: &Path, config: &PipelineConfig, oracle: &dyn SimilarityOracle) -> ResultRecord {
    let pdf_key = document_key(path);
    let mut record = ResultRecord {
        category: config.category.clone(),
        pdf_key,
        ..ResultRecord::default()
    };
    let mut errors: Vec<String> = Vec::new();

    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            record.errors = format!("<ParseException>{e}</ParseException>");
            return record;
        }
    };
    record.fsize = bytes.len().to_string();

    let graph = parse_document(&bytes, config.limits);
    record.pdfsize = graph.bytes_read.to_string();
    record.bin_blob = String::from_utf8_lossy(&graph.binary_tail).to_string();

    record.tree = serialize_tree(&graph);
    record.tree_key = sha256_hex(record.tree.as_bytes());
    record.graph = render_edges(&edges(&graph));

    record.obf_js = gather_script(&graph);
    record.de_js = deobfuscate_stage(&record.obf_js, &graph, config, &mut errors);
    record.obf_js_sdhash = oracle.digest(record.obf_js.as_bytes());
    record.de_js_sdhash = oracle.digest(record.de_js.as_bytes());

    let mut urls = hunt_urls(&record.obf_js);
    urls.extend(hunt_urls(&record.de_js));
    record.urls = urls.join("\n");

    record.swf = gather_flash(&graph);
    record.swf_sdhash = oracle.digest(record.swf.as_bytes());

    record.malformed = match serde_json::to_string(&graph.malformed) {
        Ok(json) => json,
        Err(e) => {
            errors.push(format!("<MalformedLedgerException>{e}</MalformedLedgerException>"));
            String::from("{}")
        }
    };

    errors.extend(graph.errors.iter().cloned());
    record.errors = errors.join("\n");
    record
}

/// Joins all script candidates, entity-unescaped, with markup-opening lines
/// commented out so tree fragments cannot masquerade as code.
fn gather_script(graph: &ObjectGraph) -> String {
    let blocks: Vec<String> =
        graph.scripts.iter().map(|c| comment_out_markup(&unescape_entities(&c.text))).collect();
    blocks.join("\n\n")
}

fn comment_out_markup(script: &str) -> String {
    let lines: Vec<String> = script
        .split('\n')
        .map(|line| {
            if let Some(rest) = line.strip_prefix('<') {
                format!("//{rest}")
            } else {
                line.to_string()
            }
        })
        .collect();
    lines.join("\n")
}

fn deobfuscate_stage(
    script: &str,
    graph: &ObjectGraph,
    config: &PipelineConfig,
    errors: &mut Vec<String>,
) -> String {
    if !config.sandbox || script.is_empty() {
        return String::new();
    }
    let options = DeobOptions { timeout: config.deob_timeout, ..DeobOptions::default() };
    match js_deobs::deobfuscate(script, graph, &options) {
        DeobOutcome::Completed(text) => text,
        DeobOutcome::TimedOut => {
            errors.push(format!(
                "<DeobfuscateJSException>sandbox timeout after {}ms</DeobfuscateJSException>",
                config.deob_timeout.as_millis()
            ));
            String::new()
        }
        DeobOutcome::Unavailable => String::new(),
    }
}

fn gather_flash(graph: &ObjectGraph) -> String {
    let mut out = String::new();
    for payload in &graph.flash {
        if let Some(header) = parse_swf_header(payload) {
            debug!(
                version = header.version,
                declared_len = header.declared_len,
                compression = ?header.compression,
                "Collected Flash payload"
            );
        }
        out.push_str(String::from_utf8_lossy(payload).trim());
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::{comment_out_markup, sha256_hex};

    #[test]
    fn markup_lines_become_comments() {
        assert_eq!(comment_out_markup("<tag>\ncode();"), "//tag>\ncode();");
        assert_eq!(comment_out_markup("app.alert(1)"), "app.alert(1)");
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
