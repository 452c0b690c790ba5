use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::counter::ProgressCounter;
use crate::record::ResultRecord;
use crate::storage::StorageSink;

/// What workers put on the result channel: one record per job, then one
/// `Finished` sentinel each at shutdown.
#[derive(Debug)]
pub enum Outcome {
    Record(Box<ResultRecord>),
    Finished,
}

/// Side status channel events, consumed by the pipeline runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    StorageReady(bool),
}

/// Drains the result channel into storage until every worker's sentinel has
/// arrived. Storage failures append to the record's own error text and retry
/// once as an error-only record, then drop.
pub fn run_sink(
    results: Receiver<Outcome>,
    mut storage: Box<dyn StorageSink>,
    counter: Arc<ProgressCounter>,
    worker_count: usize,
    status: Sender<StatusEvent>,
) {
    let ready = storage.open();
    let _ = status.send(StatusEvent::StorageReady(ready));
    if !ready {
        warn!("Storage backend failed to open; sink exiting");
        return;
    }
    let mut finished = 0usize;
    while finished < worker_count {
        match results.recv() {
            Ok(Outcome::Finished) => {
                finished += 1;
                debug!(finished, worker_count, "Sink saw worker sentinel");
            }
            Ok(Outcome::Record(mut record)) => {
                debug!(pdf_key = record.pdf_key.as_str(), "Storing record");
                if let Err(e) = storage.store(&record) {
                    warn!(pdf_key = record.pdf_key.as_str(), error = %e, "Store failed; retrying error-only record");
                    if record.errors.is_empty() {
                        record.errors = format!("<StorageException>{e}</StorageException>");
                    } else {
                        record.errors =
                            format!("{}\n<StorageException>{e}</StorageException>", record.errors);
                    }
                    if let Err(e2) = storage.store(&record.error_only()) {
                        warn!(pdf_key = record.pdf_key.as_str(), error = %e2, "Error-only retry failed; dropping record");
                    }
                }
                counter.inc();
            }
            Err(_) => {
                // All senders gone without full sentinel count; nothing more
                // will arrive.
                warn!(finished, worker_count, "Result channel closed early");
                break;
            }
        }
    }
    storage.close();
    info!(stored = counter.value(), "Sink drained; storage closed");
}
