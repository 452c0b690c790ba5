use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use crossbeam_channel::{bounded, unbounded};
use tracing::info;

use crate::config::PipelineConfig;
use crate::counter::ProgressCounter;
use crate::job::{FileValidator, JobSource};
use crate::sdhash::{CommandOracle, NullOracle, SimilarityOracle};
use crate::sink::{run_sink, StatusEvent};
use crate::storage::new_storage;
use crate::worker::run_worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub admitted: usize,
    pub hashed: u64,
    pub stored: u64,
}

/// Wires the channels, starts sink then workers then job source, and joins
/// them in order. Results arrive at the sink in arbitrary interleaving; only
/// per-job stage order is fixed.
pub fn run(config: PipelineConfig, candidates: Vec<PathBuf>) -> Result<PipelineSummary> {
    let worker_count = config.workers.max(1);
    let config = Arc::new(config);
    let oracle: Arc<dyn SimilarityOracle> = match &config.sdhash_command {
        Some(cmd) => Arc::new(CommandOracle::new(cmd.clone())),
        None => Arc::new(NullOracle),
    };

    let (job_tx, job_rx) = bounded(worker_count * 4);
    let (result_tx, result_rx) = bounded(worker_count * 4);
    let (status_tx, status_rx) = unbounded();

    let hashed = Arc::new(ProgressCounter::new("hashed"));
    let stored = Arc::new(ProgressCounter::new("stored"));
    let counters = vec![hashed.clone(), stored.clone()];

    let storage = new_storage(config.storage, &config.storage_name);
    let sink_counter = stored.clone();
    let sink = std::thread::spawn(move || {
        run_sink(result_rx, storage, sink_counter, worker_count, status_tx);
    });

    match status_rx.recv() {
        Ok(StatusEvent::StorageReady(true)) => {}
        _ => {
            let _ = sink.join();
            return Err(anyhow!("storage backend failed to open"));
        }
    }

    let mut workers = Vec::with_capacity(worker_count);
    for id in 0..worker_count {
        let jobs = job_rx.clone();
        let results = result_tx.clone();
        let counter = hashed.clone();
        let config = config.clone();
        let oracle = oracle.clone();
        workers.push(std::thread::spawn(move || {
            run_worker(id, jobs, results, counter, config, oracle);
        }));
    }
    drop(job_rx);
    drop(result_tx);

    let jobber = std::thread::spawn(move || {
        JobSource::new(&FileValidator).submit(candidates, &job_tx, worker_count, &counters)
    });

    let admitted = jobber.join().map_err(|_| anyhow!("job source panicked"))?;
    for worker in workers {
        worker.join().map_err(|_| anyhow!("worker panicked"))?;
    }
    sink.join().map_err(|_| anyhow!("sink panicked"))?;

    let summary =
        PipelineSummary { admitted, hashed: hashed.value(), stored: stored.value() };
    info!(
        admitted = summary.admitted,
        hashed = summary.hashed,
        stored = summary.stored,
        "Pipeline complete"
    );
    Ok(summary)
}
