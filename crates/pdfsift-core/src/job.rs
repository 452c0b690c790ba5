use std::path::{Path, PathBuf};
use std::sync::Arc;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::counter::ProgressCounter;

/// Unit of work on the job channel. One `Shutdown` sentinel is pushed per
/// worker to drive graceful shutdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    Document(PathBuf),
    Shutdown,
}

pub trait Validator: Send + Sync {
    fn valid(&self, path: &Path) -> bool;
}

/// Default admission rule: the candidate is an existing regular file.
pub struct FileValidator;

impl Validator for FileValidator {
    fn valid(&self, path: &Path) -> bool {
        path.is_file()
    }
}

pub struct JobSource<'a> {
    validator: &'a dyn Validator,
}

impl<'a> JobSource<'a> {
    pub fn new(validator: &'a dyn Validator) -> Self {
        Self { validator }
    }

    /// Validates candidates, publishes the hard maximum on every counter,
    /// then enqueues the admitted jobs followed by exactly `worker_count`
    /// sentinels. Invalid candidates are silently dropped.
    ///
    /// The ceiling goes out before the first job so no worker can ever check
    /// completion against a stale maximum.
    pub fn submit(
        &self,
        candidates: impl IntoIterator<Item = PathBuf>,
        jobs: &Sender<Job>,
        worker_count: usize,
        counters: &[Arc<ProgressCounter>],
    ) -> usize {
        let admitted: Vec<PathBuf> = candidates
            .into_iter()
            .filter(|path| {
                let ok = self.validator.valid(path);
                if !ok {
                    debug!(path = %path.display(), "Dropping invalid candidate");
                }
                ok
            })
            .collect();
        for counter in counters {
            counter.set_ceiling(admitted.len() as u64);
        }
        let count = admitted.len();
        for path in admitted {
            if jobs.send(Job::Document(path)).is_err() {
                break;
            }
        }
        for _ in 0..worker_count {
            if jobs.send(Job::Shutdown).is_err() {
                break;
            }
        }
        info!(jobs = count, workers = worker_count, "Job queue populated");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::{FileValidator, Job, JobSource};
    use crate::counter::ProgressCounter;
    use std::io::Write;
    use std::sync::Arc;

    #[test]
    fn admits_valid_paths_and_appends_sentinels() {
        let dir = tempfile::tempdir().unwrap();
        let mut candidates = Vec::new();
        for i in 0..5 {
            let path = dir.path().join(format!("sample-{i}.pdf"));
            std::fs::File::create(&path).unwrap().write_all(b"%PDF-1.4").unwrap();
            candidates.push(path);
        }
        candidates.push(dir.path().join("missing-1.pdf"));
        candidates.push(dir.path().join("missing-2.pdf"));

        let (tx, rx) = crossbeam_channel::unbounded();
        let counters = vec![Arc::new(ProgressCounter::new("hashed"))];
        let admitted = JobSource::new(&FileValidator).submit(candidates, &tx, 3, &counters);
        drop(tx);

        assert_eq!(admitted, 5);
        assert_eq!(counters[0].ceiling(), 5);
        let queued: Vec<Job> = rx.iter().collect();
        assert_eq!(queued.len(), 8);
        assert_eq!(queued.iter().filter(|j| matches!(j, Job::Document(_))).count(), 5);
        assert_eq!(queued.iter().filter(|j| matches!(j, Job::Shutdown)).count(), 3);
        // Sentinels come after every job.
        assert!(queued[5..].iter().all(|j| matches!(j, Job::Shutdown)));
    }
}
