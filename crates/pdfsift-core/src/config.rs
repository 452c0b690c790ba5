use std::path::PathBuf;
use std::time::Duration;

use pdfsift_pdf::node::ParseLimits;

use crate::storage::StorageKind;

/// Explicit pipeline configuration handed to the job source, workers, and
/// sink at construction; nothing is global.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub storage: StorageKind,
    pub storage_name: String,
    /// Free-form sample category label copied onto every record.
    pub category: String,
    /// External similarity-digest executable; None disables digests.
    pub sdhash_command: Option<PathBuf>,
    /// Wall-clock budget per deobfuscation session.
    pub deob_timeout: Duration,
    /// Disables the script sandbox entirely when false.
    pub sandbox: bool,
    pub limits: ParseLimits,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            storage: StorageKind::Stdout,
            storage_name: String::new(),
            category: String::new(),
            sdhash_command: None,
            deob_timeout: Duration::from_secs(10),
            sandbox: true,
            limits: ParseLimits::default(),
        }
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get() / 2).unwrap_or(1).max(1)
}

#[cfg(test)]
mod tests {
    use super::{default_workers, PipelineConfig};

    #[test]
    fn at_least_one_worker() {
        assert!(default_workers() >= 1);
        assert!(PipelineConfig::default().workers >= 1);
    }
}
