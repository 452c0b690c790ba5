pub mod config;
pub mod counter;
pub mod hunt;
pub mod job;
pub mod pipeline;
pub mod record;
pub mod sdhash;
pub mod sink;
pub mod storage;
pub mod worker;

pub use config::PipelineConfig;
pub use counter::ProgressCounter;
pub use pipeline::{run, PipelineSummary};
pub use record::ResultRecord;
pub use storage::{new_storage, StorageKind, StorageSink};
