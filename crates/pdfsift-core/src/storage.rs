use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use tracing::{info, warn};

use crate::record::ResultRecord;

/// Persistence backend for result records. `store` is best-effort from the
/// pipeline's point of view: the sink logs and retries a failure once, but a
/// backend error never propagates further. Records are independent and keyed
/// by `pdf_key`; no ordering may be assumed.
pub trait StorageSink: Send {
    fn open(&mut self) -> bool;
    fn store(&mut self, record: &ResultRecord) -> Result<()>;
    fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Stdout,
    File,
    Jsonl,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stdout" => Ok(StorageKind::Stdout),
            "file" => Ok(StorageKind::File),
            "jsonl" => Ok(StorageKind::Jsonl),
            other => anyhow::bail!("unknown storage kind '{other}'"),
        }
    }
}

pub fn new_storage(kind: StorageKind, name: &str) -> Box<dyn StorageSink> {
    let stem = if name.is_empty() { "pdfsift-out" } else { name };
    match kind {
        StorageKind::Stdout => Box::new(StdoutStorage),
        StorageKind::File => Box::new(FileStorage::new(format!("{stem}.txt"))),
        StorageKind::Jsonl => Box::new(JsonlStorage::new(format!("{stem}.jsonl"))),
    }
}

/// Writes each record as one JSON document to standard output.
pub struct StdoutStorage;

impl StorageSink for StdoutStorage {
    fn open(&mut self) -> bool {
        true
    }

    fn store(&mut self, record: &ResultRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        println!("{line}");
        Ok(())
    }

    fn close(&mut self) {}
}

/// Human-readable sectioned text file, one header-delimited block per record.
pub struct FileStorage {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: None }
    }
}

impl StorageSink for FileStorage {
    fn open(&mut self) -> bool {
        match File::create(&self.path) {
            Ok(f) => {
                self.writer = Some(BufWriter::new(f));
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open file storage");
                false
            }
        }
    }

    fn store(&mut self, record: &ResultRecord) -> Result<()> {
        let writer = self.writer.as_mut().context("file storage not open")?;
        writeln!(writer, "{}", "-".repeat(80))?;
        writeln!(writer, "{}", record.pdf_key)?;
        writeln!(writer, "{}", "-".repeat(80))?;
        let value = serde_json::to_value(record)?;
        if let Some(fields) = value.as_object() {
            for (key, val) in fields {
                writeln!(writer, "__{key}")?;
                writeln!(writer, "{}\n", val.as_str().unwrap_or_default())?;
            }
        }
        writeln!(writer)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
        info!(path = %self.path.display(), "File storage closed");
    }
}

/// One JSON record per line; the natural input for downstream bulk loaders.
pub struct JsonlStorage {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: None }
    }
}

impl StorageSink for JsonlStorage {
    fn open(&mut self) -> bool {
        match File::create(&self.path) {
            Ok(f) => {
                self.writer = Some(BufWriter::new(f));
                true
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open jsonl storage");
                false
            }
        }
    }

    fn store(&mut self, record: &ResultRecord) -> Result<()> {
        let writer = self.writer.as_mut().context("jsonl storage not open")?;
        serde_json::to_writer(&mut *writer, record)?;
        writeln!(writer)?;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{JsonlStorage, StorageKind, StorageSink};
    use crate::record::ResultRecord;

    #[test]
    fn storage_kind_parses() {
        assert_eq!("stdout".parse::<StorageKind>().unwrap(), StorageKind::Stdout);
        assert_eq!("jsonl".parse::<StorageKind>().unwrap(), StorageKind::Jsonl);
        assert!("postgres".parse::<StorageKind>().is_err());
    }

    #[test]
    fn jsonl_round_trips_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let mut storage = JsonlStorage::new(&path);
        assert!(storage.open());
        let record = ResultRecord {
            pdf_key: "sample.pdf".into(),
            obf_js: "app.alert(1)".into(),
            ..ResultRecord::default()
        };
        storage.store(&record).unwrap();
        storage.close();
        let text = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["pdf_key"], "sample.pdf");
        assert_eq!(parsed["obf_js"], "app.alert(1)");
    }

    #[test]
    fn store_before_open_errors() {
        let mut storage = JsonlStorage::new("/nonexistent-dir/x.jsonl");
        assert!(storage.store(&ResultRecord::default()).is_err());
    }
}
