use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use tracing::warn;

/// Minimum payload the digest tool accepts; shorter inputs digest to empty.
const MIN_DIGEST_INPUT: usize = 512;

/// Fuzzy-digest oracle for near-duplicate detection. Implementations never
/// raise; any failure degrades to an empty digest.
pub trait SimilarityOracle: Send + Sync {
    fn digest(&self, data: &[u8]) -> String;
}

/// Always-empty oracle, used when no digest tool is configured.
pub struct NullOracle;

impl SimilarityOracle for NullOracle {
    fn digest(&self, _data: &[u8]) -> String {
        String::new()
    }
}

/// Invokes an external similarity-hashing executable on a tempfile and
/// returns its stdout verbatim (trimmed).
pub struct CommandOracle {
    command: PathBuf,
}

impl CommandOracle {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self { command: command.into() }
    }
}

impl SimilarityOracle for CommandOracle {
    fn digest(&self, data: &[u8]) -> String {
        if data.len() < MIN_DIGEST_INPUT {
            return String::new();
        }
        let mut file = match tempfile::NamedTempFile::new() {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "Similarity digest tempfile failed");
                return String::new();
            }
        };
        if let Err(e) = file.write_all(data).and_then(|_| file.flush()) {
            warn!(error = %e, "Similarity digest tempfile write failed");
            return String::new();
        }
        match Command::new(&self.command).arg(file.path()).output() {
            Ok(output) => {
                if !output.stderr.is_empty() {
                    warn!(
                        command = %self.command.display(),
                        stderr = %String::from_utf8_lossy(&output.stderr),
                        "Similarity digest tool wrote to stderr"
                    );
                }
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Err(e) => {
                warn!(command = %self.command.display(), error = %e, "Similarity digest tool failed to run");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandOracle, NullOracle, SimilarityOracle};

    #[test]
    fn short_input_digests_to_empty() {
        let oracle = CommandOracle::new("/definitely/not/a/real/tool");
        assert_eq!(oracle.digest(&[0u8; 511]), "");
    }

    #[test]
    fn missing_tool_degrades_to_empty() {
        let oracle = CommandOracle::new("/definitely/not/a/real/tool");
        assert_eq!(oracle.digest(&[0u8; 1024]), "");
    }

    #[test]
    fn null_oracle_is_always_empty() {
        assert_eq!(NullOracle.digest(&[1u8; 4096]), "");
    }
}
