pub mod engine;
pub mod host;

pub use engine::{DeobOptions, DeobOutcome, RepairSession, RepairStep};
pub use host::{build_host_environment, HostEnvironment};

use pdfsift_pdf::node::ObjectGraph;

/// Normalizes an obfuscated script candidate against the document it came
/// from. Returns empty text when the script is empty or no sandbox is built
/// in; timeouts surface so the caller can record them.
pub fn deobfuscate(script: &str, graph: &ObjectGraph, options: &DeobOptions) -> DeobOutcome {
    if script.is_empty() {
        return DeobOutcome::Completed(String::new());
    }
    let env = build_host_environment(graph);
    engine::deobfuscate_with_env(script, &env, options)
}
