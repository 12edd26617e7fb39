use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use braid_core::types::{CallerIdentity, Invocation, RunId};

/// A first-attempt invocation with a 30s deadline.
pub fn invocation(inputs: serde_json::Value) -> Invocation {
    Invocation::new(
        RunId::from_string("test-run"),
        "block",
        1,
        inputs,
        tokio::time::Instant::now() + Duration::from_secs(30),
        CancellationToken::new(),
        CallerIdentity::new("tester"),
    )
}

/// Write a `braid.toml` into a fresh temp dir. Keep the `TempDir` alive for
/// as long as the file is needed.
pub fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("braid.toml");
    std::fs::write(&path, content).expect("write config");
    (dir, path)
}
