use std::process::ExitStatus;
use std::sync::LazyLock;

use regex::{Regex, RegexSet};
use thiserror::Error;

/// A subprocess finished unsuccessfully.
///
/// Keeps the raw wait status (so abnormal termination survives), the argument
/// vector that was spawned and the combined stdout+stderr captured while the
/// child ran. The output is what the failure classifier inspects.
#[derive(Debug, Error)]
#[error("`{}` failed with {status}", .args.join(" "))]
pub struct ExecutionError {
    pub status: ExitStatus,
    pub args: Vec<String>,
    pub output: String,
}

/// A mirror lock file could not be acquired within the configured bound.
#[derive(Debug, Error)]
#[error("timed out waiting {seconds}s for lock on {path}")]
pub struct LockTimeoutError {
    pub path: String,
    pub seconds: u64,
}

static AUTH_FAILED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^fatal: Authentication failed").expect("auth pattern compiles")
});

// Failure signatures that indicate a corrupt or incomplete mirror rather
// than a user-visible problem. Evicting the mirror and starting over is
// expected to clear all of them except the authentication one.
static RETRIABLE: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?m)^fatal: missing blob object",
        r"(?m)^fatal: remote did not send all necessary objects",
        r"(?m)^fatal: packed object [0-9a-f]+ \(stored in .*\) is corrupt",
        r"(?m)^fatal: pack has \d+ unresolved delta",
        r"(?m)^error: unable to read sha1 file of ",
        r"(?m)^fatal: did not receive expected object",
        r"(?m)^fatal: unable to read tree [0-9a-f]+(?:\r?\n)+warning: Clone succeeded, but checkout failed",
        r"(?m)^fatal: Authentication failed",
    ])
    .expect("retriable patterns compile")
});

/// True when the captured output reports a failed authentication.
pub fn is_auth_failure(output: &str) -> bool {
    AUTH_FAILED.is_match(output)
}

/// True when the captured output matches one of the recoverable failure
/// signatures. Callers decide whether to actually retry.
pub fn is_retriable(output: &str) -> bool {
    RETRIABLE.is_match(output)
}

/// The captured output of the [`ExecutionError`] behind `err`, if any.
pub fn execution_output(err: &anyhow::Error) -> Option<&str> {
    err.downcast_ref::<ExecutionError>()
        .map(|exec| exec.output.as_str())
}
