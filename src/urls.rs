//! Mapping from repository URLs to the on-disk cache layout.
//!
//! A URL is reduced to a filesystem-safe key; prefixed with a local-path
//! discriminant it names the mirror directory, its sibling files
//! (`<dir><sep>submodules`, `<dir><sep>lock`), and the per-URL mutex and
//! freshness entries, so everything here must stay stable across calls.

use std::fs::{File, OpenOptions};
use std::sync::LazyLock;

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

/// Separator between a mirror directory name and its sibling files.
#[cfg(windows)]
pub const SIBLING_SEP: &str = "__";
#[cfg(not(windows))]
pub const SIBLING_SEP: &str = ":";

static SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*://").expect("scheme pattern compiles"));
static USERINFO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@]*@").expect("userinfo pattern compiles"));
static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'([^']*)'").expect("quoted pattern compiles"));
static PARENTHESISED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()]*)\)").expect("parenthesised pattern compiles"));

/// Filesystem-safe cache key for a repository URL.
///
/// Strips a leading `scheme://`, then a leading `user@`, then replaces `/`
/// and `:` with `-`. Idempotent, and invariant under adding or removing the
/// stripped prefixes.
pub fn key(url: &str) -> String {
    let stripped = SCHEME.replace(url, "");
    let stripped = USERINFO.replace(&stripped, "");
    stripped.replace(['/', ':'], "-")
}

/// [`key`] carrying the same local-vs-remote discriminant as the mirror
/// directory name. Mutex and freshness entries use this, so a local path
/// can never be conflated with a remote URL whose stripped key collides
/// with it.
pub fn entry_key(url: &str, local: bool) -> String {
    let prefix = if local { "local" } else { "" };
    format!("{prefix}{}", key(url))
}

/// Directory holding the bare mirror for `url` under `root`.
///
/// Local paths get a `local` prefix so a checkout of `/home/a/repo` and a
/// clone of `ssh://host/home/a/repo` cannot collide.
pub fn mirror_dir(url: &str, root: &Utf8Path, local: bool) -> Utf8PathBuf {
    root.join(entry_key(url, local))
}

fn sibling(url: &str, root: &Utf8Path, local: bool, suffix: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(format!(
        "{}{SIBLING_SEP}{suffix}",
        mirror_dir(url, root, local)
    ))
}

/// File listing the last known direct submodule URLs of the mirror.
pub fn submodules_file(url: &str, root: &Utf8Path, local: bool) -> Utf8PathBuf {
    sibling(url, root, local, "submodules")
}

/// Zero-byte file used for inter-process locking of the mirror.
pub fn lock_file_path(url: &str, root: &Utf8Path, local: bool) -> Utf8PathBuf {
    sibling(url, root, local, "lock")
}

/// Open (creating if needed) the lock file for `url`, read/write, mode 0644.
pub fn open_lock_file(url: &str, root: &Utf8Path, local: bool) -> Result<File> {
    let path = lock_file_path(url, root, local);
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }
    options
        .open(&path)
        .with_context(|| format!("opening lock file {path}"))
}

/// Extract `(path, url)` from one line of `git submodule init` output.
///
/// Lines look like `Submodule 'sub/dir' (https://host/x.git) registered for
/// path 'sub/dir'`; the path is the last single-quoted substring and the url
/// the last parenthesised one. Trailing whitespace and CR are tolerated.
pub fn parse_submodule_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_end();
    let path = QUOTED.captures_iter(line).last()?.get(1)?.as_str();
    let url = PARENTHESISED.captures_iter(line).last()?.get(1)?.as_str();
    Some((path.to_string(), url.to_string()))
}

/// Checkout directory implied by a URL: its final path component without a
/// `.git` suffix. `:` also separates, so scp-style `host:repo.git` works.
pub fn default_destination(url: &str) -> String {
    let last = url.rsplit(['/', ':']).next().unwrap_or(url);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}
