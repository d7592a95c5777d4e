//! git-fastclone: `git clone --recursive` accelerated by a shared cache of
//! bare reference mirrors.
//!
//! The cache keeps one mirror per repository URL under a common root and
//! updates each mirror at most once per run; checkouts and submodule fetches
//! then reference the mirrors instead of the network. Submodules are fetched
//! concurrently and recursively, and each mirror remembers its submodule
//! URLs so later runs can warm them ahead of time.

#[macro_use]
extern crate derive_builder;

pub mod cache;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod urls;

use std::sync::Arc;

use anyhow::{Error, Result};
use camino::Utf8Path;

pub use cache::{ReferenceCache, ReferenceCacheBuilder};
pub use engine::{CloneTask, CloneTaskBuilder};

/// Handle tying a [`ReferenceCache`] to the clone tasks that use it.
pub struct FastClone {
    cache: Arc<ReferenceCache>,
}

impl FastClone {
    pub fn new(cache: Arc<ReferenceCache>) -> Self {
        Self { cache }
    }

    /// Builder for a clone backed by this cache.
    pub fn cloner(&self) -> CloneTaskBuilder {
        let mut builder = CloneTaskBuilder::default();
        builder.cache(Arc::clone(&self.cache));
        builder
    }

    pub fn cache(&self) -> &Arc<ReferenceCache> {
        &self.cache
    }
}

/// Returns `true` if the repo url points to a path on the local filesystem.
///
/// `file://` URLs and `./`-prefixed or absolute paths count, whether or not
/// they exist yet. scp-style `user@host:path` never does, even when a
/// same-named path happens to exist; bare relative paths count only when
/// they exist.
pub fn repo_is_local(url: &str) -> bool {
    if let Ok(parsed) = url::Url::parse(url) {
        return parsed.scheme() == "file";
    }
    url.starts_with("./")
        || url.starts_with('/')
        || (!url_is_scp_scheme(url) && std::path::Path::new(url).exists())
}

fn url_split_scp_scheme(url: &str) -> Option<(usize, usize)> {
    let at = url.find('@');
    let colon = url.find(':');

    if let Some(colon_pos) = colon {
        if let Some(at_pos) = at {
            if at_pos < colon_pos {
                return Some((at_pos, colon_pos));
            }
        }
    }
    None
}

fn url_is_scp_scheme(url: &str) -> bool {
    url_split_scp_scheme(url).is_some()
}

pub(crate) trait CanCloneInto {
    fn is_clone_target(&self) -> Result<bool, Error>;
}

impl CanCloneInto for Utf8Path {
    fn is_clone_target(&self) -> Result<bool, Error> {
        Ok((!self.exists()) || (self.is_dir() && { self.read_dir()?.next().is_none() }))
    }
}
