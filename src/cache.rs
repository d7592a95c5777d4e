//! The reference mirror cache.
//!
//! Every repository URL maps to a bare mirror under the cache root. A mirror
//! is brought up to date at most once per run (the freshness map), and all
//! work on it happens under two locks: the sibling lock file serialises
//! processes, the per-key mutex serialises threads. The file lock is always
//! taken first.

use std::collections::HashMap;
use std::fs::File;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::errors::{self, LockTimeoutError};
use crate::exec::{self, SubprocessBuilder};
use crate::{repo_is_local, urls};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Builder)]
pub struct ReferenceCache {
    root: Utf8PathBuf,
    /// Bound on file-lock acquisition; zero waits indefinitely.
    #[builder(default)]
    lock_timeout: Duration,
    /// Warm mirrors for previously recorded submodule URLs while the parent
    /// updates.
    #[builder(default = "true")]
    prefetch_submodules: bool,
    /// Executable invoked as `SCRIPT URL MIRROR ATTEMPT` before the first
    /// mirror clone of a URL.
    #[builder(default)]
    pre_clone_hook: Option<String>,
    #[builder(default)]
    verbose: bool,
    #[builder(default)]
    print_git_errors: bool,
    #[builder(setter(skip), default)]
    fresh: Mutex<HashMap<String, bool>>,
    #[builder(setter(skip), default)]
    key_mutexes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ReferenceCacheBuilder {
    /// Build the cache and make sure its root directory exists.
    pub fn open(&self) -> Result<Arc<ReferenceCache>> {
        let cache = self
            .build()
            .expect("ReferenceCache builder correctly set up");
        std::fs::create_dir_all(&cache.root)
            .with_context(|| format!("creating reference cache root {}", cache.root))?;
        Ok(Arc::new(cache))
    }
}

impl ReferenceCache {
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Mirror directory for `url`.
    pub fn mirror_dir(&self, url: &str) -> Utf8PathBuf {
        urls::mirror_dir(url, &self.root, repo_is_local(url))
    }

    /// Ensure the mirror for `url` exists and has been updated this run,
    /// then invoke `body(mirror_dir, attempt)` while holding the per-URL
    /// mutex.
    ///
    /// A retriable execution failure, whether raised while updating the
    /// mirror or by the body, evicts the mirror (kept for authentication
    /// failures, which eviction cannot repair) and is retried once. The body
    /// runs at most twice; the second invocation sees attempt 1.
    pub fn with_mirror<T, F>(self: &Arc<Self>, url: &str, mut body: F) -> Result<T>
    where
        F: FnMut(&Utf8Path, u32) -> Result<T>,
    {
        let local = repo_is_local(url);
        let key = urls::entry_key(url, local);
        let mirror = urls::mirror_dir(url, &self.root, local);
        let mut attempt = 0u32;
        loop {
            let result = self.update(url, true, attempt).and_then(|()| {
                let mutex = self.key_mutex(&key);
                let _held = mutex.lock();
                body(&mirror, attempt)
            });
            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt == 0 => {
                    let retriable = errors::execution_output(&err)
                        .filter(|output| errors::is_retriable(output));
                    let Some(output) = retriable else {
                        return Err(err);
                    };
                    for line in output.lines() {
                        eprintln!("  {line}");
                    }
                    if !errors::is_auth_failure(output) {
                        self.evict(url)?;
                    }
                    debug!("retrying mirror for {url} after recoverable failure");
                    attempt = 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// The freshness path: bring the mirror for `url` up to date, at most
    /// once per run.
    ///
    /// Takes the inter-process file lock, then the per-key mutex. While the
    /// locks are held, previously recorded submodule URLs are warmed by
    /// detached prefetch workers whose failures never surface.
    pub fn update(self: &Arc<Self>, url: &str, fail_hard: bool, attempt: u32) -> Result<()> {
        let local = repo_is_local(url);
        let key = urls::entry_key(url, local);
        let mirror = urls::mirror_dir(url, &self.root, local);

        let lock_file = urls::open_lock_file(url, &self.root, local)?;
        let mut file_lock = fd_lock::RwLock::new(lock_file);
        let _file_held = self.lock_exclusively(&mut file_lock, url, local)?;
        let mutex = self.key_mutex(&key);
        let _held = mutex.lock();

        let submodules = urls::submodules_file(url, &self.root, local);
        if self.prefetch_submodules && submodules.exists() {
            self.prefetch(&submodules);
        }

        if !self.is_fresh(&key) {
            self.store_updated(url, &mirror, &key, fail_hard, attempt)?;
        }
        Ok(())
    }

    /// Persist the direct submodule URLs of `url`'s repository next to its
    /// mirror, under the same lock pair the update path takes.
    pub fn write_submodule_list(&self, url: &str, submodule_urls: &[String]) -> Result<()> {
        if submodule_urls.is_empty() {
            return Ok(());
        }
        let local = repo_is_local(url);
        let lock_file = urls::open_lock_file(url, &self.root, local)?;
        let mut file_lock = fd_lock::RwLock::new(lock_file);
        let _file_held = self.lock_exclusively(&mut file_lock, url, local)?;
        let mutex = self.key_mutex(&urls::entry_key(url, local));
        let _held = mutex.lock();

        let path = urls::submodules_file(url, &self.root, local);
        let mut contents = submodule_urls.join("\n");
        contents.push('\n');
        std::fs::write(&path, contents).with_context(|| format!("writing {path}"))
    }

    /// Remove a mirror so the next caller re-clones from scratch, taking
    /// the same lock pair as the update path so a concurrent writer is
    /// never pulled out from under. Safe to call for an already-evicted
    /// entry.
    pub fn evict(&self, url: &str) -> Result<()> {
        let local = repo_is_local(url);
        let lock_file = urls::open_lock_file(url, &self.root, local)?;
        let mut file_lock = fd_lock::RwLock::new(lock_file);
        let _file_held = self.lock_exclusively(&mut file_lock, url, local)?;
        let key = urls::entry_key(url, local);
        let mutex = self.key_mutex(&key);
        let _held = mutex.lock();

        self.evict_entry(&urls::mirror_dir(url, &self.root, local), &key);
        Ok(())
    }

    fn evict_entry(&self, mirror: &Utf8Path, key: &str) {
        debug!("evicting mirror {mirror}");
        if let Err(err) = std::fs::remove_dir_all(mirror) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {mirror}: {err}");
            }
        }
        self.fresh.lock().remove(key);
    }

    fn store_updated(
        &self,
        url: &str,
        mirror: &Utf8Path,
        key: &str,
        fail_hard: bool,
        attempt: u32,
    ) -> Result<()> {
        match self.create_or_update(url, mirror, attempt) {
            Ok(()) => {
                self.fresh.lock().insert(key.to_string(), true);
                Ok(())
            }
            Err(err) => {
                let auth = errors::execution_output(&err).is_some_and(errors::is_auth_failure);
                if !auth {
                    self.evict_entry(mirror, key);
                }
                if fail_hard {
                    Err(err)
                } else {
                    warn!("updating mirror for {url} failed: {err:#}");
                    Ok(())
                }
            }
        }
    }

    fn create_or_update(&self, url: &str, mirror: &Utf8Path, attempt: u32) -> Result<()> {
        if !mirror.exists() {
            if let Some(hook) = &self.pre_clone_hook {
                let mut builder = SubprocessBuilder::default();
                builder
                    .args(vec![
                        hook.clone(),
                        url.to_string(),
                        mirror.to_string(),
                        attempt.to_string(),
                    ])
                    .quiet(!self.verbose)
                    .print_on_failure(self.print_git_errors);
                builder.run()?;
            }
        }
        if !mirror.exists() {
            println!("git-fastclone: creating mirror for {url}");
            exec::git(["clone", "--mirror", "--", url, mirror.as_str()])
                .quiet(!self.verbose)
                .print_on_failure(self.print_git_errors)
                .run()?;
        }
        exec::git(["remote", "update", "--prune"])
            .current_dir(Some(mirror.to_path_buf()))
            .quiet(!self.verbose)
            .print_on_failure(self.print_git_errors)
            .run()?;
        Ok(())
    }

    /// Fire-and-forget warm-ups for every URL recorded in `submodules_file`.
    fn prefetch(self: &Arc<Self>, submodules_file: &Utf8Path) {
        let listed = match std::fs::read_to_string(submodules_file) {
            Ok(contents) => contents,
            Err(err) => {
                debug!("unreadable submodules file {submodules_file}: {err}");
                return;
            }
        };
        for line in listed.lines() {
            let sub_url = line.trim().to_string();
            if sub_url.is_empty() {
                continue;
            }
            let cache = Arc::clone(self);
            thread::spawn(move || {
                debug!("prefetching {sub_url}");
                if let Err(err) = cache.update(&sub_url, false, 0) {
                    debug!("prefetch of {sub_url} failed: {err:#}");
                }
            });
        }
    }

    fn lock_exclusively<'a>(
        &self,
        lock: &'a mut fd_lock::RwLock<File>,
        url: &str,
        local: bool,
    ) -> Result<fd_lock::RwLockWriteGuard<'a, File>> {
        if self.lock_timeout.is_zero() {
            return lock.write().context("acquiring mirror lock");
        }
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            // Probe only; the guard is dropped at the end of the arm so the
            // real acquisition below can hand its guard to the caller.
            match lock.try_write() {
                Ok(_probe) => break,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(LockTimeoutError {
                            path: urls::lock_file_path(url, &self.root, local).into_string(),
                            seconds: self.lock_timeout.as_secs(),
                        }
                        .into());
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(err).context("acquiring mirror lock"),
            }
        }
        lock.write().context("acquiring mirror lock")
    }

    fn key_mutex(&self, key: &str) -> Arc<Mutex<()>> {
        self.key_mutexes
            .lock()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn is_fresh(&self, key: &str) -> bool {
        self.fresh.lock().get(key).copied().unwrap_or(false)
    }
}
