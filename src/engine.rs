//! The recursive fetch engine.
//!
//! A clone runs in three phases: materialise the checkout from a fresh
//! mirror, check out the requested revision, then discover submodules with
//! `git submodule init` and fan out one task per submodule. Each task fetches
//! through its own mirror and recurses, so arbitrarily deep submodule trees
//! are handled by the work-stealing pool rather than the call stack alone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use camino::{Utf8Path, Utf8PathBuf};
use console::style;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::cache::ReferenceCache;
use crate::{exec, urls, CanCloneInto as _};

#[derive(Builder)]
pub struct CloneTask {
    cache: Arc<ReferenceCache>,
    #[builder(setter(into))]
    repository_url: String,
    /// Revision checked out after the clone.
    #[builder(default)]
    revision: Option<String>,
    /// Defaults to the URL's final path component.
    #[builder(default)]
    target_path: Option<Utf8PathBuf>,
    /// Extra `--config` forwarded to the outer clone.
    #[builder(default)]
    clone_config: Option<String>,
    /// Cone-mode sparse checkout prefixes. Sparse checkouts clone from the
    /// mirror itself, so their `origin` names the mirror path, not the
    /// source URL.
    #[builder(default)]
    sparse_paths: Option<Vec<String>>,
    #[builder(default)]
    verbose: bool,
    #[builder(default)]
    print_git_errors: bool,
    #[builder(default)]
    color: bool,
    /// Width of the submodule fan-out; defaults to the number of cores.
    #[builder(default)]
    jobs: Option<usize>,
}

impl CloneTaskBuilder {
    pub fn run(&self) -> Result<()> {
        self.build().expect("CloneTask builder correctly set up").run()
    }
}

static RAYON_CONFIGURED: AtomicBool = AtomicBool::new(false);

fn configure_thread_pool(jobs: Option<usize>) {
    let Some(jobs) = jobs else { return };
    if !RAYON_CONFIGURED.swap(true, Ordering::AcqRel) {
        let _ = ThreadPoolBuilder::new().num_threads(jobs).build_global();
    }
}

impl CloneTask {
    pub fn run(&self) -> Result<()> {
        let url = &self.repository_url;
        let dest = match &self.target_path {
            Some(path) => path.clone(),
            None => Utf8PathBuf::from(urls::default_destination(url)),
        };
        if !dest.is_clone_target()? {
            bail!("destination path '{dest}' already exists and is not an empty directory");
        }

        configure_thread_pool(self.jobs);

        self.status(&format!("Cloning {url} into {dest}"));
        self.cache.with_mirror(url, |mirror, attempt| {
            if attempt > 0 {
                purge_dir(&dest)?;
            }
            if let Some(paths) = &self.sparse_paths {
                self.sparse_clone(mirror, &dest, paths)
            } else {
                self.reference_clone(mirror, url, &dest)
            }
        })?;

        if self.sparse_paths.is_none() {
            if let Some(revision) = &self.revision {
                self.git_in(&dest, ["checkout", "--quiet", revision.as_str()])?;
            }
        }

        self.update_submodules(&dest, url)
    }

    /// `git clone --reference MIRROR URL DEST`: objects come from the
    /// mirror, `origin` stays pointed at the source.
    fn reference_clone(&self, mirror: &Utf8Path, url: &str, dest: &Utf8Path) -> Result<()> {
        let mut args = vec![
            "clone".to_string(),
            self.verbosity_flag().to_string(),
            "--reference".to_string(),
            mirror.to_string(),
            url.to_string(),
            dest.to_string(),
        ];
        if let Some(config) = &self.clone_config {
            args.push("--config".to_string());
            args.push(config.clone());
        }
        exec::git(args)
            .quiet(!self.verbose)
            .print_on_failure(self.print_git_errors)
            .run()?;
        Ok(())
    }

    /// Clone straight from the mirror without a checkout, then materialise
    /// only the requested cone prefixes at the requested revision.
    fn sparse_clone(&self, mirror: &Utf8Path, dest: &Utf8Path, paths: &[String]) -> Result<()> {
        exec::git([
            "clone",
            self.verbosity_flag(),
            "--no-checkout",
            mirror.as_str(),
            dest.as_str(),
        ])
        .quiet(!self.verbose)
        .print_on_failure(self.print_git_errors)
        .run()?;

        self.git_in(dest, ["sparse-checkout", "init", "--cone"])?;
        let mut set = vec!["sparse-checkout".to_string(), "set".to_string()];
        set.extend(paths.iter().cloned());
        self.git_in(dest, set)?;

        let revision = self
            .revision
            .as_deref()
            .context("sparse checkout requires an explicit branch")?;
        self.git_in(dest, ["checkout", "--quiet", revision])?;
        Ok(())
    }

    /// Discover the direct submodules of the checkout at `pwd`, record their
    /// URLs for the prefetch path, then fetch each through its own mirror
    /// and recurse. All tasks are joined before this returns.
    fn update_submodules(&self, pwd: &Utf8Path, parent_url: &str) -> Result<()> {
        if !pwd.join(".gitmodules").exists() {
            return Ok(());
        }

        let output = self.git_in(pwd, ["submodule", "init"])?;
        let submodules: Vec<(String, String)> = output
            .lines()
            .filter_map(urls::parse_submodule_line)
            .collect();

        let listed: Vec<String> = submodules
            .iter()
            .map(|(_, sub_url)| sub_url.clone())
            .collect();
        self.cache.write_submodule_list(parent_url, &listed)?;

        submodules
            .par_iter()
            .map(|(path, sub_url)| self.fetch_submodule(pwd, path, sub_url))
            .collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    fn fetch_submodule(&self, pwd: &Utf8Path, path: &str, sub_url: &str) -> Result<()> {
        self.status(&format!("Updating submodule {path}"));
        self.cache.with_mirror(sub_url, |mirror, _attempt| {
            let mut args = vec!["submodule".to_string(), "update".to_string()];
            if !self.verbose {
                args.push("--quiet".to_string());
            }
            args.push("--reference".to_string());
            args.push(mirror.to_string());
            args.push(path.to_string());
            self.git_in(pwd, args)?;
            Ok(())
        })?;
        self.update_submodules(&pwd.join(path), sub_url)
    }

    fn git_in<I, S>(&self, dir: &Utf8Path, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        exec::git(args)
            .current_dir(Some(dir.to_path_buf()))
            .quiet(!self.verbose)
            .print_on_failure(self.print_git_errors)
            .run()
    }

    fn verbosity_flag(&self) -> &'static str {
        if self.verbose {
            "--verbose"
        } else {
            "--quiet"
        }
    }

    fn status(&self, message: &str) {
        if self.color {
            println!("{} {message}", style("git-fastclone:").cyan().bold());
        } else {
            println!("git-fastclone: {message}");
        }
    }
}

/// Empty out a directory left behind by a failed attempt, keeping the
/// directory itself.
fn purge_dir(dir: &Utf8Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in dir
        .read_dir_utf8()
        .with_context(|| format!("listing {dir}"))?
    {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(path).with_context(|| format!("removing {path}"))?;
        } else {
            std::fs::remove_file(path).with_context(|| format!("removing {path}"))?;
        }
    }
    Ok(())
}
