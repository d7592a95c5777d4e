//! End-to-end tests driving the binary against throwaway local
//! repositories.

use std::path::Path;
use std::process::Command as StdCommand;

use assert_cmd::Command;
use predicates::prelude::*;

fn fastclone() -> Command {
    Command::cargo_bin("git-fastclone").unwrap()
}

fn git(args: &[&str]) {
    let status = StdCommand::new("git")
        .args(args)
        .status()
        .expect("git is available");
    assert!(status.success(), "git {args:?} failed");
}

fn commit_all(repo: &Path, message: &str) {
    let repo = repo.to_str().unwrap();
    git(&["-C", repo, "add", "."]);
    git(&[
        "-C",
        repo,
        "-c",
        "user.name=test",
        "-c",
        "user.email=test@example.com",
        "commit",
        "-q",
        "-m",
        message,
    ]);
}

/// A local repository with one commit on `main`.
fn source_repo(root: &Path, name: &str) -> String {
    let repo = root.join(name);
    git(&["init", "-q", "-b", "main", repo.to_str().unwrap()]);
    std::fs::write(repo.join("README"), format!("{name}\n")).unwrap();
    commit_all(&repo, "init");
    repo.to_str().unwrap().to_string()
}

/// Runs the binary with an isolated mirror cache under `root`.
fn fastclone_in(root: &Path) -> Command {
    let mut cmd = fastclone();
    cmd.current_dir(root)
        .env("REFERENCE_REPO_DIR", root.join("reference"))
        // Modern git refuses file-protocol submodules by default.
        .env("GIT_CONFIG_COUNT", "1")
        .env("GIT_CONFIG_KEY_0", "protocol.file.allow")
        .env("GIT_CONFIG_VALUE_0", "always");
    cmd
}

fn mirror_for(root: &Path, url: &str) -> std::path::PathBuf {
    let key = url.replace(['/', ':'], "-");
    root.join("reference").join(format!("local{key}"))
}

#[test]
fn help_displays() {
    fastclone()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("reference mirror cache"));
}

#[test]
fn missing_url_exits_129() {
    fastclone()
        .assert()
        .code(129)
        .stderr(predicate::str::contains("usage:"));
}

#[test]
fn sparse_without_branch_exits_129() {
    fastclone()
        .args(["--sparse-paths", "a,b", "https://example.com/repo.git"])
        .assert()
        .code(129)
        .stderr(predicate::str::contains("--branch"));
}

#[test]
fn clones_and_leaves_a_mirror_behind() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "origin");

    fastclone_in(dir.path())
        .args([url.as_str(), "checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cloning"));

    let dest = dir.path().join("checkout");
    assert!(dest.join(".git").is_dir());
    assert_eq!(
        std::fs::read_to_string(dest.join("README")).unwrap(),
        "origin\n"
    );
    assert!(mirror_for(dir.path(), &url).is_dir());
}

#[test]
fn derives_the_destination_from_the_url() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "proj");

    fastclone_in(dir.path()).arg(&url).assert().success();

    // The final path component of the URL names the checkout.
    assert!(dir.path().join("proj/.git").is_dir());
}

#[test]
fn reuses_the_mirror_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "origin");

    fastclone_in(dir.path())
        .args([url.as_str(), "first"])
        .assert()
        .success();
    fastclone_in(dir.path())
        .args([url.as_str(), "second"])
        .assert()
        .success();

    assert!(dir.path().join("first/README").is_file());
    assert!(dir.path().join("second/README").is_file());
    // Still exactly one mirror directory for the URL.
    let mirrors = std::fs::read_dir(dir.path().join("reference"))
        .unwrap()
        .filter(|entry| entry.as_ref().unwrap().file_type().unwrap().is_dir())
        .count();
    assert_eq!(mirrors, 1);
}

#[test]
fn rejects_a_non_empty_destination() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "origin");
    let dest = dir.path().join("taken");
    std::fs::create_dir(&dest).unwrap();
    std::fs::write(dest.join("occupied"), "x").unwrap();

    fastclone_in(dir.path())
        .args([url.as_str(), "taken"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn checks_out_the_requested_branch() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "origin");
    let repo = dir.path().join("origin");
    git(&["-C", repo.to_str().unwrap(), "checkout", "-q", "-b", "feature"]);
    std::fs::write(repo.join("feature.txt"), "feature\n").unwrap();
    commit_all(&repo, "feature work");
    git(&["-C", repo.to_str().unwrap(), "checkout", "-q", "main"]);

    fastclone_in(dir.path())
        .args(["-b", "feature", url.as_str(), "checkout"])
        .assert()
        .success();

    assert!(dir.path().join("checkout/feature.txt").is_file());
}

#[test]
fn fetches_submodules_recursively_and_records_their_urls() {
    let dir = tempfile::tempdir().unwrap();
    let inner_url = source_repo(dir.path(), "inner");
    let mid_url = source_repo(dir.path(), "mid");
    let parent_url = source_repo(dir.path(), "parent");

    let mid = dir.path().join("mid");
    git(&[
        "-C",
        mid.to_str().unwrap(),
        "-c",
        "protocol.file.allow=always",
        "submodule",
        "add",
        "-q",
        &inner_url,
        "inner",
    ]);
    commit_all(&mid, "add inner");

    let parent = dir.path().join("parent");
    for (url, path) in [(&mid_url, "mid"), (&inner_url, "straight")] {
        git(&[
            "-C",
            parent.to_str().unwrap(),
            "-c",
            "protocol.file.allow=always",
            "submodule",
            "add",
            "-q",
            url,
            path,
        ]);
    }
    commit_all(&parent, "add submodules");

    fastclone_in(dir.path())
        .args([parent_url.as_str(), "checkout"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Updating submodule"));

    let dest = dir.path().join("checkout");
    assert!(dest.join("mid/README").is_file());
    assert!(dest.join("mid/inner/README").is_file());
    assert!(dest.join("straight/README").is_file());

    // Every submodule got its own mirror.
    assert!(mirror_for(dir.path(), &mid_url).is_dir());
    assert!(mirror_for(dir.path(), &inner_url).is_dir());

    // The parent mirror remembers its direct submodule URLs for prefetch.
    let sep = if cfg!(windows) { "__" } else { ":" };
    let list = format!(
        "{}{sep}submodules",
        mirror_for(dir.path(), &parent_url).display()
    );
    let listed = std::fs::read_to_string(list).unwrap();
    assert!(listed.contains(&mid_url));
    assert!(listed.contains(&inner_url));
}

#[test]
fn sparse_mode_materialises_only_the_requested_paths() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "origin");
    let repo = dir.path().join("origin");
    for name in ["wanted", "unwanted"] {
        std::fs::create_dir(repo.join(name)).unwrap();
        std::fs::write(repo.join(name).join("file"), name).unwrap();
    }
    commit_all(&repo, "add trees");

    fastclone_in(dir.path())
        .args(["--sparse-paths", "wanted", "-b", "main", url.as_str(), "checkout"])
        .assert()
        .success();

    let dest = dir.path().join("checkout");
    assert!(dest.join("wanted/file").is_file());
    assert!(!dest.join("unwanted").exists());
}

#[test]
#[cfg(unix)]
fn pre_clone_hook_runs_before_the_first_mirror_clone() {
    let dir = tempfile::tempdir().unwrap();
    let url = source_repo(dir.path(), "origin");

    let log = dir.path().join("hook.log");
    let hook = dir.path().join("hook.sh");
    std::fs::write(&hook, format!("#!/bin/sh\necho \"$1 $2 $3\" >> {}\n", log.display())).unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fastclone_in(dir.path())
        .args(["--pre-clone-hook", hook.to_str().unwrap(), url.as_str(), "checkout"])
        .assert()
        .success();

    let logged = std::fs::read_to_string(&log).unwrap();
    let mirror = mirror_for(dir.path(), &url);
    assert_eq!(logged, format!("{url} {} 0\n", mirror.display()));

    // Second run: the mirror exists, so the hook must not fire again.
    fastclone_in(dir.path())
        .args(["--pre-clone-hook", hook.to_str().unwrap(), url.as_str(), "second"])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&log).unwrap(), logged);
}

#[test]
fn failing_clone_propagates_a_non_zero_exit() {
    let dir = tempfile::tempdir().unwrap();

    fastclone_in(dir.path())
        .args(["/does/not/exist/repo.git", "checkout"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("git-fastclone:"));
}
