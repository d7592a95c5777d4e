//! Shell-free subprocess execution.
//!
//! Commands are always spawned from an argument vector handed to the OS
//! directly, so shell metacharacters in URLs or paths are inert. stdout and
//! stderr are drained concurrently into one combined buffer; the buffer is
//! what failure classification runs against.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{bail, Context as _, Result};
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::ExecutionError;

#[derive(Builder)]
pub struct Subprocess {
    /// Argument vector; the first element is the executable.
    args: Vec<String>,
    #[builder(default)]
    current_dir: Option<Utf8PathBuf>,
    /// Extra environment entries for the child.
    #[builder(default)]
    env: Vec<(String, String)>,
    /// Variables withheld from the child's inherited environment.
    #[builder(default)]
    scrub_env: Vec<String>,
    /// Payload written to the child's stdin.
    #[builder(default)]
    stdin: Option<String>,
    /// When false, captured output is also mirrored to the parent's stdout
    /// as it arrives.
    #[builder(default = "true")]
    quiet: bool,
    /// Dump the captured output to stderr when the command finally fails.
    #[builder(default)]
    print_on_failure: bool,
    /// Immediate re-spawns allowed after a non-zero exit.
    #[builder(default)]
    retries: u32,
}

impl SubprocessBuilder {
    pub fn run(&self) -> Result<String> {
        self.build()
            .expect("Subprocess builder correctly set up")
            .run()
    }
}

/// Builder seeded with `git` followed by `args`.
pub fn git<I, S>(args: I) -> SubprocessBuilder
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut argv = vec!["git".to_string()];
    argv.extend(args.into_iter().map(Into::into));
    let mut builder = SubprocessBuilder::default();
    builder.args(argv);
    builder
}

impl Subprocess {
    /// Run the command, returning its combined stdout+stderr on exit code 0.
    ///
    /// A non-zero exit becomes an [`ExecutionError`] carrying the raw wait
    /// status, the argv and the captured output. With `retries > 0` the same
    /// command is re-spawned immediately, up to that many additional times.
    pub fn run(&self) -> Result<String> {
        if self.args.is_empty() {
            bail!("cannot spawn an empty argument vector");
        }

        let mut remaining = self.retries;
        loop {
            match self.spawn_once() {
                Ok(output) => return Ok(output),
                Err(err) if remaining > 0 && err.is::<ExecutionError>() => {
                    debug!("retrying `{}`: {err}", self.args.join(" "));
                    remaining -= 1;
                }
                Err(err) => {
                    if self.print_on_failure {
                        if let Some(exec) = err.downcast_ref::<ExecutionError>() {
                            eprint!("{}", exec.output);
                        }
                    }
                    return Err(err);
                }
            }
        }
    }

    fn spawn_once(&self) -> Result<String> {
        let (program, rest) = self
            .args
            .split_first()
            .context("cannot spawn an empty argument vector")?;

        let mut command = Command::new(program);
        command.args(rest);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        for name in &self.scrub_env {
            command.env_remove(name);
        }
        for (name, value) in &self.env {
            command.env(name, value);
        }
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        debug!("spawning `{}`", self.args.join(" "));
        let child = command
            .spawn()
            .with_context(|| format!("spawning `{program}`"))?;

        // Reap the child if capture bails out below.
        let mut child = scopeguard::guard(child, |mut child| {
            let _ = child.kill();
            let _ = child.wait();
        });

        let mut stdin_writer = None;
        if let Some(payload) = &self.stdin {
            let mut pipe = child.stdin.take().context("child stdin not piped")?;
            let payload = payload.clone();
            stdin_writer = Some(thread::spawn(move || {
                let _ = pipe.write_all(payload.as_bytes());
            }));
        }

        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let buffer = Mutex::new(String::new());
        thread::scope(|scope| {
            scope.spawn(|| drain(stdout, &buffer, self.quiet));
            scope.spawn(|| drain(stderr, &buffer, self.quiet));
        });
        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }

        let status = scopeguard::ScopeGuard::into_inner(child)
            .wait()
            .with_context(|| format!("waiting for `{program}`"))?;
        let output = buffer.into_inner();

        if status.success() {
            Ok(output)
        } else {
            Err(ExecutionError {
                status,
                args: self.args.clone(),
                output,
            }
            .into())
        }
    }
}

fn drain(mut stream: impl Read, buffer: &Mutex<String>, quiet: bool) {
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]);
                if !quiet {
                    let mut stdout = std::io::stdout();
                    let _ = stdout.write_all(text.as_bytes());
                    let _ = stdout.flush();
                }
                buffer.lock().push_str(&text);
            }
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("script.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn captures_stdout() {
        let output = git(["version"]).run().unwrap();
        assert!(output.starts_with("git version"));
    }

    #[test]
    #[cfg(unix)]
    fn combines_both_streams() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "echo out\necho err 1>&2");

        let mut builder = SubprocessBuilder::default();
        builder.args(vec![cmd]);
        let output = builder.run().unwrap();

        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
    }

    #[test]
    #[cfg(unix)]
    fn non_zero_exit_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "echo broken\nexit 3");

        let mut builder = SubprocessBuilder::default();
        builder.args(vec![cmd.clone()]);
        let err = builder.run().unwrap_err();

        let exec = err.downcast_ref::<ExecutionError>().unwrap();
        assert_eq!(exec.status.code(), Some(3));
        assert_eq!(exec.args, vec![cmd]);
        assert_eq!(exec.output, "broken\n");
    }

    #[test]
    fn empty_argv_is_rejected() {
        let mut builder = SubprocessBuilder::default();
        builder.args(Vec::new());
        assert!(builder.run().is_err());
    }

    #[test]
    #[cfg(unix)]
    fn retries_rerun_the_command() {
        let dir = tempfile::tempdir().unwrap();
        // Fails on the first spawn, succeeds on the second.
        let cmd = script(
            dir.path(),
            "if [ -e marker ]; then echo ok; else touch marker; exit 1; fi",
        );

        let mut builder = SubprocessBuilder::default();
        builder
            .args(vec![cmd])
            .current_dir(Some(Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()))
            .retries(1);

        assert_eq!(builder.run().unwrap(), "ok\n");
    }

    #[test]
    #[cfg(unix)]
    fn stdin_payload_reaches_the_child() {
        let mut builder = SubprocessBuilder::default();
        builder
            .args(vec!["cat".to_string()])
            .stdin(Some("over stdin".to_string()));

        assert_eq!(builder.run().unwrap(), "over stdin");
    }

    #[test]
    #[cfg(unix)]
    fn env_overlay_and_scrub() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "echo \"${FASTCLONE_TEST_A:-unset}:${FASTCLONE_TEST_B:-unset}\"");

        std::env::set_var("FASTCLONE_TEST_B", "inherited");
        let mut builder = SubprocessBuilder::default();
        builder
            .args(vec![cmd])
            .env(vec![("FASTCLONE_TEST_A".to_string(), "overlay".to_string())])
            .scrub_env(vec!["FASTCLONE_TEST_B".to_string()]);

        assert_eq!(builder.run().unwrap(), "overlay:unset\n");
    }
}
