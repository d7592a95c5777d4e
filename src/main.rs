use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{crate_version, Arg, ArgAction, ArgMatches, Command, ValueHint};
use console::style;
use git_fastclone::errors::ExecutionError;
use git_fastclone::{FastClone, ReferenceCacheBuilder};
use tracing_subscriber::EnvFilter;

/// Protocols the spawned git processes may follow, unless the operator
/// already constrained them.
const DEFAULT_ALLOWED_PROTOCOLS: &str = "file:git:http:https:ssh";

const USAGE_EXIT: u8 = 129;

fn clap() -> Command {
    Command::new("git-fastclone")
        .version(crate_version!())
        .about("git clone --recursive, accelerated by a reference mirror cache")
        .arg(
            Arg::new("url")
                .help("repository to clone; a remote URL or a local path")
                .value_hint(ValueHint::Url),
        )
        .arg(
            Arg::new("path")
                .help("checkout destination")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("branch")
                .short('b')
                .long("branch")
                .value_name("BRANCH")
                .help("check out BRANCH after cloning; required with --sparse-paths"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("live-stream subprocess output"),
        )
        .arg(
            Arg::new("print_git_errors")
                .long("print_git_errors")
                .action(ArgAction::SetTrue)
                .help("print captured git output when a command fails"),
        )
        .arg(
            Arg::new("color")
                .short('c')
                .long("color")
                .action(ArgAction::SetTrue)
                .help("colorize status lines"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("CONFIG")
                .help("extra --config passed to the outer clone"),
        )
        .arg(
            Arg::new("lock_timeout")
                .long("lock-timeout")
                .value_name("N")
                .default_value("0")
                .value_parser(clap::value_parser!(u64))
                .help("seconds to wait for a mirror lock; 0 waits forever"),
        )
        .arg(
            Arg::new("pre_clone_hook")
                .long("pre-clone-hook")
                .value_name("SCRIPT")
                .value_hint(ValueHint::FilePath)
                .help("executable run as SCRIPT URL MIRROR ATTEMPT before the first mirror clone"),
        )
        .arg(
            Arg::new("sparse_paths")
                .long("sparse-paths")
                .value_name("PATHS")
                .value_delimiter(',')
                .help("cone-mode sparse checkout restricted to the comma-separated paths"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("submodules fetched at the same time"),
        )
        .arg(
            Arg::new("reference_dir")
                .long("reference-dir")
                .value_name("DIR")
                .env("REFERENCE_REPO_DIR")
                .value_hint(ValueHint::DirPath)
                .help("reference mirror cache root"),
        )
}

fn main() -> ExitCode {
    let matches = clap().get_matches();

    let filter = if matches.get_flag("verbose") {
        EnvFilter::new("git_fastclone=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("git_fastclone=warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let color = matches.get_flag("color");

    let Some(url) = matches.get_one::<String>("url") else {
        eprintln!("usage: git-fastclone <url> [<path>] [options]");
        return ExitCode::from(USAGE_EXIT);
    };
    if matches.contains_id("sparse_paths") && !matches.contains_id("branch") {
        eprintln!("git-fastclone: --sparse-paths requires an explicit --branch");
        return ExitCode::from(USAGE_EXIT);
    }

    match run(&matches, url) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if color {
                eprintln!("{} {err:#}", style("git-fastclone:").red().bold());
            } else {
                eprintln!("git-fastclone: {err:#}");
            }
            exit_code_for(&err)
        }
    }
}

fn run(matches: &ArgMatches, url: &str) -> Result<()> {
    if std::env::var_os("GIT_ALLOW_PROTOCOL").is_none() {
        std::env::set_var("GIT_ALLOW_PROTOCOL", DEFAULT_ALLOWED_PROTOCOLS);
    }

    let lock_timeout = *matches.get_one::<u64>("lock_timeout").unwrap_or(&0);
    let cache = ReferenceCacheBuilder::default()
        .root(reference_dir(matches))
        .lock_timeout(Duration::from_secs(lock_timeout))
        .pre_clone_hook(matches.get_one::<String>("pre_clone_hook").cloned())
        .verbose(matches.get_flag("verbose"))
        .print_git_errors(matches.get_flag("print_git_errors"))
        .open()?;

    let mut cloner = FastClone::new(cache).cloner();
    cloner
        .repository_url(url)
        .revision(matches.get_one::<String>("branch").cloned())
        .target_path(matches.get_one::<Utf8PathBuf>("path").cloned())
        .clone_config(matches.get_one::<String>("config").cloned())
        .sparse_paths(
            matches
                .get_many::<String>("sparse_paths")
                .map(|paths| paths.cloned().collect()),
        )
        .verbose(matches.get_flag("verbose"))
        .print_git_errors(matches.get_flag("print_git_errors"))
        .color(matches.get_flag("color"))
        .jobs(matches.get_one::<usize>("jobs").copied());
    cloner.run()
}

fn reference_dir(matches: &ArgMatches) -> Utf8PathBuf {
    match matches.get_one::<String>("reference_dir") {
        Some(dir) => Utf8PathBuf::from(shellexpand::tilde(dir).into_owned()),
        None => Utf8PathBuf::from_path_buf(std::env::temp_dir())
            .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
            .join("git-fastclone")
            .join("reference"),
    }
}

/// Propagate the failing subprocess's exit code where one exists.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err
        .downcast_ref::<ExecutionError>()
        .and_then(|exec| exec.status.code())
    {
        Some(code) => {
            let code = (code & 0xff) as u8;
            if code == 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::from(code)
            }
        }
        None => ExitCode::FAILURE,
    }
}
