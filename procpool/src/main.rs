//! Stock worker binary: serves the built-in task registry over
//! stdin/stdout.

#[macro_use]
extern crate log;

use commons::prelude_errors::*;
use procpool::executor::{run_loop, Registry};
use std::env;
use std::io;
use std::path::PathBuf;
use structopt::StructOpt;

/// Worker process options; the pool builds this argv when spawning.
#[derive(Debug, StructOpt)]
struct Options {
    /// Verbosity level
    #[structopt(short = "v", parse(from_occurrences))]
    verbosity: u8,

    /// Directory prepended to the task search path; repeatable
    #[structopt(long = "include", parse(from_os_str))]
    include: Vec<PathBuf>,
}

fn main() -> Fallible<()> {
    let options = Options::from_args();

    // stdout carries the frame protocol; logs go to stderr.
    env_logger::Builder::from_default_env()
        .filter(Some("procpool"), verbosity_level(options.verbosity))
        .init();
    debug!("worker options:\n{:#?}", &options);

    install_search_path(&options.include)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    run_loop(stdin.lock(), stdout.lock(), &Registry::with_builtins())
}

fn verbosity_level(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

/// Prepend the include directories to `PATH` so tasks that spawn helper
/// programs resolve them there first.
fn install_search_path(include: &[PathBuf]) -> Fallible<()> {
    if include.is_empty() {
        return Ok(());
    }
    let mut paths: Vec<PathBuf> = include.to_vec();
    if let Some(existing) = env::var_os("PATH") {
        paths.extend(env::split_paths(&existing));
    }
    let joined = env::join_paths(paths).context("joining worker search path")?;
    env::set_var("PATH", joined);
    Ok(())
}
