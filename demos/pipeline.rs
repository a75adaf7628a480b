//! Builds a few pipelines from the same base commands.
//!
//! Run with `PIPECALL_LOG=debug` to see every spawned process.

use std::time::Duration;

use pipecall::{Command, Error, call};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("PIPECALL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

fn main() -> pipecall::Result<()> {
    init_logging();

    let ls = Command::new("ls")?;
    let sort = Command::new("sort")?;
    let head = Command::new("head")?;

    // ls -a / | sort -r | head -n 3
    let newest = (ls.bind(&call!("/"; a = true))?
        | sort.bind(&call!(r = true))?
        | head.bind(&call!(n = 3))?)
    .run()?;
    info!(entries = ?newest.lines(), "last entries of /");

    // the failure of an earlier stage only counts with pipefail
    let grep = Command::new("grep")?.index(["-c", "pipecall"]);
    let relaxed = (ls.index(["/nonexistent"]).unchecked() | grep.clone()).unchecked().run()?;
    info!(code = relaxed.code(), "without pipefail");
    let strict = (ls.index(["/nonexistent"]) | grep).pipefail().unchecked().run()?;
    info!(code = strict.code(), failed_stage = ?strict.failed_stage(), "with pipefail");

    // a stuck pipeline is cancelled by its timeout, with partial output preserved
    let slow = Command::new("sh")?.index(["-c", "echo begun; sleep 30"]);
    match slow.pipe(Command::new("cat")?).timeout(Duration::from_millis(500)).run() {
        Err(Error::TimedOut(outcome)) => {
            info!(partial = %outcome, "timed out as expected");
        }
        other => info!(?other, "unexpected result"),
    }
    Ok(())
}
