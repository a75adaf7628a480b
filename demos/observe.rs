//! Streams child output into the host's log while it is produced.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use pipecall::{Command, Lines, Origin, Stage};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> pipecall::Result<()> {
    let filter = EnvFilter::try_from_env("PIPECALL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let script = "for i in 1 2 3 4 5; do echo step $i; echo warning $i >&2; sleep 0.2; done";
    let producer = Stage::new(Command::new("sh")?.index(["-c", script])).trace_output();

    let counted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&counted);
    let consumer = Stage::new(Command::new("tr")?.index(["a-z", "A-Z"])).observe_stdout(
        Lines::new(move |origin: Origin, line: &str| {
            counter.fetch_add(1, Ordering::Relaxed);
            info!(stage = origin.stage, "consumer: {line}");
        }),
    );

    let outcome = (producer | consumer).run()?;
    info!(
        lines = counted.load(Ordering::Relaxed),
        stderr = %outcome.stages()[0].stderr().len(),
        "done"
    );
    println!("{outcome}");
    Ok(())
}
