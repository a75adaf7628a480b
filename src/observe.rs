//! Hooks for watching output as it streams by.
//!
//! An [`Observer`] attached to a stage sees every chunk that stage writes to the stream,
//! in order, while the chunk also continues to its regular destination. Observers run on
//! the drain thread of that stream, so a slow observer slows down only that stream.

use std::fmt;

use tracing::info;

/// One of the two output streams of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        })
    }
}

/// Identifies where a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    /// Index of the stage in its pipeline.
    pub stage: usize,
    pub stream: Stream,
}

/// A consumer of streamed output chunks.
pub trait Observer: Send {
    /// Called with each chunk read from the stream.
    fn chunk(&mut self, origin: Origin, data: &[u8]);

    /// Called once after the stream has been fully read.
    fn eof(&mut self, _origin: Origin) {}
}

struct FnObserver<F>(F);

impl<F: FnMut(Origin, &[u8]) + Send> Observer for FnObserver<F> {
    fn chunk(&mut self, origin: Origin, data: &[u8]) {
        (self.0)(origin, data)
    }
}

/// An observer that calls `f` with every raw chunk.
pub fn from_fn<F>(f: F) -> impl Observer
where
    F: FnMut(Origin, &[u8]) + Send,
{
    FnObserver(f)
}

/// Splits a stream into lines and calls `f` with each of them.
///
/// Lines are passed without the trailing newline and decoded lossily as UTF-8. A final
/// line without a newline is delivered at EOF.
pub struct Lines<F> {
    pending: Vec<u8>,
    f: F,
}

impl<F: FnMut(Origin, &str) + Send> Lines<F> {
    pub fn new(f: F) -> Lines<F> {
        Lines { pending: vec![], f }
    }

    fn emit(&mut self, origin: Origin, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        (self.f)(origin, &String::from_utf8_lossy(line));
    }
}

impl<F: FnMut(Origin, &str) + Send> Observer for Lines<F> {
    fn chunk(&mut self, origin: Origin, data: &[u8]) {
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.pending.is_empty() {
                self.emit(origin, &rest[..pos]);
            } else {
                let mut line = std::mem::take(&mut self.pending);
                line.extend_from_slice(&rest[..pos]);
                self.emit(origin, &line);
            }
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
    }

    fn eof(&mut self, origin: Origin) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.emit(origin, &line);
        }
    }
}

impl<F> fmt::Debug for Lines<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lines")
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Emits every output line as a `tracing` event.
///
/// Events are logged at `INFO` under the `pipecall::output` target, with `stage`,
/// `stream` and `program` fields, so the subscriber's formatting (timestamps included)
/// applies to child output the same way it applies to the host's own logs.
pub struct TraceLines {
    lines: Lines<Box<dyn FnMut(Origin, &str) + Send>>,
}

impl TraceLines {
    pub fn new(program: impl Into<String>) -> TraceLines {
        let program = program.into();
        TraceLines {
            lines: Lines::new(Box::new(move |origin: Origin, line: &str| {
                info!(
                    target: "pipecall::output",
                    stage = origin.stage,
                    stream = %origin.stream,
                    program = %program,
                    "{line}"
                );
            })),
        }
    }
}

impl Observer for TraceLines {
    fn chunk(&mut self, origin: Origin, data: &[u8]) {
        self.lines.chunk(origin, data)
    }

    fn eof(&mut self, origin: Origin) {
        self.lines.eof(origin)
    }
}

impl fmt::Debug for TraceLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLines").finish_non_exhaustive()
    }
}
