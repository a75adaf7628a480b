use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, debug_span, trace, warn};

use crate::observe::{Observer, Origin};
use crate::posix;

pub(crate) const CHUNK_SIZE: usize = 4096;

/// Everything a drain thread does with the stream it reads.
pub(crate) struct Drain {
    pub origin: Origin,
    pub source: File,
    pub capture: bool,
    /// Stdin of the next stage, when this stream is a tee point.
    pub forward: Option<File>,
    /// A file or parent stream that also receives the output.
    pub extra: Option<Box<dyn Write + Send>>,
    pub observers: Vec<Box<dyn Observer>>,
}

impl Drain {
    /// Start the drain on its own thread.
    ///
    /// The thread returns the captured bytes, which are empty unless `capture` is set.
    /// It exits at EOF of the source, or soon after `cancel` reports hangup.
    pub fn spawn(self, cancel: Arc<File>) -> io::Result<JoinHandle<Vec<u8>>> {
        let name = format!("pipecall-{}-{}", self.origin.stream, self.origin.stage);
        thread::Builder::new()
            .name(name)
            .spawn(move || self.run(&cancel))
    }

    fn run(mut self, cancel: &File) -> Vec<u8> {
        let span = debug_span!("drain", stage = self.origin.stage, stream = %self.origin.stream);
        let _entered = span.enter();
        let mut captured = vec![];
        let mut buf = [0u8; CHUNK_SIZE];
        let mut cancelled = false;
        let mut total = 0usize;
        loop {
            if !cancelled {
                match wait_readable(&self.source, cancel) {
                    Ok(Readiness::Source) => {}
                    Ok(Readiness::Cancelled) => cancelled = true,
                    Err(e) => {
                        warn!(error = %e, "poll failed, stopping drain");
                        break;
                    }
                }
            }
            if cancelled && !source_ready_now(&self.source) {
                // collect what was already written, but don't wait for more
                break;
            }
            let n = match self.source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "read failed, stopping drain");
                    break;
                }
            };
            total += n;
            trace!(bytes = n, total, "chunk");
            self.deliver(&buf[..n], &mut captured);
        }
        // closing the forward pipe gives the next stage its EOF
        drop(self.forward.take());
        for obs in &mut self.observers {
            obs.eof(self.origin);
        }
        if let Some(extra) = &mut self.extra {
            let _ = extra.flush();
        }
        captured
    }

    fn deliver(&mut self, chunk: &[u8], captured: &mut Vec<u8>) {
        if self.capture {
            captured.extend_from_slice(chunk);
        }
        if let Some(next) = &mut self.forward {
            match next.write_all(chunk) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                    debug!("next stage closed its stdin");
                    self.forward = None;
                }
                Err(e) => {
                    warn!(error = %e, "forwarding to next stage failed");
                    self.forward = None;
                }
            }
        }
        if let Some(extra) = &mut self.extra {
            if let Err(e) = extra.write_all(chunk) {
                warn!(error = %e, "output destination failed");
                self.extra = None;
            }
        }
        for obs in &mut self.observers {
            obs.chunk(self.origin, chunk);
        }
    }
}

enum Readiness {
    Source,
    Cancelled,
}

fn wait_readable(source: &File, cancel: &File) -> io::Result<Readiness> {
    loop {
        let mut fds = [
            posix::PollFd::new(Some(source), posix::POLLIN),
            posix::PollFd::new(Some(cancel), posix::POLLIN),
        ];
        posix::poll(&mut fds, None)?;
        // hangup and errors on the source are reported by the following read()
        if fds[0].test(posix::POLLIN | posix::POLLHUP | posix::POLLERR | posix::POLLNVAL) {
            return Ok(Readiness::Source);
        }
        if fds[1].test(posix::POLLIN | posix::POLLHUP | posix::POLLERR) {
            return Ok(Readiness::Cancelled);
        }
    }
}

fn source_ready_now(source: &File) -> bool {
    let mut fds = [posix::PollFd::new(Some(source), posix::POLLIN)];
    match posix::poll(&mut fds, Some(Duration::ZERO)) {
        Ok(_) => fds[0].test(posix::POLLIN | posix::POLLHUP),
        Err(_) => false,
    }
}

/// Write `data` into a child's stdin on its own thread, then close the pipe.
pub(crate) fn spawn_feeder(
    stage: usize,
    data: Arc<[u8]>,
    mut stdin: File,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pipecall-stdin-{stage}"))
        .spawn(move || match stdin.write_all(&data) {
            Ok(()) => trace!(stage, bytes = data.len(), "stdin fed"),
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                debug!(stage, "process exited before reading all of its input");
            }
            Err(e) => warn!(stage, error = %e, "writing stdin failed"),
        })
}
