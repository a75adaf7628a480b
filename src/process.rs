use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::posix;

/// Exit status of a process.
///
/// This is an opaque type wrapping the raw status reported by `waitpid()`. Use the
/// provided methods to query it.
#[derive(Eq, PartialEq, Hash, Copy, Clone)]
pub struct ExitStatus(pub(crate) Option<i32>);

impl ExitStatus {
    pub(crate) fn from_raw(raw: i32) -> ExitStatus {
        ExitStatus(Some(raw))
    }

    /// True if the exit status of the process is 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// Returns the exit code if the process exited voluntarily, i.e. was not killed by a
    /// signal.
    pub fn code(&self) -> Option<u32> {
        let raw = self.0?;
        libc::WIFEXITED(raw).then(|| libc::WEXITSTATUS(raw) as u32)
    }

    /// Returns the signal number if the process was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        let raw = self.0?;
        libc::WIFSIGNALED(raw).then(|| libc::WTERMSIG(raw))
    }

    /// True if the subprocess was killed by a signal with the specified number.
    pub fn is_killed_by(&self, signum: i32) -> bool {
        self.signal() == Some(signum)
    }

    /// The status as a shell would report it in `$?`.
    ///
    /// A normal exit yields its code, death by signal `n` yields `128 + n`, and an
    /// undetermined status yields -1.
    pub fn shell_code(&self) -> i32 {
        match (self.code(), self.signal()) {
            (Some(code), _) => code as i32,
            (None, Some(sig)) => 128 + sig,
            (None, None) => -1,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(raw) if libc::WIFEXITED(raw) => {
                write!(f, "exit code {}", libc::WEXITSTATUS(raw))
            }
            Some(raw) if libc::WIFSIGNALED(raw) => {
                write!(f, "signal {}", libc::WTERMSIG(raw))
            }
            Some(raw) => write!(f, "unrecognized wait status: {} {:#x}", raw, raw),
            None => write!(f, "undetermined exit status"),
        }
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(raw) if libc::WIFEXITED(raw) => {
                write!(f, "ExitStatus(Exited({}))", libc::WEXITSTATUS(raw))
            }
            Some(raw) if libc::WIFSIGNALED(raw) => {
                write!(f, "ExitStatus(Signal({}))", libc::WTERMSIG(raw))
            }
            Some(raw) => write!(f, "ExitStatus(Unknown({} {:#x}))", raw, raw),
            None => write!(f, "ExitStatus(Undetermined)"),
        }
    }
}

/// A handle to one running or finished child process.
///
/// `Process` is cheaply cloneable and all methods take `&self`. Clones share the same
/// underlying state, so a status reaped through one clone is visible to all of them,
/// and one thread may signal a process while another is blocked in [`wait`].
///
/// # Drop behavior
///
/// When the last clone is dropped, it waits for the child to finish. `Process` owns no
/// pipes, so whoever holds the child's stdin must close it first; [`Job`] takes care of
/// that.
///
/// [`wait`]: Self::wait
/// [`Job`]: crate::Job
#[derive(Clone)]
pub struct Process(Arc<InnerProcess>);

struct InnerProcess {
    pid: u32,
    state: Mutex<ProcessState>,
}

#[derive(Debug)]
enum ProcessState {
    Running,
    Finished(ExitStatus),
}

impl Process {
    pub(crate) fn new(pid: u32) -> Process {
        Process(Arc::new(InnerProcess {
            pid,
            state: Mutex::new(ProcessState::Running),
        }))
    }

    /// Returns the PID of the subprocess.
    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// Returns the exit status, if the process is known to have finished.
    ///
    /// This does not perform any system calls.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        match *self.0.state() {
            ProcessState::Finished(status) => Some(status),
            ProcessState::Running => None,
        }
    }

    /// Check whether the process has finished, without blocking.
    pub fn poll(&self) -> Option<ExitStatus> {
        let mut state = self.0.state();
        InnerProcess::reap_into(&mut state, self.0.pid).ok()?;
        match *state {
            ProcessState::Finished(status) => Some(status),
            ProcessState::Running => None,
        }
    }

    /// Wait for the process to finish and return its exit status.
    ///
    /// The state lock is not held while blocking, so other clones can still signal the
    /// process.
    pub fn wait(&self) -> io::Result<ExitStatus> {
        loop {
            if let Some(status) = self.exit_status() {
                return Ok(status);
            }
            match posix::wait_exited(self.0.pid) {
                Ok(()) => {}
                // reaped by another clone in the meantime, or by foreign code
                Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {}
                Err(e) => return Err(e),
            }
            let mut state = self.0.state();
            InnerProcess::reap_into(&mut state, self.0.pid)?;
        }
    }

    /// Wait for the process to finish, timing out after the specified duration.
    ///
    /// Returns `Ok(None)` if the timeout elapsed before the process finished.
    pub fn wait_timeout(&self, dur: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + dur;
        let mut delay = Duration::from_millis(1);
        loop {
            {
                let mut state = self.0.state();
                InnerProcess::reap_into(&mut state, self.0.pid)?;
                if let ProcessState::Finished(status) = *state {
                    return Ok(Some(status));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(Duration::from_millis(50));
        }
    }

    /// Terminate the subprocess by sending it `SIGTERM`.
    ///
    /// Does nothing if the process is known to have finished.
    pub fn terminate(&self) -> io::Result<()> {
        self.send_signal(posix::SIGTERM)
    }

    /// Kill the subprocess by sending it `SIGKILL`.
    ///
    /// Does nothing if the process is known to have finished.
    pub fn kill(&self) -> io::Result<()> {
        self.send_signal(posix::SIGKILL)
    }

    /// Send the specified signal to the child process.
    pub fn send_signal(&self, signal: i32) -> io::Result<()> {
        let state = self.0.state();
        match *state {
            ProcessState::Finished(_) => Ok(()),
            ProcessState::Running => posix::kill(self.0.pid, signal),
        }
    }
}

impl InnerProcess {
    fn state(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reap_into(state: &mut ProcessState, pid: u32) -> io::Result<()> {
        if matches!(*state, ProcessState::Finished(_)) {
            return Ok(());
        }
        match posix::waitpid(pid, posix::WNOHANG) {
            Ok((pid_out, raw)) if pid_out == pid => {
                *state = ProcessState::Finished(ExitStatus::from_raw(raw));
            }
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {
                // Someone else waited for the child, its exit status is gone.
                *state = ProcessState::Finished(ExitStatus(None));
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

impl Drop for InnerProcess {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, ProcessState::Running) {
            let _ = posix::wait_exited(self.pid);
            let _ = InnerProcess::reap_into(state, self.pid);
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state();
        f.debug_struct("Process")
            .field("pid", &self.0.pid)
            .field("state", &*state)
            .finish()
    }
}
