use std::fmt;
use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::Result;
use crate::observe::Stream;
use crate::outcome::{ExitPolicy, Outcome, StageResult, StageStatus};
use crate::posix;
use crate::process::{ExitStatus, Process};

/// A stage whose process is running, along with the threads draining its output.
pub(crate) struct RunningStage {
    pub command: Command,
    pub process: Process,
    pub stdout: Option<JoinHandle<Vec<u8>>>,
    pub capture_stdout: bool,
    pub stderr: Option<JoinHandle<Vec<u8>>>,
    pub capture_stderr: bool,
}

/// Cancels a started pipeline from any thread.
///
/// Obtained from [`Job::cancel_handle`]. Cancelling sends `SIGTERM` to every stage that
/// is still running (to the whole process group for pipelines started with
/// [`Pipeline::new_process_group`](crate::Pipeline::new_process_group)), wakes up all
/// output drains, and sends `SIGKILL` to whatever is still alive once the grace period
/// has passed. [`Job::wait`] then returns [`Error::Cancelled`](crate::Error::Cancelled)
/// with the output captured so far.
#[derive(Clone)]
pub struct CancelHandle(Arc<CancelState>);

struct CancelState {
    interrupted: AtomicBool,
    cancelled: AtomicBool,
    timed_out: AtomicBool,
    // Closing the write end of the cancellation pipe wakes every drain.
    trigger: Mutex<Option<File>>,
    stages: Mutex<Vec<Tracked>>,
    group: bool,
    grace: Duration,
}

struct Tracked {
    process: Process,
    terminated: bool,
}

impl CancelHandle {
    pub(crate) fn new(trigger: File, group: bool, grace: Duration) -> CancelHandle {
        CancelHandle(Arc::new(CancelState {
            interrupted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            trigger: Mutex::new(Some(trigger)),
            stages: Mutex::new(vec![]),
            group,
            grace,
        }))
    }

    pub(crate) fn track(&self, process: Process) {
        self.0.stages().push(Tracked {
            process,
            terminated: false,
        });
    }

    /// Cancel the pipeline. Calling this more than once has no further effect.
    pub fn cancel(&self) -> io::Result<()> {
        self.interrupt(&self.0.cancelled)
    }

    pub(crate) fn time_out(&self) -> io::Result<()> {
        self.interrupt(&self.0.timed_out)
    }

    /// True once the pipeline has been cancelled, explicitly or by its timeout.
    pub fn is_cancelled(&self) -> bool {
        self.0.interrupted.load(Ordering::SeqCst)
    }

    // Interrupting a pipeline with nothing left running records nothing, so a job that
    // finished on its own keeps its result.
    fn interrupt(&self, reason: &AtomicBool) -> io::Result<()> {
        let running: Vec<Process> = {
            let mut stages = self.0.stages();
            if self.0.interrupted.load(Ordering::SeqCst) {
                return Ok(());
            }
            let running: Vec<Process> = stages
                .iter()
                .filter(|t| t.process.poll().is_none())
                .map(|t| t.process.clone())
                .collect();
            if running.is_empty() {
                debug!("pipeline already finished, nothing to cancel");
                return Ok(());
            }
            for t in stages.iter_mut() {
                t.terminated = running.iter().any(|p| p.pid() == t.process.pid());
            }
            self.0.interrupted.store(true, Ordering::SeqCst);
            reason.store(true, Ordering::SeqCst);
            running
        };
        drop(self.0.trigger.lock().unwrap_or_else(PoisonError::into_inner).take());
        info!(
            running = running.len(),
            timeout = self.0.timed_out.load(Ordering::SeqCst),
            "cancelling pipeline"
        );

        let pgid = self.group_id();
        let signalled = match pgid {
            Some(pgid) => signal_group(pgid, posix::SIGTERM),
            None => running.iter().try_for_each(Process::terminate),
        };

        let grace = self.0.grace;
        thread::Builder::new()
            .name("pipecall-cancel".into())
            .spawn(move || escalate(running, pgid, grace))?;
        signalled
    }

    fn group_id(&self) -> Option<u32> {
        if !self.0.group {
            return None;
        }
        self.0.stages().first().map(|t| t.process.pid())
    }

    fn was_terminated(&self, idx: usize) -> bool {
        self.0.stages().get(idx).is_some_and(|t| t.terminated)
    }
}

impl CancelState {
    fn stages(&self) -> MutexGuard<'_, Vec<Tracked>> {
        self.stages.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn signal_group(pgid: u32, signal: i32) -> io::Result<()> {
    match posix::killpg(pgid, signal) {
        // the whole group is already gone
        Err(e) if e.raw_os_error() == Some(posix::ESRCH) => Ok(()),
        other => other,
    }
}

// Give terminated processes the grace period to exit, then kill the survivors.
fn escalate(running: Vec<Process>, pgid: Option<u32>, grace: Duration) {
    let deadline = Instant::now() + grace;
    let mut survivors = vec![];
    for p in &running {
        let left = deadline.saturating_duration_since(Instant::now());
        match p.wait_timeout(left) {
            Ok(Some(_)) => {}
            Ok(None) => survivors.push(p),
            Err(e) => warn!(pid = p.pid(), error = %e, "waiting for terminated process failed"),
        }
    }
    if survivors.is_empty() {
        return;
    }
    warn!(
        pids = ?survivors.iter().map(|p| p.pid()).collect::<Vec<_>>(),
        ?grace,
        "processes survived SIGTERM, sending SIGKILL"
    );
    let killed = match pgid {
        Some(pgid) => signal_group(pgid, posix::SIGKILL),
        None => survivors.iter().try_for_each(|p| p.kill()),
    };
    if let Err(e) = killed {
        warn!(error = %e, "SIGKILL failed");
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .field("group", &self.0.group)
            .field("grace", &self.0.grace)
            .finish()
    }
}

struct Timer {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

/// A started command or pipeline.
///
/// Created by [`Pipeline::start`](crate::Pipeline::start) or
/// [`Command::start`](crate::Command::start). All processes are already running and
/// their output is being drained on background threads; [`wait`](Self::wait) collects
/// the [`Outcome`].
///
/// When dropped without being waited for, waits for all processes to finish.
pub struct Job {
    stages: Vec<RunningStage>,
    feeder: Option<JoinHandle<()>>,
    handle: CancelHandle,
    policy: ExitPolicy,
    check: bool,
    timer: Option<Timer>,
}

impl Job {
    pub(crate) fn new(handle: CancelHandle, policy: ExitPolicy, check: bool) -> Job {
        Job {
            stages: vec![],
            feeder: None,
            handle,
            policy,
            check,
            timer: None,
        }
    }

    pub(crate) fn push_stage(&mut self, command: Command, process: Process) {
        self.handle.track(process.clone());
        self.stages.push(RunningStage {
            command,
            process,
            stdout: None,
            capture_stdout: false,
            stderr: None,
            capture_stderr: false,
        });
    }

    /// Attach a drain thread to the most recently pushed stage.
    pub(crate) fn attach_drain(
        &mut self,
        stream: Stream,
        drain: JoinHandle<Vec<u8>>,
        capture: bool,
    ) {
        let Some(stage) = self.stages.last_mut() else {
            return;
        };
        match stream {
            Stream::Stdout => {
                stage.stdout = Some(drain);
                stage.capture_stdout = capture;
            }
            Stream::Stderr => {
                stage.stderr = Some(drain);
                stage.capture_stderr = capture;
            }
        }
    }

    pub(crate) fn set_feeder(&mut self, feeder: JoinHandle<()>) {
        self.feeder = Some(feeder);
    }

    pub(crate) fn start_timer(&mut self, timeout: Duration) -> io::Result<()> {
        let (stop, expired) = mpsc::channel::<()>();
        let handle = self.handle.clone();
        let thread = thread::Builder::new()
            .name("pipecall-timeout".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = expired.recv_timeout(timeout) {
                    info!(?timeout, "pipeline timed out");
                    if let Err(e) = handle.time_out() {
                        warn!(error = %e, "cancelling timed out pipeline failed");
                    }
                }
            })?;
        self.timer = Some(Timer { stop, thread });
        Ok(())
    }

    /// Kill everything started so far and wait for it. Used when a later stage fails to
    /// start.
    pub(crate) fn abort(mut self) {
        drop(
            self.handle
                .0
                .trigger
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        for stage in &self.stages {
            if let Err(e) = stage.process.kill() {
                let pid = stage.process.pid();
                warn!(pid, error = %e, "killing partially started pipeline failed");
            }
            if let Err(e) = stage.process.wait() {
                let pid = stage.process.pid();
                warn!(pid, error = %e, "waiting for aborted process failed");
            }
        }
        for (idx, stage) in std::mem::take(&mut self.stages).into_iter().enumerate() {
            for drain in [stage.stdout, stage.stderr].into_iter().flatten() {
                if drain.join().is_err() {
                    warn!(stage = idx, "drain thread panicked");
                }
            }
        }
        if let Some(feeder) = self.feeder.take() {
            if feeder.join().is_err() {
                warn!("stdin feeder thread panicked");
            }
        }
    }

    /// Returns the PIDs of all processes, in pipeline order.
    pub fn pids(&self) -> Vec<u32> {
        self.stages.iter().map(|s| s.process.pid()).collect()
    }

    /// Returns the PID of the last process, or `None` for an empty pipeline.
    pub fn pid(&self) -> Option<u32> {
        self.stages.last().map(|s| s.process.pid())
    }

    /// The processes of the pipeline, in pipeline order.
    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.stages.iter().map(|s| &s.process)
    }

    /// Poll all processes for completion without blocking.
    ///
    /// Returns `Some(exit_status)` of the last process if all processes have finished,
    /// or `None` if any process is still running. An empty pipeline is always finished.
    pub fn poll(&self) -> Option<ExitStatus> {
        let mut status = Some(ExitStatus::from_raw(0));
        for s in &self.stages {
            status = Some(s.process.poll()?);
        }
        status
    }

    /// A handle that can cancel this job from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Cancel the job; see [`CancelHandle::cancel`].
    pub fn cancel(&self) -> io::Result<()> {
        self.handle.cancel()
    }

    /// Send `SIGTERM` to all processes, without cancelling the job.
    ///
    /// Already reaped processes are silently skipped.
    pub fn terminate(&self) -> io::Result<()> {
        for s in &self.stages {
            s.process.terminate()?;
        }
        Ok(())
    }

    /// Send `SIGKILL` to all processes, without cancelling the job.
    pub fn kill(&self) -> io::Result<()> {
        for s in &self.stages {
            s.process.kill()?;
        }
        Ok(())
    }

    /// Wait for all processes to exit and all output to be drained.
    ///
    /// In strict mode a cancelled, broken or failed pipeline is returned as the matching
    /// [`Error`](crate::Error) variant; in relaxed mode only cancellation and timeout
    /// are errors. Either way the [`Outcome`] holds everything captured.
    pub fn wait(mut self) -> Result<Outcome> {
        let mut statuses = Vec::with_capacity(self.stages.len());
        for s in &self.stages {
            statuses.push(s.process.wait()?);
        }
        if let Some(feeder) = self.feeder.take() {
            if feeder.join().is_err() {
                warn!("stdin feeder thread panicked");
            }
        }

        let stages = std::mem::take(&mut self.stages);
        let mut results = Vec::with_capacity(stages.len());
        for (idx, (stage, status)) in stages.into_iter().zip(statuses).enumerate() {
            let stdout = collect(stage.stdout, stage.capture_stdout, idx, Stream::Stdout);
            let stderr = collect(stage.stderr, stage.capture_stderr, idx, Stream::Stderr);
            let status = if self.handle.was_terminated(idx) {
                StageStatus::Terminated(status)
            } else {
                StageStatus::Exited(status)
            };
            results.push(StageResult {
                command: stage.command,
                status,
                stdout,
                stderr,
            });
        }

        if let Some(timer) = self.timer.take() {
            drop(timer.stop);
            let _ = timer.thread.join();
        }
        let state = &self.handle.0;
        let outcome = Outcome::new(
            results,
            self.policy,
            state.cancelled.load(Ordering::SeqCst),
            state.timed_out.load(Ordering::SeqCst),
        );
        debug!(code = outcome.code(), stages = outcome.stages().len(), "pipeline finished");
        if self.check {
            outcome.check()
        } else {
            outcome.check_interrupted()
        }
    }

    /// Like [`wait`](Self::wait), but yields to the async runtime instead of blocking.
    #[cfg(feature = "tokio")]
    pub async fn wait_async(self) -> Result<Outcome> {
        tokio::task::spawn_blocking(move || self.wait())
            .await
            .map_err(|e| crate::Error::Io(io::Error::other(e)))?
    }
}

fn collect(
    drain: Option<JoinHandle<Vec<u8>>>,
    captured: bool,
    stage: usize,
    stream: Stream,
) -> Option<Vec<u8>> {
    let data = match drain?.join() {
        Ok(data) => data,
        Err(_) => {
            warn!(stage, %stream, "drain thread panicked, output lost");
            vec![]
        }
    };
    captured.then_some(data)
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cmds: Vec<String> = self
            .stages
            .iter()
            .map(|s| s.command.to_cmdline_lossy())
            .collect();
        f.debug_struct("Job")
            .field("pipeline", &cmds.join(" | "))
            .field("pids", &self.pids())
            .field("check", &self.check)
            .field("policy", &self.policy)
            .finish()
    }
}
