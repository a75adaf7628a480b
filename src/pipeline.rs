use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::command::{Command, StdinSource};
use crate::drain::{self, Drain};
use crate::environment::Environment;
use crate::error::{Error, Result};
use crate::job::{CancelHandle, Job};
use crate::observe::{Observer, Origin, Stream, TraceLines};
use crate::outcome::{ExitPolicy, Outcome};
use crate::posix;
use crate::spawn::{self, Redirection, SpawnOptions};

const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Where an output stream of a stage goes.
#[derive(Debug)]
pub enum Sink {
    /// Read into memory and made available in the [`Outcome`].
    Capture,
    /// Inherited from the parent process.
    Inherit,
    /// Discarded.
    Null,
    /// Written to an open file.
    File(File),
    /// Stderr only: sent wherever stdout goes, like `2>&1`.
    Merge,
}

impl Sink {
    /// A sink that truncates or creates the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Sink> {
        Ok(Sink::File(File::create(path)?))
    }

    /// A sink that appends to the file at `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> io::Result<Sink> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Sink::File(file))
    }
}

/// A command together with the plumbing of its output streams.
///
/// By default the last stage of a pipeline has its stdout captured, earlier stages pass
/// stdout straight to the next stage, and every stage's stderr is captured.
///
/// For a stage that is not the last one, an explicit stdout sink is an *additional*
/// destination: the output still flows to the next stage, and is also captured,
/// written to a file or shown on the parent's stdout. Attaching an observer works the
/// same way. Such a stage gets a drain thread that copies each chunk to every
/// destination; others are connected directly with an OS pipe.
#[must_use]
pub struct Stage {
    command: Command,
    stdout: Option<Sink>,
    stderr: Sink,
    stdout_observers: Vec<Box<dyn Observer>>,
    stderr_observers: Vec<Box<dyn Observer>>,
}

impl Stage {
    pub fn new(command: Command) -> Stage {
        Stage {
            command,
            stdout: None,
            stderr: Sink::Capture,
            stdout_observers: vec![],
            stderr_observers: vec![],
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Where stdout goes. `Sink::Merge` is not valid here.
    pub fn stdout(mut self, sink: Sink) -> Stage {
        self.stdout = Some(sink);
        self
    }

    /// Capture stdout, also for a stage in the middle of a pipeline.
    pub fn capture_stdout(self) -> Stage {
        self.stdout(Sink::Capture)
    }

    /// Where stderr goes.
    pub fn stderr(mut self, sink: Sink) -> Stage {
        self.stderr = sink;
        self
    }

    /// Show every chunk of stdout to `observer`, in addition to its destination.
    pub fn observe_stdout(mut self, observer: impl Observer + 'static) -> Stage {
        self.stdout_observers.push(Box::new(observer));
        self
    }

    /// Show every chunk of stderr to `observer`, in addition to its destination.
    pub fn observe_stderr(mut self, observer: impl Observer + 'static) -> Stage {
        self.stderr_observers.push(Box::new(observer));
        self
    }

    /// Log every line of output as a `tracing` event, see [`TraceLines`].
    pub fn trace_output(self) -> Stage {
        let program = self.command.get_program().to_string_lossy().into_owned();
        let stage = self.observe_stdout(TraceLines::new(program.clone()));
        if matches!(stage.stderr, Sink::Merge) {
            return stage;
        }
        stage.observe_stderr(TraceLines::new(program))
    }
}

impl From<Command> for Stage {
    fn from(command: Command) -> Stage {
        Stage::new(command)
    }
}

impl BitOr<Command> for Stage {
    type Output = Pipeline;

    fn bitor(self, rhs: Command) -> Pipeline {
        Pipeline::from(self).pipe(rhs)
    }
}

impl BitOr for Stage {
    type Output = Pipeline;

    fn bitor(self, rhs: Stage) -> Pipeline {
        Pipeline::from(self).pipe(rhs)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("command", &self.command)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("stdout_observers", &self.stdout_observers.len())
            .field("stderr_observers", &self.stderr_observers.len())
            .finish()
    }
}

/// A builder for pipelines of commands connected via pipes.
///
/// Like in a Unix shell pipeline, each command receives standard input from the
/// previous command, and passes standard output to the next command. All commands are
/// started before any of them is waited for.
///
/// Pipelines are normally built by combining commands with `|`:
///
/// ```no_run
/// use pipecall::{Command, Pipeline};
///
/// # fn main() -> pipecall::Result<()> {
/// let out = (Command::new("printf")?.index(["a\\nb\\nc\\n"])
///     | Command::new("sort")?.index(["-r"])
///     | Command::new("head")?.index(["-n", "1"]))
///     .run()?;
/// assert_eq!(out.to_string(), "c");
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct Pipeline {
    stages: Vec<Stage>,
    check: Option<bool>,
    policy: ExitPolicy,
    timeout: Option<Duration>,
    grace: Duration,
    new_group: bool,
    environment: Option<Environment>,
}

impl Default for Pipeline {
    fn default() -> Pipeline {
        Pipeline::new()
    }
}

impl Pipeline {
    /// Creates a new empty pipeline.
    ///
    /// Running an empty pipeline succeeds with no stages.
    pub fn new() -> Pipeline {
        Pipeline {
            stages: vec![],
            check: None,
            policy: ExitPolicy::LastStage,
            timeout: None,
            grace: DEFAULT_GRACE_PERIOD,
            new_group: false,
            environment: None,
        }
    }

    /// Appends a command or stage to the pipeline.
    ///
    /// This is the builder-style equivalent of the `|` operator.
    pub fn pipe(mut self, stage: impl Into<Stage>) -> Pipeline {
        self.stages.push(stage.into());
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Fail on a non-zero exit code or a broken pipeline.
    ///
    /// If neither this nor [`unchecked`](Self::unchecked) is called, the mode of the
    /// last command applies.
    pub fn checked(mut self) -> Pipeline {
        self.check = Some(true);
        self
    }

    /// Return failed outcomes as data instead of errors.
    pub fn unchecked(mut self) -> Pipeline {
        self.check = Some(false);
        self
    }

    /// Use the code of the rightmost failing stage, like `set -o pipefail`.
    pub fn pipefail(self) -> Pipeline {
        self.exit_policy(ExitPolicy::Pipefail)
    }

    pub fn exit_policy(mut self, policy: ExitPolicy) -> Pipeline {
        self.policy = policy;
        self
    }

    /// Cancel the pipeline if it hasn't finished after `timeout`.
    ///
    /// Waiting then fails with [`Error::TimedOut`].
    pub fn timeout(mut self, timeout: Duration) -> Pipeline {
        self.timeout = Some(timeout);
        self
    }

    /// How long cancelled processes get between `SIGTERM` and `SIGKILL`.
    pub fn grace_period(mut self, grace: Duration) -> Pipeline {
        self.grace = grace;
        self
    }

    /// Put all processes of the pipeline in a new process group.
    ///
    /// Cancellation then signals the whole group, reaching also processes started by
    /// the stages themselves.
    pub fn new_process_group(mut self) -> Pipeline {
        self.new_group = true;
        self
    }

    /// Start the processes from `env` instead of a snapshot of the current environment.
    pub fn environment(mut self, env: Environment) -> Pipeline {
        self.environment = Some(env);
        self
    }

    fn validate(&self) -> Result<()> {
        for (idx, stage) in self.stages.iter().enumerate() {
            if idx != 0 && *stage.command.stdin_source() != StdinSource::Inherit {
                return Err(Error::InvalidPipeline(format!(
                    "stage {idx} (`{}`) reads from the previous stage, it cannot have own stdin",
                    stage.command
                )));
            }
            if matches!(stage.stdout, Some(Sink::Merge)) {
                return Err(Error::InvalidPipeline(format!(
                    "stage {idx} (`{}`): Merge is only valid for stderr",
                    stage.command
                )));
            }
            if matches!(stage.stderr, Sink::Merge) && !stage.stderr_observers.is_empty() {
                return Err(Error::InvalidPipeline(format!(
                    "stage {idx} (`{}`): merged stderr cannot be observed separately",
                    stage.command
                )));
            }
        }
        Ok(())
    }

    // Terminators:

    /// Starts all commands in the pipeline and returns a [`Job`].
    ///
    /// If some command fails to start, the commands that already started are killed and
    /// waited for, and [`Error::Spawn`] is returned.
    pub fn start(self) -> Result<Job> {
        self.validate()?;

        let Pipeline {
            stages,
            check,
            policy,
            timeout,
            grace,
            new_group,
            environment,
        } = self;
        let check =
            check.unwrap_or_else(|| stages.last().is_none_or(|s| s.command.is_checked()));
        let environment = environment.unwrap_or_else(Environment::capture);

        let (cancel_read, cancel_write) = posix::pipe()?;
        let cancel_read = Arc::new(cancel_read);
        let mut job = Job::new(CancelHandle::new(cancel_write, new_group, grace), policy, check);

        let ctx = StartContext {
            cnt: stages.len(),
            environment: &environment,
            cancel: &cancel_read,
            new_group,
        };
        let mut prev_stdout: Option<File> = None;
        let mut first_pid: u32 = 0;
        for (idx, stage) in stages.into_iter().enumerate() {
            let started = ctx.start_stage(idx, stage, &mut prev_stdout, &mut first_pid, &mut job);
            if let Err(e) = started {
                job.abort();
                return Err(e);
            }
        }
        if let Some(timeout) = timeout {
            job.start_timer(timeout)?;
        }
        Ok(job)
    }

    /// Starts the pipeline and waits for it to finish.
    pub fn run(self) -> Result<Outcome> {
        self.start()?.wait()
    }

    /// Like [`run`](Self::run), but yields to the async runtime instead of blocking.
    #[cfg(feature = "tokio")]
    pub async fn run_async(self) -> Result<Outcome> {
        self.start()?.wait_async().await
    }
}

struct StartContext<'a> {
    cnt: usize,
    environment: &'a Environment,
    cancel: &'a Arc<File>,
    new_group: bool,
}

/// How one output stream of a child is connected.
struct OutputPlan {
    redirection: Redirection,
    drain: Option<DrainPlan>,
}

struct DrainPlan {
    capture: bool,
    extra: Option<Box<dyn Write + Send>>,
}

impl OutputPlan {
    fn direct(redirection: Redirection) -> OutputPlan {
        OutputPlan {
            redirection,
            drain: None,
        }
    }

    fn drained(capture: bool, extra: Option<Box<dyn Write + Send>>) -> OutputPlan {
        OutputPlan {
            redirection: Redirection::Pipe,
            drain: Some(DrainPlan { capture, extra }),
        }
    }

    // A drain is needed for capture, and for any stream that is observed.
    fn new(sink: Sink, observed: bool, stream: Stream) -> OutputPlan {
        match sink {
            Sink::Capture => OutputPlan::drained(true, None),
            Sink::Inherit if observed => OutputPlan::drained(false, Some(parent_stream(stream))),
            Sink::Inherit => OutputPlan::direct(Redirection::Inherit),
            Sink::Null if observed => OutputPlan::drained(false, None),
            Sink::Null => OutputPlan::direct(Redirection::Null),
            Sink::File(f) if observed => OutputPlan::drained(false, Some(Box::new(f))),
            Sink::File(f) => OutputPlan::direct(Redirection::File(f)),
            Sink::Merge => OutputPlan::direct(Redirection::Merge),
        }
    }
}

fn parent_stream(stream: Stream) -> Box<dyn Write + Send> {
    match stream {
        Stream::Stdout => Box::new(io::stdout()),
        Stream::Stderr => Box::new(io::stderr()),
    }
}

impl StartContext<'_> {
    fn start_stage(
        &self,
        idx: usize,
        stage: Stage,
        prev_stdout: &mut Option<File>,
        first_pid: &mut u32,
        job: &mut Job,
    ) -> Result<()> {
        let Stage {
            command,
            stdout,
            stderr,
            stdout_observers,
            stderr_observers,
        } = stage;
        let is_last = idx == self.cnt - 1;
        let spawn_error = |source: io::Error| Error::Spawn {
            command: command.to_cmdline_lossy(),
            source,
        };

        let mut feed = None;
        let stdin = match prev_stdout.take() {
            Some(upstream) => Redirection::File(upstream),
            None => match command.stdin_source() {
                StdinSource::Inherit => Redirection::Inherit,
                StdinSource::Null => Redirection::Null,
                StdinSource::Data(data) => {
                    feed = Some(Arc::clone(data));
                    Redirection::Pipe
                }
                StdinSource::File(path) => {
                    Redirection::File(File::open(path).map_err(spawn_error)?)
                }
            },
        };

        // A middle stage's stdout feeds the next stage. Without an extra destination it
        // is handed over as is; otherwise the drain forwards it through a second pipe.
        let mut forward = None;
        let stdout_plan = if is_last {
            let sink = stdout.unwrap_or(Sink::Capture);
            OutputPlan::new(sink, !stdout_observers.is_empty(), Stream::Stdout)
        } else {
            match stdout {
                None | Some(Sink::Null) if stdout_observers.is_empty() => {
                    OutputPlan::direct(Redirection::Pipe)
                }
                sink => {
                    let (next_stdin, forward_end) = posix::pipe()?;
                    *prev_stdout = Some(next_stdin);
                    forward = Some(forward_end);
                    OutputPlan::new(sink.unwrap_or(Sink::Null), true, Stream::Stdout)
                }
            }
        };
        let stderr_plan = OutputPlan::new(stderr, !stderr_observers.is_empty(), Stream::Stderr);

        let pgid = match (self.new_group, idx) {
            (false, _) => None,
            (true, 0) => Some(0),
            (true, _) => Some(*first_pid),
        };
        let env = self.environment.merged(command.env_overrides());
        let argv = command.argv();
        let result = spawn::spawn(
            &argv,
            stdin,
            stdout_plan.redirection,
            stderr_plan.redirection,
            SpawnOptions {
                env: &env,
                cwd: command.get_cwd(),
                pgid,
            },
        )
        .map_err(spawn_error)?;

        let pid = result.process.pid();
        if idx == 0 {
            *first_pid = pid;
        }
        debug!(stage = idx, pid, argv = ?argv, "spawned");
        job.push_stage(command, result.process);

        if let (Some(data), Some(pipe)) = (feed, result.stdin) {
            job.set_feeder(drain::spawn_feeder(idx, data, pipe)?);
        }
        match (stdout_plan.drain, result.stdout) {
            (Some(plan), Some(source)) => {
                let drain = Drain {
                    origin: Origin { stage: idx, stream: Stream::Stdout },
                    source,
                    capture: plan.capture,
                    forward,
                    extra: plan.extra,
                    observers: stdout_observers,
                };
                let handle = drain.spawn(Arc::clone(self.cancel))?;
                job.attach_drain(Stream::Stdout, handle, plan.capture);
            }
            // pass-through: the read end becomes the next stage's stdin
            (None, Some(source)) => *prev_stdout = Some(source),
            _ => {}
        }
        if let (Some(plan), Some(source)) = (stderr_plan.drain, result.stderr) {
            let drain = Drain {
                origin: Origin { stage: idx, stream: Stream::Stderr },
                source,
                capture: plan.capture,
                forward: None,
                extra: plan.extra,
                observers: stderr_observers,
            };
            let handle = drain.spawn(Arc::clone(self.cancel))?;
            job.attach_drain(Stream::Stderr, handle, plan.capture);
        }
        Ok(())
    }
}

impl BitOr<Command> for Pipeline {
    type Output = Pipeline;

    /// Append a command to the pipeline and return a new pipeline.
    fn bitor(self, rhs: Command) -> Pipeline {
        self.pipe(rhs)
    }
}

impl BitOr<Stage> for Pipeline {
    type Output = Pipeline;

    fn bitor(self, rhs: Stage) -> Pipeline {
        self.pipe(rhs)
    }
}

impl BitOr for Pipeline {
    type Output = Pipeline;

    /// Append the stages from `rhs` to this pipeline.
    ///
    /// Other pipeline-level settings of `rhs` are dropped, only its stages are taken.
    fn bitor(mut self, rhs: Pipeline) -> Pipeline {
        self.stages.extend(rhs.stages);
        self
    }
}

impl From<Command> for Pipeline {
    fn from(command: Command) -> Pipeline {
        Pipeline::new().pipe(command)
    }
}

impl From<Stage> for Pipeline {
    fn from(stage: Stage) -> Pipeline {
        Pipeline::new().pipe(stage)
    }
}

impl FromIterator<Command> for Pipeline {
    /// Creates a pipeline from an iterator of commands.
    ///
    /// The iterator may yield any number of commands, including zero or one.
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        iter.into_iter().fold(Pipeline::new(), Pipeline::pipe)
    }
}

impl FromIterator<Stage> for Pipeline {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        iter.into_iter().fold(Pipeline::new(), Pipeline::pipe)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cmds: Vec<String> = self
            .stages
            .iter()
            .map(|s| s.command.to_cmdline_lossy())
            .collect();
        write!(f, "Pipeline {{ {} }}", cmds.join(" | "))
    }
}
