use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::ops::BitOr;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::encode::{self, Call};
use crate::error::{EncodingError, Result};
use crate::job::Job;
use crate::outcome::Outcome;
use crate::pipeline::{Pipeline, Stage};

/// Where the first process of an invocation reads its standard input from.
///
/// Every later stage of a pipeline reads from the stage before it; that connection is
/// made when the pipeline starts and is never stored on a [`Command`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdinSource {
    /// Use the parent's standard input.
    #[default]
    Inherit,
    /// Read from the null device, i.e. see EOF immediately.
    Null,
    /// Feed the given bytes, then close the pipe.
    Data(Arc<[u8]>),
    /// Read from the file at this path, opened when the command starts.
    File(PathBuf),
}

impl From<&str> for StdinSource {
    fn from(s: &str) -> StdinSource {
        StdinSource::Data(Arc::from(s.as_bytes()))
    }
}

impl From<String> for StdinSource {
    fn from(s: String) -> StdinSource {
        StdinSource::Data(Arc::from(s.into_bytes()))
    }
}

impl From<Vec<u8>> for StdinSource {
    fn from(data: Vec<u8>) -> StdinSource {
        StdinSource::Data(Arc::from(data))
    }
}

impl From<&[u8]> for StdinSource {
    fn from(data: &[u8]) -> StdinSource {
        StdinSource::Data(Arc::from(data))
    }
}

/// An immutable description of one program invocation.
///
/// A `Command` is a value: every builder method takes `&self` and returns a new
/// `Command`, leaving the original untouched, so a partially built command can be kept
/// around and extended in different directions.
///
/// ```no_run
/// use pipecall::{Command, call};
///
/// # fn main() -> pipecall::Result<()> {
/// let git = Command::new("git")?;
/// let out = git.sub("rev_parse").bind(&call!("HEAD"; short = true))?.run()?;
/// println!("{out}");
///
/// // explicit control over the tokens, bypassing the encoding conventions
/// git.index(["log", "-n", "1"]).run()?;
/// # Ok(())
/// # }
/// ```
///
/// Commands run in strict mode by default: a non-zero exit status is returned as
/// [`Error::CommandFailed`](crate::Error::CommandFailed). Use
/// [`unchecked`](Self::unchecked) to get the [`Outcome`] back as data instead.
#[derive(Clone, PartialEq, Eq)]
#[must_use]
pub struct Command {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    cwd: Option<PathBuf>,
    stdin: StdinSource,
    check: bool,
}

impl Command {
    /// A command for the program `name`.
    ///
    /// Underscores in a bare program name are replaced by dashes, so `Command::new("apt_get")`
    /// runs `apt-get`. Names containing a `/` are paths and are kept verbatim.
    pub fn new(name: impl AsRef<OsStr>) -> std::result::Result<Command, EncodingError> {
        let name = name.as_ref();
        if name.as_bytes().contains(&b'/') {
            return Command::program(name);
        }
        let dashed: Vec<u8> = name
            .as_bytes()
            .iter()
            .map(|&b| if b == b'_' { b'-' } else { b })
            .collect();
        Command::program(OsString::from_vec(dashed))
    }

    /// A command for the program `path`, taken verbatim.
    pub fn program(path: impl Into<OsString>) -> std::result::Result<Command, EncodingError> {
        let program = path.into();
        if program.is_empty() {
            return Err(EncodingError::EmptyProgram);
        }
        Ok(Command {
            program,
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
            stdin: StdinSource::Inherit,
            check: true,
        })
    }

    /// Derive a command with a subcommand appended, with underscores turned into dashes.
    pub fn sub(&self, name: &str) -> Command {
        let mut cmd = self.clone();
        cmd.args.push(encode::dashed(name).into());
        cmd
    }

    /// Derive a command with literal arguments appended, without any encoding.
    pub fn index<S: AsRef<OsStr>>(&self, args: impl IntoIterator<Item = S>) -> Command {
        let mut cmd = self.clone();
        cmd.args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        cmd
    }

    /// Derive a command with the encoded arguments of `call` appended.
    ///
    /// Execution options given as `_`-keywords are applied on top of the ones already
    /// set on `self`.
    pub fn bind(&self, call: &Call) -> std::result::Result<Command, EncodingError> {
        let (tokens, options) = encode::encode(call)?.into_parts();
        let mut cmd = self.clone();
        cmd.args.extend(tokens);
        for (k, v) in options.env {
            cmd.env.insert(k.into(), v.into());
        }
        if let Some(dir) = options.cwd {
            cmd.cwd = Some(dir);
        }
        if let Some(check) = options.check {
            cmd.check = check;
        }
        if let Some(stdin) = options.stdin {
            cmd.stdin = stdin;
        }
        Ok(cmd)
    }

    /// Derive a command with an environment override.
    ///
    /// Overrides are layered on top of the environment snapshot the command is started
    /// with; variables that are not overridden are inherited unchanged.
    pub fn env(&self, key: impl Into<OsString>, value: impl Into<OsString>) -> Command {
        let mut cmd = self.clone();
        cmd.env.insert(key.into(), value.into());
        cmd
    }

    /// Derive a command with several environment overrides.
    pub fn envs<K, V>(&self, vars: impl IntoIterator<Item = (K, V)>) -> Command
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let mut cmd = self.clone();
        cmd.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        cmd
    }

    /// Derive a command that runs in `dir`.
    pub fn cwd(&self, dir: impl AsRef<Path>) -> Command {
        let mut cmd = self.clone();
        cmd.cwd = Some(dir.as_ref().to_owned());
        cmd
    }

    /// Derive a command with a different standard input.
    pub fn stdin(&self, source: impl Into<StdinSource>) -> Command {
        let mut cmd = self.clone();
        cmd.stdin = source.into();
        cmd
    }

    /// Derive a command that fails on non-zero exit status (the default).
    pub fn checked(&self) -> Command {
        let mut cmd = self.clone();
        cmd.check = true;
        cmd
    }

    /// Derive a command whose non-zero exit status is returned as data.
    pub fn unchecked(&self) -> Command {
        let mut cmd = self.clone();
        cmd.check = false;
        cmd
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// The program followed by its arguments.
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn env_overrides(&self) -> &BTreeMap<OsString, OsString> {
        &self.env
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn stdin_source(&self) -> &StdinSource {
        &self.stdin
    }

    pub fn is_checked(&self) -> bool {
        self.check
    }

    /// Show the command as a command line quoted in the Unix style.
    ///
    /// Environment overrides are shown as a `NAME=value` prefix.
    pub fn to_cmdline_lossy(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.env {
            out.push_str(&display_escape(&k.to_string_lossy()));
            out.push('=');
            out.push_str(&display_escape(&v.to_string_lossy()));
            out.push(' ');
        }
        out.push_str(&display_escape(&self.program.to_string_lossy()));
        for arg in &self.args {
            out.push(' ');
            out.push_str(&display_escape(&arg.to_string_lossy()));
        }
        out
    }

    // Execution:

    /// Run the command to completion, capturing stdout and stderr.
    pub fn run(self) -> Result<Outcome> {
        Pipeline::from(self).run()
    }

    /// Bind `call` and run the resulting command.
    pub fn call(&self, call: &Call) -> Result<Outcome> {
        self.bind(call)?.run()
    }

    /// Start the command and return without waiting for it.
    pub fn start(self) -> Result<Job> {
        Pipeline::from(self).start()
    }

    /// Connect this command's stdout to the stdin of `next`.
    pub fn pipe(self, next: impl Into<Stage>) -> Pipeline {
        Pipeline::from(self).pipe(next)
    }

    /// Run the command without blocking the async runtime.
    #[cfg(feature = "tokio")]
    pub async fn run_async(self) -> Result<Outcome> {
        Pipeline::from(self).run_async().await
    }
}

fn display_escape(s: &str) -> Cow<'_, str> {
    fn nice_char(c: char) -> bool {
        matches!(c, '-' | '_' | '.' | ',' | '/' | ':' | '=' | '+' | '@')
            || c.is_ascii_alphanumeric()
    }
    if s.is_empty() {
        Cow::Borrowed("''")
    } else if !s.chars().all(nice_char) {
        Cow::Owned(format!("'{}'", s.replace('\'', r#"'\''"#)))
    } else {
        Cow::Borrowed(s)
    }
}

impl BitOr for Command {
    type Output = Pipeline;

    /// Create a `Pipeline` from `self` and `rhs`.
    fn bitor(self, rhs: Command) -> Pipeline {
        self.pipe(rhs)
    }
}

impl BitOr<Stage> for Command {
    type Output = Pipeline;

    fn bitor(self, rhs: Stage) -> Pipeline {
        self.pipe(rhs)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cmdline_lossy())
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command {{ {} }}", self.to_cmdline_lossy())
    }
}
