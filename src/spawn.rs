use std::collections::HashSet;
use std::ffi::{CString, OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::posix;
use crate::process::Process;

const NULL_DEVICE: &str = "/dev/null";

/// What the child should see on one of its standard streams.
#[derive(Debug)]
pub(crate) enum Redirection {
    /// Inherit the parent's stream.
    Inherit,
    /// Connect to a fresh pipe whose other end is returned to the parent.
    Pipe,
    /// Connect to the null device.
    Null,
    /// Connect to an already open file or pipe end.
    File(File),
    /// Stderr only: share the child's stdout, like `2>&1`.
    Merge,
}

pub(crate) struct SpawnOptions<'a> {
    pub env: &'a [(OsString, OsString)],
    pub cwd: Option<&'a Path>,
    /// `Some(0)` makes the child a new group leader, `Some(pgid)` joins that group.
    pub pgid: Option<u32>,
}

pub(crate) struct SpawnResult {
    pub process: Process,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

enum ChildEnd {
    Inherit,
    Fd(File),
    ToStdout,
}

/// Spawn one subprocess with the given redirections.
///
/// Returns the parent ends of any `Redirection::Pipe` streams along with the `Process`
/// handle. The call returns only after the child has either exec'd or reported the
/// failure to exec, so an `Err` always means that no program is running.
pub(crate) fn spawn(
    argv: &[OsString],
    stdin: Redirection,
    stdout: Redirection,
    stderr: Redirection,
    options: SpawnOptions<'_>,
) -> io::Result<SpawnResult> {
    if argv.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "argv must not be empty"));
    }
    if matches!(stdin, Redirection::Merge) || matches!(stdout, Redirection::Merge) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "Merge is only valid for stderr",
        ));
    }

    let (parent_stdin, child_stdin) = prepare_child_stream(stdin, true)?;
    let (parent_stdout, child_stdout) = prepare_child_stream(stdout, false)?;
    let (parent_stderr, child_stderr) = match stderr {
        Redirection::Merge => (None, ChildEnd::ToStdout),
        other => prepare_child_stream(other, false)?,
    };

    let process = os_start(argv, [child_stdin, child_stdout, child_stderr], &options)?;

    Ok(SpawnResult {
        process,
        stdin: parent_stdin,
        stdout: parent_stdout,
        stderr: parent_stderr,
    })
}

fn prepare_child_stream(
    redir: Redirection,
    is_input: bool,
) -> io::Result<(Option<File>, ChildEnd)> {
    Ok(match redir {
        Redirection::Inherit => (None, ChildEnd::Inherit),
        Redirection::File(f) => (None, ChildEnd::Fd(f)),
        Redirection::Null => {
            let file = if is_input {
                OpenOptions::new().read(true).open(NULL_DEVICE)?
            } else {
                OpenOptions::new().write(true).open(NULL_DEVICE)?
            };
            (None, ChildEnd::Fd(file))
        }
        Redirection::Pipe => {
            let (read, write) = posix::pipe()?;
            if is_input {
                (Some(write), ChildEnd::Fd(read))
            } else {
                (Some(read), ChildEnd::Fd(write))
            }
        }
        Redirection::Merge => unreachable!("Merge handled by caller"),
    })
}

/// Read exactly N bytes, or return None on immediate EOF. A partial read is an error.
fn read_exact_or_eof<const N: usize>(source: &mut File) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    let mut total_read = 0;
    while total_read < N {
        let n = match source.read(&mut buf[total_read..]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        total_read += n;
    }
    match total_read {
        0 => Ok(None),
        n if n == N => Ok(Some(buf)),
        _ => Err(ErrorKind::UnexpectedEof.into()),
    }
}

fn os_start(
    argv: &[OsString],
    child_ends: [ChildEnd; 3],
    options: &SpawnOptions<'_>,
) -> io::Result<Process> {
    let mut exec_fail_pipe = posix::pipe()?;

    let child_env = format_env(options.env);
    let search_path = options
        .env
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.as_os_str());
    let just_exec = posix::prep_exec(&argv[0], argv, &child_env, search_path)?;
    let cwd = options
        .cwd
        .map(|dir| posix::os_to_cstring(dir.as_os_str()))
        .transpose()?;

    let pid = match unsafe { posix::fork()? } {
        Some(child_pid) => child_pid,
        None => {
            drop(exec_fail_pipe.0);
            let result = do_exec(just_exec, &child_ends, cwd.as_ref(), options.pgid);
            let error_code = match result {
                Ok(()) => unreachable!(),
                Err(e) => e.raw_os_error().unwrap_or(-1),
            } as u32;
            exec_fail_pipe.1.write_all(&error_code.to_le_bytes()).ok();
            posix::_exit(127);
        }
    };

    // Close the parent's copies of the child ends before blocking on the
    // exec-fail pipe, otherwise a reader of our pipe never sees EOF.
    drop(child_ends);

    drop(exec_fail_pipe.1);
    match read_exact_or_eof::<4>(&mut exec_fail_pipe.0)? {
        None => Ok(Process::new(pid)),
        Some(error_buf) => {
            // the child has already _exit-ed, reap it
            let _ = posix::waitpid(pid, 0);
            let error_code = u32::from_le_bytes(error_buf);
            Err(io::Error::from_raw_os_error(error_code as i32))
        }
    }
}

fn format_env(env: &[(OsString, OsString)]) -> Vec<OsString> {
    let mut seen = HashSet::<&OsStr>::new();
    let mut formatted: Vec<_> = env
        .iter()
        .rev()
        .filter(|&(k, _)| seen.insert(k))
        .map(|(k, v)| {
            let mut fmt = k.clone();
            fmt.push("=");
            fmt.push(v);
            fmt
        })
        .collect();
    formatted.reverse();
    formatted
}

fn install(end: &ChildEnd, target_fd: i32) -> io::Result<()> {
    match end {
        ChildEnd::Inherit => Ok(()),
        ChildEnd::Fd(f) if f.as_raw_fd() == target_fd => posix::set_cloexec(target_fd, false),
        ChildEnd::Fd(f) => posix::dup2(f.as_raw_fd(), target_fd),
        ChildEnd::ToStdout => posix::dup2(1, target_fd),
    }
}

// Runs in the forked child: no allocation from here on.
fn do_exec(
    just_exec: impl FnOnce() -> io::Result<()>,
    child_ends: &[ChildEnd; 3],
    cwd: Option<&CString>,
    pgid: Option<u32>,
) -> io::Result<()> {
    if let Some(dir) = cwd {
        posix::chdir(dir)?;
    }
    let [stdin, stdout, stderr] = child_ends;
    install(stdin, 0)?;
    install(stdout, 1)?;
    install(stderr, 2)?;
    posix::reset_sigpipe()?;
    if let Some(pgid) = pgid {
        posix::setpgid(0, pgid)?;
    }
    just_exec()?;
    unreachable!();
}
