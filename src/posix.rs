use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{Error, Result};
use std::marker::PhantomData;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr;
use std::time::Duration;

pub use libc::{ECHILD, ESRCH, SIGKILL, SIGPIPE, SIGTERM};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

fn interrupted(err: &Error) -> bool {
    err.raw_os_error() == Some(libc::EINTR)
}

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
))]
fn raw_pipe(fds: &mut [libc::c_int; 2]) -> Result<()> {
    check_err(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(())
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "illumos",
)))]
fn raw_pipe(fds: &mut [libc::c_int; 2]) -> Result<()> {
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    for &fd in fds.iter() {
        set_cloexec(fd, true)?;
    }
    Ok(())
}

/// Create a pipe whose both ends are close-on-exec.
///
/// Returns `(read_end, write_end)`. A child only sees an end after it has been `dup2`-ed
/// onto one of its standard descriptors, so sibling stages never inherit each other's
/// pipes.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    raw_pipe(&mut fds)?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Fork the current process.
///
/// Returns `Some(pid)` in the parent and `None` in the child.
///
/// # Safety
///
/// The child of a multi-threaded parent may only perform async-signal-safe operations
/// before calling `exec` or `_exit`.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid as u32) })
}

pub fn os_to_cstring(s: &OsStr) -> Result<CString> {
    let bytes = s.as_bytes();
    if bytes.contains(&0) {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    CString::new(bytes).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

fn cstring_ptr(s: &CString) -> *const libc::c_char {
    s.as_ptr()
}

struct CVec {
    // Pointed to by elements of `ptrs`.
    #[allow(dead_code)]
    strings: Vec<CString>,
    // Null-terminated.
    ptrs: Vec<*const libc::c_char>,
}

impl CVec {
    fn new(slice: &[impl AsRef<OsStr>]) -> Result<CVec> {
        let strings = slice
            .iter()
            .map(|x| os_to_cstring(x.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let ptrs = strings
            .iter()
            .map(cstring_ptr)
            .chain(std::iter::once(ptr::null()))
            .collect();
        Ok(CVec { strings, ptrs })
    }

    fn as_c_vec(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// Prepare everything `execve` needs before forking.
///
/// The returned closure performs only `execve` calls, so it is safe to run in the child
/// of a multi-threaded parent. A command without a slash is looked up in `search_path`
/// (the child's `PATH`), falling back to the parent's `PATH`.
pub fn prep_exec(
    cmd: &OsStr,
    argv: &[impl AsRef<OsStr>],
    envp: &[impl AsRef<OsStr>],
    search_path: Option<&OsStr>,
) -> Result<impl FnOnce() -> Result<()>> {
    let argvec = CVec::new(argv)?;
    let envvec = CVec::new(envp)?;
    let candidates: Vec<CString> = if cmd.as_bytes().contains(&b'/') {
        vec![os_to_cstring(cmd)?]
    } else {
        let path = search_path
            .map(OsString::from)
            .or_else(|| env::var_os("PATH"))
            .unwrap_or_else(|| DEFAULT_PATH.into());
        env::split_paths(&path)
            .map(|dir| os_to_cstring(dir.join(cmd).as_os_str()))
            .collect::<Result<_>>()?
    };

    Ok(move || {
        let mut error = Error::from_raw_os_error(libc::ENOENT);
        for exe in &candidates {
            unsafe {
                libc::execve(cstring_ptr(exe), argvec.as_c_vec(), envvec.as_c_vec());
            }
            // like execvp, a permission problem outranks "not found"
            let err = Error::last_os_error();
            if !matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) {
                error = err;
            }
        }
        Err(error)
    })
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub fn chdir(dir: &CString) -> Result<()> {
    check_err(unsafe { libc::chdir(dir.as_ptr()) })?;
    Ok(())
}

pub const WNOHANG: i32 = libc::WNOHANG;

pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, i32)> {
    let mut status = 0 as libc::c_int;
    loop {
        match check_err(unsafe {
            libc::waitpid(pid as libc::pid_t, &mut status, flags as libc::c_int)
        }) {
            Ok(pid_out) => return Ok((pid_out as u32, status)),
            Err(e) if interrupted(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Block until `pid` has exited, without reaping it.
///
/// The child stays a zombie, so its PID cannot be reused while other threads still
/// send it signals. Reap it afterwards with `waitpid(pid, WNOHANG)`.
pub fn wait_exited(pid: u32) -> Result<()> {
    loop {
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        match check_err(rc) {
            Ok(_) => return Ok(()),
            Err(e) if interrupted(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal) })?;
    Ok(())
}

pub fn killpg(pgid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::killpg(pgid as libc::pid_t, signal) })?;
    Ok(())
}

pub fn setpgid(pid: u32, pgid: u32) -> Result<()> {
    check_err(unsafe { libc::setpgid(pid as libc::pid_t, pgid as libc::pid_t) })?;
    Ok(())
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn set_cloexec(fd: i32, cloexec: bool) -> Result<()> {
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if cloexec {
        old | libc::FD_CLOEXEC
    } else {
        old & !libc::FD_CLOEXEC
    };
    if new != old {
        check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    }
    Ok(())
}

pub fn reset_sigpipe() -> Result<()> {
    // libstd ignores SIGPIPE and the ignored disposition survives exec, so
    // restore the default that Unix programs expect.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        check_err(libc::sigemptyset(&mut set))?;
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(Error::from_raw_os_error(rc));
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

#[repr(transparent)]
pub struct PollFd<'a>(libc::pollfd, PhantomData<&'a File>);

impl<'a> PollFd<'a> {
    pub fn new(f: Option<&'a File>, events: i16) -> PollFd<'a> {
        PollFd(
            libc::pollfd {
                fd: f.map(File::as_raw_fd).unwrap_or(-1),
                events,
                revents: 0,
            },
            PhantomData,
        )
    }

    pub fn test(&self, mask: i16) -> bool {
        self.0.revents & mask != 0
    }
}

pub use libc::{POLLERR, POLLHUP, POLLIN, POLLNVAL};

pub fn poll(fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> Result<usize> {
    let timeout = timeout
        .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);
    loop {
        let fds_ptr = fds.as_mut_ptr() as *mut libc::pollfd;
        match check_err(unsafe { libc::poll(fds_ptr, fds.len() as libc::nfds_t, timeout) }) {
            Ok(cnt) => return Ok(cnt as usize),
            Err(e) if interrupted(&e) => continue,
            Err(e) => return Err(e),
        }
    }
}
