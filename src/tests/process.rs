use std::ffi::OsString;
use std::io::{self, Write};
use std::time::Duration;

use crate::posix;
use crate::process::ExitStatus;
use crate::spawn::{self, Redirection, SpawnOptions, SpawnResult};

fn start(argv: &[&str], stdin: Redirection, stdout: Redirection) -> SpawnResult {
    let argv: Vec<OsString> = argv.iter().map(OsString::from).collect();
    let env: Vec<(OsString, OsString)> = std::env::vars_os().collect();
    spawn::spawn(
        &argv,
        stdin,
        stdout,
        Redirection::Inherit,
        SpawnOptions {
            env: &env,
            cwd: None,
            pgid: None,
        },
    )
    .unwrap()
}

#[test]
fn exit_status_codes() {
    let exited = ExitStatus::from_raw(3 << 8);
    assert_eq!(exited.code(), Some(3));
    assert_eq!(exited.signal(), None);
    assert_eq!(exited.shell_code(), 3);
    assert!(!exited.success());

    let killed = ExitStatus::from_raw(posix::SIGKILL);
    assert_eq!(killed.code(), None);
    assert!(killed.is_killed_by(posix::SIGKILL));
    assert_eq!(killed.shell_code(), 128 + 9);

    assert_eq!(ExitStatus(None).shell_code(), -1);
    assert!(ExitStatus::from_raw(0).success());
}

#[test]
fn wait_for_exit_code() {
    let child = start(&["sh", "-c", "exit 13"], Redirection::Inherit, Redirection::Inherit);
    let status = child.process.wait().unwrap();
    assert_eq!(status.code(), Some(13));
    // the status is remembered once reaped
    assert_eq!(child.process.exit_status(), Some(status));
    assert_eq!(child.process.poll(), Some(status));
}

#[test]
fn read_from_stdout() {
    let SpawnResult {
        process, stdout, ..
    } = start(&["echo", "foo"], Redirection::Inherit, Redirection::Pipe);
    assert_eq!(io::read_to_string(stdout.unwrap()).unwrap(), "foo\n");
    assert!(process.wait().unwrap().success());
}

#[test]
fn write_to_stdin() {
    let SpawnResult {
        process,
        stdin,
        stdout,
        ..
    } = start(&["cat"], Redirection::Pipe, Redirection::Pipe);
    let mut stdin = stdin.unwrap();
    stdin.write_all(b"foo").unwrap();
    drop(stdin);
    assert_eq!(io::read_to_string(stdout.unwrap()).unwrap(), "foo");
    assert!(process.wait().unwrap().success());
}

#[test]
fn null_stdin() {
    let child = start(&["cat"], Redirection::Null, Redirection::Pipe);
    assert_eq!(io::read_to_string(child.stdout.unwrap()).unwrap(), "");
}

#[test]
fn terminate_and_wait_timeout() {
    let child = start(&["sleep", "5"], Redirection::Inherit, Redirection::Inherit);
    let process = child.process;
    assert!(process.poll().is_none());
    assert_eq!(process.wait_timeout(Duration::from_millis(50)).unwrap(), None);

    let clone = process.clone();
    clone.terminate().unwrap();
    let status = process.wait().unwrap();
    assert!(status.is_killed_by(posix::SIGTERM));
    assert_eq!(clone.exit_status(), Some(status));
    // signalling a reaped process is a no-op
    clone.kill().unwrap();
}

#[test]
fn exec_failure_is_reported() {
    let argv = [OsString::from("nosuchcommand-pipecall")];
    let result = spawn::spawn(
        &argv,
        Redirection::Inherit,
        Redirection::Inherit,
        Redirection::Inherit,
        SpawnOptions {
            env: &[],
            cwd: None,
            pgid: None,
        },
    );
    assert!(result.is_err());
}

#[test]
fn merge_stderr_into_stdout() {
    let argv: Vec<OsString> = ["sh", "-c", "echo foo; echo bar >&2"]
        .iter()
        .map(OsString::from)
        .collect();
    let child = spawn::spawn(
        &argv,
        Redirection::Inherit,
        Redirection::Pipe,
        Redirection::Merge,
        SpawnOptions {
            env: &[],
            cwd: None,
            pgid: None,
        },
    )
    .unwrap();
    assert!(child.stderr.is_none());
    assert_eq!(io::read_to_string(child.stdout.unwrap()).unwrap(), "foo\nbar\n");
    assert!(child.process.wait().unwrap().success());
}
