use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::Path;

use tempfile::TempDir;

use crate::{Command, EncodingError, Error, StdinSource, call};

use super::sh;

#[test]
fn bare_names_are_dashed() {
    assert_eq!(Command::new("apt_get").unwrap().get_program(), "apt-get");
    assert_eq!(Command::new("./my_tool").unwrap().get_program(), "./my_tool");
    assert_eq!(Command::program("my_tool").unwrap().get_program(), "my_tool");
}

#[test]
fn empty_program_is_rejected() {
    assert_eq!(Command::new(""), Err(EncodingError::EmptyProgram));
    assert_eq!(Command::program(""), Err(EncodingError::EmptyProgram));
}

#[test]
fn derivation_leaves_parent_untouched() {
    let git = Command::new("git").unwrap();
    let rev_parse = git.sub("rev_parse");
    let log = git.index(["log", "-n", "1"]);
    assert!(git.get_args().is_empty());
    assert_eq!(rev_parse.get_args(), ["rev-parse"]);
    assert_eq!(log.get_args(), ["log", "-n", "1"]);

    let quiet = log.env("GIT_PAGER", "cat").cwd("/tmp").unchecked();
    assert!(log.env_overrides().is_empty());
    assert!(log.is_checked());
    assert_eq!(log.get_cwd(), None);
    assert!(!quiet.is_checked());
    assert_eq!(quiet.get_cwd(), Some(Path::new("/tmp")));
    assert!(quiet.checked().is_checked());
}

#[test]
fn bind_appends_encoded_tokens() {
    let commit = Command::new("git")
        .unwrap()
        .sub("commit")
        .bind(&call!(m = "fix typo", all = true))
        .unwrap();
    assert_eq!(
        commit.argv(),
        ["git", "commit", "-m", "fix typo", "--all"]
            .map(OsString::from)
            .to_vec()
    );
}

#[test]
fn bind_applies_options() {
    let vars = BTreeMap::from([("CC", "clang")]);
    let cmd = Command::new("make")
        .unwrap()
        .bind(&call!(_env = vars, _cwd = "/src", _check = false, _stdin = false))
        .unwrap();
    assert!(cmd.get_args().is_empty());
    assert_eq!(
        cmd.env_overrides().get(&OsString::from("CC")),
        Some(&OsString::from("clang"))
    );
    assert_eq!(cmd.get_cwd(), Some(Path::new("/src")));
    assert!(!cmd.is_checked());
    assert_eq!(*cmd.stdin_source(), StdinSource::Null);
}

#[test]
fn bind_reports_encoding_errors() {
    let err = Command::new("x").unwrap().bind(&call!(_nope = 1)).unwrap_err();
    assert_eq!(err, EncodingError::UnknownOption("_nope".to_owned()));
}

#[test]
fn cmdline_display() {
    let cmd = Command::new("echo")
        .unwrap()
        .index(["a b", "it's", ""])
        .env("K", "v");
    assert_eq!(cmd.to_cmdline_lossy(), r#"K=v echo 'a b' 'it'\''s' ''"#);
    assert_eq!(cmd.to_string(), cmd.to_cmdline_lossy());
    assert_eq!(
        format!("{:?}", Command::new("ls").unwrap()),
        "Command { ls }"
    );
}

#[test]
fn run_captures_stdout() {
    let out = Command::new("echo").unwrap().index(["hello"]).run().unwrap();
    assert_eq!(out.stdout(), b"hello\n");
    assert_eq!(out.to_string(), "hello");
    assert_eq!(out.code(), 0);
}

#[test]
fn call_binds_and_runs() {
    let out = Command::new("printf")
        .unwrap()
        .call(&call!("%s-%s", "a", "b"))
        .unwrap();
    assert_eq!(out.stdout_str(), "a-b");
}

#[test]
fn failure_is_an_error_by_default() {
    match Command::new("false").unwrap().run() {
        Err(Error::CommandFailed(outcome)) => assert_eq!(outcome.code(), 1),
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[test]
fn unchecked_returns_failure_as_data() {
    let out = sh("echo oops >&2; exit 3").unchecked().run().unwrap();
    assert_eq!(out.code(), 3);
    assert!(!out.is_success());
    assert_eq!(out.stderr_str(), "oops\n");

    let out = Command::new("false")
        .unwrap()
        .call(&call!(_check = false))
        .unwrap();
    assert_eq!(out.code(), 1);
}

#[test]
fn env_override() {
    let out = sh(r#"printf %s "$PIPECALL_TEST_VAR""#)
        .env("PIPECALL_TEST_VAR", "v")
        .run()
        .unwrap();
    assert_eq!(out.stdout_str(), "v");
}

#[test]
fn working_directory() {
    let tmpdir = TempDir::new().unwrap();
    let out = Command::new("pwd").unwrap().cwd(tmpdir.path()).run().unwrap();
    assert_eq!(
        Path::new(out.stdout_str().trim()),
        fs::canonicalize(tmpdir.path()).unwrap()
    );
}

#[test]
fn stdin_sources() {
    let cat = Command::new("cat").unwrap();
    assert_eq!(cat.stdin("abc").run().unwrap().stdout_str(), "abc");
    assert_eq!(cat.stdin(b"\x00\x01".to_vec()).run().unwrap().stdout(), b"\x00\x01");
    assert_eq!(cat.stdin(StdinSource::Null).run().unwrap().stdout(), b"");
    assert_eq!(
        cat.call(&call!(_stdin = "xyz")).unwrap().stdout_str(),
        "xyz"
    );

    let tmpdir = TempDir::new().unwrap();
    let input = tmpdir.path().join("input");
    fs::write(&input, "from file").unwrap();
    let out = cat.stdin(StdinSource::File(input)).run().unwrap();
    assert_eq!(out.stdout_str(), "from file");
}

#[test]
fn missing_stdin_file() {
    let err = Command::new("cat")
        .unwrap()
        .stdin(StdinSource::File("/nonexistent/pipecall".into()))
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::Spawn { .. }), "{err}");
}

#[test]
fn spawn_failure() {
    let err = Command::new("nosuchcommand-pipecall")
        .unwrap()
        .run()
        .unwrap_err();
    match err {
        Error::Spawn { command, .. } => assert_eq!(command, "nosuchcommand-pipecall"),
        other => panic!("expected Spawn, got {other:?}"),
    }
}
