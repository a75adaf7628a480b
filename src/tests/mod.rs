mod command;
mod environment;
mod job;
mod observe;
mod process;

use crate::{
    Call, CancelHandle, Command, Encoded, Environment, Error, ExitStatus, Job, Outcome,
    Pipeline, Process, Sink, Stage, StageResult, StdinSource, Value,
};

fn assert_send_sync<T: Send + Sync>() {}
fn assert_send<T: Send>() {}

#[test]
fn public_types_are_send_and_sync() {
    assert_send_sync::<Command>();
    assert_send_sync::<StdinSource>();
    assert_send_sync::<Call>();
    assert_send_sync::<Value>();
    assert_send_sync::<Encoded>();
    assert_send_sync::<Environment>();
    assert_send_sync::<Job>();
    assert_send_sync::<CancelHandle>();
    assert_send_sync::<Process>();
    assert_send_sync::<ExitStatus>();
    assert_send_sync::<Outcome>();
    assert_send_sync::<StageResult>();
    assert_send_sync::<Error>();
    assert_send_sync::<Sink>();
}

#[test]
fn builders_are_send() {
    // observers are only Send, so are the types holding them
    assert_send::<Stage>();
    assert_send::<Pipeline>();
}

fn sh(script: &str) -> Command {
    Command::new("sh").unwrap().index(["-c", script])
}
