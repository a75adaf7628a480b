use std::thread;
use std::time::{Duration, Instant};

use crate::{Command, Error, Pipeline, StageStatus, posix};

use super::sh;

fn sleep(secs: &str) -> Command {
    Command::new("sleep").unwrap().index([secs])
}

fn cancel_after(job: &crate::Job, delay: Duration) -> thread::JoinHandle<()> {
    let handle = job.cancel_handle();
    thread::spawn(move || {
        thread::sleep(delay);
        handle.cancel().unwrap();
    })
}

#[test]
fn start_then_wait() {
    let job = Command::new("echo").unwrap().index(["x"]).start().unwrap();
    assert_eq!(job.pids().len(), 1);
    assert_eq!(job.pid(), job.pids().last().copied());
    assert_eq!(job.processes().count(), 1);
    let out = job.wait().unwrap();
    assert_eq!(out.stdout_str(), "x\n");
}

#[test]
fn poll_and_kill() {
    let job = sleep("5").unchecked().start().unwrap();
    assert!(job.poll().is_none());
    job.kill().unwrap();
    let out = job.wait().unwrap();
    assert_eq!(out.code(), 128 + posix::SIGKILL);
    // killed directly, not through cancellation
    assert!(!out.stages()[0].status().is_terminated());
    assert!(!out.was_cancelled());
}

#[test]
fn terminate_all_stages() {
    let job = (sleep("5") | sleep("5")).unchecked().start().unwrap();
    job.terminate().unwrap();
    let out = job.wait().unwrap();
    for stage in out.stages() {
        assert!(stage.status().exit_status().is_killed_by(posix::SIGTERM));
    }
}

#[test]
fn empty_job_is_finished() {
    let job = Pipeline::new().start().unwrap();
    assert_eq!(job.pid(), None);
    assert!(job.poll().unwrap().success());
}

#[test]
fn cancel_running_pipeline() {
    let started = Instant::now();
    let job = (sleep("10") | sleep("10")).start().unwrap();
    let canceller = cancel_after(&job, Duration::from_millis(100));
    let err = job.wait().unwrap_err();
    canceller.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let Error::Cancelled(outcome) = err else {
        panic!("expected Cancelled, got {err:?}");
    };
    assert!(outcome.was_cancelled());
    assert!(!outcome.timed_out());
    for stage in outcome.stages() {
        assert!(matches!(stage.status(), StageStatus::Terminated(s)
            if s.is_killed_by(posix::SIGTERM)));
    }
}

#[test]
fn cancel_keeps_partial_output() {
    // the grandchild `sleep` keeps stdout open, only the cancellation wakes the drain
    let job = Pipeline::from(sh("echo partial; sleep 10; echo never"))
        .new_process_group()
        .start()
        .unwrap();
    let canceller = cancel_after(&job, Duration::from_millis(300));
    let err = job.wait().unwrap_err();
    canceller.join().unwrap();
    let outcome = err.into_outcome().unwrap();
    assert_eq!(outcome.stdout(), b"partial\n");
}

#[test]
fn cancel_is_idempotent() {
    let job = sleep("10").start().unwrap();
    let handle = job.cancel_handle();
    assert!(!handle.is_cancelled());
    job.cancel().unwrap();
    handle.cancel().unwrap();
    assert!(handle.is_cancelled());
    assert!(matches!(job.wait(), Err(Error::Cancelled(_))));
}

#[test]
fn cancel_after_finish_has_no_effect() {
    let job = Command::new("true").unwrap().start().unwrap();
    let handle = job.cancel_handle();
    assert!(job.wait().is_ok());
    handle.cancel().unwrap();
}

#[test]
fn cancel_after_exit_keeps_result() {
    let job = Command::new("true").unwrap().start().unwrap();
    while job.poll().is_none() {
        thread::sleep(Duration::from_millis(10));
    }
    job.cancel().unwrap();
    assert!(!job.cancel_handle().is_cancelled());
    let out = job.wait().unwrap();
    assert!(!out.was_cancelled());
    assert!(matches!(out.stages()[0].status(), StageStatus::Exited(_)));
}

#[test]
fn timeout_after_exit_keeps_result() {
    let job = Pipeline::from(Command::new("echo").unwrap().index(["done"]))
        .timeout(Duration::from_millis(100))
        .start()
        .unwrap();
    // the timer fires before anyone waits
    thread::sleep(Duration::from_millis(400));
    let out = job.wait().unwrap();
    assert_eq!(out.stdout_str(), "done\n");
    assert!(!out.timed_out());
    assert!(!out.stages()[0].status().is_terminated());
}

#[test]
fn cancel_escalates_to_sigkill() {
    let started = Instant::now();
    let job = Pipeline::from(sh("trap '' TERM; sleep 10"))
        .new_process_group()
        .grace_period(Duration::from_millis(200))
        .start()
        .unwrap();
    let canceller = cancel_after(&job, Duration::from_millis(200));
    let outcome = job.wait().unwrap_err().into_outcome().unwrap();
    canceller.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    let status = outcome.stages()[0].status();
    assert!(status.is_terminated());
    assert!(status.exit_status().is_killed_by(posix::SIGKILL));
}

#[test]
fn timeout_cancels() {
    let started = Instant::now();
    let err = Pipeline::from(sleep("10"))
        .timeout(Duration::from_millis(200))
        .run()
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    let Error::TimedOut(outcome) = err else {
        panic!("expected TimedOut, got {err:?}");
    };
    assert!(outcome.timed_out());
    assert!(outcome.was_cancelled());
    assert!(outcome.stages()[0].status().is_terminated());
}

#[test]
fn timeout_not_reached() {
    let started = Instant::now();
    let out = Pipeline::from(Command::new("echo").unwrap().index(["quick"]))
        .timeout(Duration::from_secs(10))
        .run()
        .unwrap();
    assert_eq!(out.stdout_str(), "quick\n");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn timeout_applies_in_relaxed_mode() {
    let err = Pipeline::from(sleep("10"))
        .unchecked()
        .timeout(Duration::from_millis(100))
        .run()
        .unwrap_err();
    assert!(matches!(err, Error::TimedOut(_)));
}
