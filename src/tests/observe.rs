use std::sync::{Arc, Mutex};

use crate::{Command, Lines, Observer, Origin, Pipeline, Sink, Stage, Stream, from_fn};

use super::sh;

fn collector() -> (Arc<Mutex<Vec<String>>>, Lines<impl FnMut(Origin, &str) + Send>) {
    let seen = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&seen);
    let lines = Lines::new(move |_origin: Origin, line: &str| {
        sink.lock().unwrap().push(line.to_owned());
    });
    (seen, lines)
}

#[test]
fn lines_split_across_chunks() {
    let (seen, mut lines) = collector();
    let origin = Origin {
        stage: 0,
        stream: Stream::Stdout,
    };
    lines.chunk(origin, b"one\ntw");
    lines.chunk(origin, b"o\r\n\nthr");
    assert_eq!(*seen.lock().unwrap(), ["one", "two", ""]);
    lines.eof(origin);
    assert_eq!(*seen.lock().unwrap(), ["one", "two", "", "thr"]);
}

#[test]
fn stream_names() {
    assert_eq!(Stream::Stdout.to_string(), "stdout");
    assert_eq!(Stream::Stderr.to_string(), "stderr");
}

#[test]
fn observed_output_is_still_captured() {
    let (seen, lines) = collector();
    let printf = Command::new("printf").unwrap().index(["a\\nb\\nc"]);
    let stage = Stage::new(printf).observe_stdout(lines);
    let out = Pipeline::from(stage).run().unwrap();
    assert_eq!(out.stdout_str(), "a\nb\nc");
    assert_eq!(*seen.lock().unwrap(), ["a", "b", "c"]);
}

#[test]
fn observe_middle_stage() {
    let total = Arc::new(Mutex::new(0usize));
    let counter = Arc::clone(&total);
    let first = Stage::new(Command::new("head").unwrap().index(["-c", "100000", "/dev/zero"]))
        .observe_stdout(from_fn(move |origin, data| {
            assert_eq!(origin.stage, 0);
            *counter.lock().unwrap() += data.len();
        }));
    let out = (first | Command::new("wc").unwrap().index(["-c"])).run().unwrap();
    assert_eq!(out.to_string(), "100000");
    assert_eq!(*total.lock().unwrap(), 100000);
    // observing alone does not capture
    assert_eq!(out.stages()[0].captured_stdout(), None);
}

#[test]
fn observe_stderr_origin() {
    let origins = Arc::new(Mutex::new(vec![]));
    let sink = Arc::clone(&origins);
    let last = Stage::new(sh("cat >/dev/null; echo done >&2")).observe_stderr(from_fn(
        move |origin, _data| sink.lock().unwrap().push(origin),
    ));
    let out = (Command::new("echo").unwrap() | last).run().unwrap();
    assert_eq!(out.stderr_str(), "done\n");
    let origins = origins.lock().unwrap();
    assert!(!origins.is_empty());
    assert!(origins.iter().all(|o| o.stage == 1 && o.stream == Stream::Stderr));
}

#[test]
fn observe_null_sink() {
    let (seen, lines) = collector();
    let stage = Stage::new(Command::new("echo").unwrap().index(["hidden"]))
        .stdout(Sink::Null)
        .observe_stdout(lines);
    let out = Pipeline::from(stage).run().unwrap();
    assert_eq!(out.stdout(), b"");
    assert_eq!(*seen.lock().unwrap(), ["hidden"]);
}

#[test]
fn merged_stderr_cannot_be_observed() {
    let (_seen, lines) = collector();
    let stage = Stage::new(sh("true")).stderr(Sink::Merge).observe_stderr(lines);
    assert!(Pipeline::from(stage).run().is_err());
}

#[test]
fn trace_output_passes_data_through() {
    let stage = Stage::new(sh("echo out; echo err >&2")).trace_output();
    let out = Pipeline::from(stage).run().unwrap();
    assert_eq!(out.stdout_str(), "out\n");
    assert_eq!(out.stderr_str(), "err\n");
}
