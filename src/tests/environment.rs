use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};

use crate::{Command, Environment, Pipeline};

fn pairs(env: &[(OsString, OsString)]) -> Vec<(&str, &str)> {
    env.iter()
        .map(|(k, v)| (k.to_str().unwrap(), v.to_str().unwrap()))
        .collect()
}

#[test]
fn later_duplicates_win() {
    let env = Environment::from_vars([("A", "1"), ("B", "2"), ("A", "3")]);
    assert_eq!(env.len(), 2);
    assert_eq!(env.get("A"), Some(OsStr::new("3")));
    assert_eq!(env.get("C"), None);
    assert!(Environment::empty().is_empty());
}

#[test]
fn duplicates_keep_first_position() {
    let vars: Vec<(String, String)> = (0..5000)
        .map(|i| (format!("V{}", i % 1000), i.to_string()))
        .collect();
    let env = Environment::from_vars(vars);
    assert_eq!(env.len(), 1000);
    let keys: Vec<&OsStr> = env.iter().map(|(k, _)| k).take(3).collect();
    assert_eq!(keys, ["V0", "V1", "V2"]);
    assert_eq!(env.get("V0"), Some(OsStr::new("4000")));
    assert_eq!(env.get("V999"), Some(OsStr::new("4999")));
}

#[test]
fn merge_keeps_order_and_appends() {
    let env = Environment::from_vars([("B", "1"), ("A", "2")]);
    let mut overrides = BTreeMap::new();
    overrides.insert(OsString::from("A"), OsString::from("new"));
    overrides.insert(OsString::from("Z"), OsString::from("z"));
    overrides.insert(OsString::from("C"), OsString::from("c"));
    let merged = env.merged(&overrides);
    assert_eq!(
        pairs(&merged),
        [("B", "1"), ("A", "new"), ("C", "c"), ("Z", "z")]
    );
    // the snapshot itself is unchanged
    assert_eq!(env.get("A"), Some(OsStr::new("2")));
}

#[test]
fn capture_sees_process_environment() {
    let env = Environment::capture();
    assert_eq!(env.get("PATH"), std::env::var_os("PATH").as_deref());
    assert_eq!(env.iter().count(), env.len());
}

#[test]
fn explicit_environment_is_used() {
    let env = Environment::from_vars([("PIPECALL_ONLY", "1")]);
    let out = Pipeline::from(Command::program("/usr/bin/env").unwrap())
        .environment(env.clone())
        .run()
        .unwrap();
    assert_eq!(out.lines(), ["PIPECALL_ONLY=1"]);

    // command overrides are layered on top
    let out = Pipeline::from(Command::program("/usr/bin/env").unwrap().env("EXTRA", "x"))
        .environment(env)
        .run()
        .unwrap();
    assert_eq!(out.lines(), ["PIPECALL_ONLY=1", "EXTRA=x"]);
}
