use std::collections::{BTreeMap, HashMap};
use std::env;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

/// An immutable snapshot of environment variables.
///
/// Every started pipeline spawns its processes from one snapshot with each command's
/// overrides layered on top. By default the snapshot is taken from the current process
/// when the pipeline starts; pass an explicit one with
/// [`Pipeline::environment`](crate::Pipeline::environment) to decouple children from
/// later changes to the parent's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Arc<[(OsString, OsString)]>,
}

impl Environment {
    /// Snapshot of the current process environment.
    pub fn capture() -> Environment {
        Environment::from_vars(env::vars_os())
    }

    /// An environment without any variables.
    pub fn empty() -> Environment {
        Environment::default()
    }

    /// Build a snapshot from explicit variables. Later duplicates win.
    pub fn from_vars(
        vars: impl IntoIterator<Item = (impl Into<OsString>, impl Into<OsString>)>,
    ) -> Environment {
        let mut out: Vec<(OsString, OsString)> = vec![];
        // position of each key in `out`; a duplicate keeps the first slot
        let mut index = HashMap::<OsString, usize>::new();
        for (k, v) in vars {
            let (k, v) = (k.into(), v.into());
            match index.get(&k) {
                Some(&slot) => out[slot].1 = v,
                None => {
                    index.insert(k.clone(), out.len());
                    out.push((k, v));
                }
            }
        }
        Environment { vars: out.into() }
    }

    /// Look up a variable.
    pub fn get(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        let key = key.as_ref();
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_os_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
        self.vars.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str()))
    }

    /// The variables a child sees: this snapshot with `overrides` applied.
    ///
    /// Variables not mentioned in `overrides` are inherited unchanged; overridden ones
    /// keep their original position, new ones are appended in key order.
    pub fn merged(&self, overrides: &BTreeMap<OsString, OsString>) -> Vec<(OsString, OsString)> {
        let mut out: Vec<(OsString, OsString)> = self
            .vars
            .iter()
            .map(|(k, v)| match overrides.get(k) {
                Some(new) => (k.clone(), new.clone()),
                None => (k.clone(), v.clone()),
            })
            .collect();
        for (k, v) in overrides {
            if self.get(k).is_none() {
                out.push((k.clone(), v.clone()));
            }
        }
        out
    }
}
