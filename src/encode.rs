//! Translation of call-style arguments into command-line tokens.
//!
//! A [`Call`] records positional and keyword arguments in the order they were given.
//! [`encode`] turns it into a flat token list using these conventions:
//!
//! * positional values are stringified and passed through unchanged;
//! * keyword names have `_` replaced by `-` and get `-` (one character) or `--` (longer)
//!   in front;
//! * `true` emits a bare flag, `false` omits it;
//! * a list repeats the flag once per element;
//! * anything else emits the flag followed by the stringified value.
//!
//! Keywords starting with `_` are not encoded. They configure execution instead: `_env`,
//! `_cwd`, `_check` and `_stdin`.
//!
//! ```
//! use pipecall::{call, encode};
//!
//! let enc = encode(&call!("src"; m = "msg", all = true, dev_dependency = ["a", "b"]))?;
//! assert_eq!(
//!     enc.tokens(),
//!     ["src", "-m", "msg", "--all", "--dev-dependency", "a", "--dev-dependency", "b"]
//! );
//! # Ok::<(), pipecall::EncodingError>(())
//! ```

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::command::StdinSource;
use crate::error::EncodingError;

/// A single call argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(PathBuf),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(Vec<(String, Value)>),
}

impl Value {
    /// A raw byte buffer. Only meaningful as the value of `_stdin`.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(data.into())
    }

    /// A mapping, in the given order.
    pub fn map<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Value
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Path(_) => "path",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Stringify a scalar. Bools render as `true`/`false`.
    fn scalar_token(&self) -> Option<OsString> {
        Some(match self {
            Value::Bool(b) => b.to_string().into(),
            Value::Int(n) => n.to_string().into(),
            Value::Float(x) => format!("{x:?}").into(),
            Value::Str(s) => s.into(),
            Value::Path(p) => p.as_os_str().to_owned(),
            Value::Bytes(_) | Value::List(_) | Value::Map(_) => return None,
        })
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

// No `From<u8>`: it would make `Vec<u8>` a list of numbers. Use `Value::bytes`.
macro_rules! impl_from_small_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(n: $t) -> Value {
                Value::Int(n.into())
            }
        }
    )*};
}
impl_from_small_int!(i8, i16, i32, i64, u16, u32);

macro_rules! impl_from_wide_int {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(n: $t) -> Value {
                match i64::try_from(n) {
                    Ok(n) => Value::Int(n),
                    Err(_) => Value::Str(n.to_string()),
                }
            }
        }
    )*};
}
impl_from_wide_int!(isize, usize, u64, i128, u128);

impl From<f32> for Value {
    fn from(x: f32) -> Value {
        Value::Float(x.into())
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::Str(s)
    }
}

impl From<&String> for Value {
    fn from(s: &String) -> Value {
        Value::Str(s.clone())
    }
}

impl From<&Path> for Value {
    fn from(p: &Path) -> Value {
        Value::Path(p.to_owned())
    }
}

impl From<PathBuf> for Value {
    fn from(p: PathBuf) -> Value {
        Value::Path(p)
    }
}

impl From<&PathBuf> for Value {
    fn from(p: &PathBuf) -> Value {
        Value::Path(p.clone())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Value {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value> + Clone> From<&[T]> for Value {
    fn from(items: &[T]) -> Value {
        Value::List(items.iter().cloned().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(items: [T; N]) -> Value {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<String>, V: Into<Value>> From<BTreeMap<K, V>> for Value {
    fn from(map: BTreeMap<K, V>) -> Value {
        Value::map(map)
    }
}

impl<K: Into<String>, V: Into<Value>> From<HashMap<K, V>> for Value {
    /// Entries are sorted by key so that encoding stays deterministic.
    fn from(map: HashMap<K, V>) -> Value {
        let mut entries: Vec<(String, Value)> =
            map.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Value::Map(entries)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Positional(Value),
    Keyword(String, Value),
}

/// The arguments of one invocation, in call order.
///
/// Built with the [`call!`](crate::call) macro or with the builder methods:
///
/// ```
/// use pipecall::Call;
///
/// let call = Call::new().arg("add").kw("dev_dependency", ["a", "b"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use]
pub struct Call {
    items: Vec<Arg>,
}

impl Call {
    pub fn new() -> Call {
        Call::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Call {
        self.items.push(Arg::Positional(value.into()));
        self
    }

    /// Append several positional arguments.
    pub fn args<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Call {
        self.items
            .extend(values.into_iter().map(|v| Arg::Positional(v.into())));
        self
    }

    /// Append a keyword argument.
    ///
    /// A leading `r#` is stripped, so raw identifiers such as `r#type` name the
    /// `--type` flag.
    pub fn kw(mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Call {
        let name = name.as_ref();
        let name = name.strip_prefix("r#").unwrap_or(name);
        self.items.push(Arg::Keyword(name.to_owned(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Build a [`Call`] from call-like syntax.
///
/// Positional arguments come first, separated from keyword arguments by `;`:
///
/// ```
/// use pipecall::call;
///
/// let c = call!("origin", "main"; force = true, m = "msg");
/// let only_kw = call!(all = true);
/// let only_pos = call!("file.txt");
/// ```
#[macro_export]
macro_rules! call {
    () => {
        $crate::Call::new()
    };
    ($($pos:expr),* $(,)? ; $($key:ident = $val:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut __call = $crate::Call::new();
        $( __call = __call.arg($pos); )*
        $( __call = __call.kw(stringify!($key), $val); )*
        __call
    }};
    ($($key:ident = $val:expr),+ $(,)?) => {{
        let mut __call = $crate::Call::new();
        $( __call = __call.kw(stringify!($key), $val); )*
        __call
    }};
    ($($pos:expr),+ $(,)?) => {{
        let mut __call = $crate::Call::new();
        $( __call = __call.arg($pos); )*
        __call
    }};
}

/// Execution settings routed out of `_`-prefixed keywords.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ExecOptions {
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub check: Option<bool>,
    pub stdin: Option<StdinSource>,
}

/// The result of [`encode`]: the argument tokens plus any routed execution settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    tokens: Vec<OsString>,
    options: ExecOptions,
}

impl Encoded {
    /// Positional tokens first, then keyword tokens, each group in call order.
    pub fn tokens(&self) -> &[OsString] {
        &self.tokens
    }

    pub fn into_tokens(self) -> Vec<OsString> {
        self.tokens
    }

    pub(crate) fn into_parts(self) -> (Vec<OsString>, ExecOptions) {
        (self.tokens, self.options)
    }

    /// Environment overrides given through `_env`.
    pub fn env(&self) -> &[(String, String)] {
        &self.options.env
    }

    /// Working directory given through `_cwd`.
    pub fn cwd(&self) -> Option<&Path> {
        self.options.cwd.as_deref()
    }

    /// Strict mode requested through `_check`.
    pub fn check(&self) -> Option<bool> {
        self.options.check
    }

    /// Standard input given through `_stdin`.
    pub fn stdin(&self) -> Option<&StdinSource> {
        self.options.stdin.as_ref()
    }
}

/// Replace underscores with dashes.
pub fn dashed(name: &str) -> String {
    name.replace('_', "-")
}

/// The flag token for a keyword name: `-x` for one character, `--name` otherwise.
pub fn flag(name: &str) -> String {
    let name = dashed(name);
    if name.chars().count() == 1 {
        format!("-{name}")
    } else {
        format!("--{name}")
    }
}

/// Encode a call into tokens.
///
/// Fails if any value cannot be encoded, or if a positional argument appears after a
/// keyword: the order is never silently changed, so callers must pass positionals first.
pub fn encode(call: &Call) -> Result<Encoded, EncodingError> {
    let mut positional = vec![];
    let mut keyword = vec![];
    let mut options = ExecOptions::default();
    let mut first_keyword: Option<&str> = None;

    for item in &call.items {
        match item {
            Arg::Positional(value) => {
                let index = positional.len();
                if let Some(kw) = first_keyword {
                    return Err(EncodingError::PositionalAfterKeyword {
                        index,
                        keyword: kw.to_owned(),
                    });
                }
                let token = value
                    .scalar_token()
                    .ok_or(EncodingError::UnencodablePositional {
                        index,
                        kind: value.kind(),
                    })?;
                positional.push(token);
            }
            Arg::Keyword(name, value) => {
                if name.is_empty() {
                    return Err(EncodingError::EmptyKeyword);
                }
                if first_keyword.is_none() {
                    first_keyword = Some(name.as_str());
                }
                if name.starts_with('_') {
                    route_option(name, value, &mut options)?;
                } else {
                    encode_keyword(name, value, &mut keyword)?;
                }
            }
        }
    }

    positional.extend(keyword);
    Ok(Encoded {
        tokens: positional,
        options,
    })
}

fn encode_keyword(name: &str, value: &Value, out: &mut Vec<OsString>) -> Result<(), EncodingError> {
    let key = flag(name);
    let unencodable = |v: &Value| EncodingError::Unencodable {
        keyword: name.to_owned(),
        kind: v.kind(),
    };
    let items = match value {
        Value::List(items) => items.as_slice(),
        single => std::slice::from_ref(single),
    };
    for v in items {
        match v {
            Value::Bool(true) => out.push(key.clone().into()),
            Value::Bool(false) => {}
            other => {
                let token = other.scalar_token().ok_or_else(|| unencodable(other))?;
                out.push(key.clone().into());
                out.push(token);
            }
        }
    }
    Ok(())
}

fn route_option(name: &str, value: &Value, options: &mut ExecOptions) -> Result<(), EncodingError> {
    let wrong_type = |expected| EncodingError::OptionType {
        option: name.to_owned(),
        expected,
        kind: value.kind(),
    };
    match name {
        "_env" => {
            let Value::Map(entries) = value else {
                return Err(wrong_type("a map"));
            };
            for (k, v) in entries {
                let v = match v {
                    Value::Str(s) => s.clone(),
                    Value::Path(p) => p.to_string_lossy().into_owned(),
                    other => other
                        .scalar_token()
                        .and_then(|t| t.into_string().ok())
                        .ok_or_else(|| wrong_type("a map of scalar values"))?,
                };
                options.env.push((k.clone(), v));
            }
        }
        "_cwd" => match value {
            Value::Str(s) => options.cwd = Some(PathBuf::from(s)),
            Value::Path(p) => options.cwd = Some(p.clone()),
            _ => return Err(wrong_type("a path")),
        },
        "_check" => match value {
            Value::Bool(b) => options.check = Some(*b),
            _ => return Err(wrong_type("a bool")),
        },
        "_stdin" => {
            options.stdin = Some(match value {
                Value::Str(s) => StdinSource::Data(Arc::from(s.as_bytes())),
                Value::Bytes(b) => StdinSource::Data(Arc::from(b.as_slice())),
                Value::Path(p) => StdinSource::File(p.clone()),
                Value::Bool(false) => StdinSource::Null,
                Value::Bool(true) => StdinSource::Inherit,
                _ => return Err(wrong_type("str, bytes, path or bool")),
            })
        }
        _ => return Err(EncodingError::UnknownOption(name.to_owned())),
    }
    Ok(())
}
