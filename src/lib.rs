//! Call external programs with function-call syntax, and connect them into pipelines.
//!
//! A [`Command`] is an immutable description of one invocation. Arguments are given
//! either as literal tokens with [`Command::index`], or as a call built with [`call!`],
//! whose keyword arguments are encoded as command-line flags:
//!
//! ```no_run
//! use pipecall::{Command, call};
//!
//! # fn main() -> pipecall::Result<()> {
//! let git = Command::new("git")?;
//! // git commit -m 'fix typo' --all
//! git.sub("commit").call(&call!(m = "fix typo", all = true))?;
//! # Ok(())
//! # }
//! ```
//!
//! Commands combine into a [`Pipeline`] with `|`. All stages run concurrently and every
//! output stream is drained on its own thread, so a pipeline never deadlocks on full
//! pipe buffers, no matter how much its stages write:
//!
//! ```no_run
//! use pipecall::Command;
//!
//! # fn main() -> pipecall::Result<()> {
//! let count = (Command::new("yes")?
//!     | Command::new("head")?.index(["-c", "1000000"])
//!     | Command::new("wc")?.index(["-c"]))
//!     .run()?;
//! assert_eq!(count.to_string(), "1000000");
//! # Ok(())
//! # }
//! ```
//!
//! Running returns an [`Outcome`] with the captured output and exit code of every stage.
//! By default a non-zero exit code is reported as [`Error::CommandFailed`], which still
//! carries the `Outcome`. Use [`Command::unchecked`] or [`Pipeline::unchecked`] to get
//! failed outcomes back as data.
//!
//! A started pipeline is a [`Job`], which can be cancelled from any thread through its
//! [`CancelHandle`], or bounded with [`Pipeline::timeout`]. Output can be watched while it
//! streams by with an [`Observer`]; [`TraceLines`] feeds child output into `tracing`.
//!
//! Only Unix-like systems are supported.

#![warn(missing_debug_implementations)]

#[cfg(not(unix))]
compile_error!("pipecall supports only Unix-like platforms");

mod command;
mod drain;
mod encode;
mod environment;
mod error;
mod job;
mod observe;
mod outcome;
mod pipeline;
mod posix;
mod process;
mod spawn;

#[cfg(test)]
mod tests;

pub use command::{Command, StdinSource};
pub use encode::{Call, Encoded, Value, dashed, encode, flag};
pub use environment::Environment;
pub use error::{EncodingError, Error, Result};
pub use job::{CancelHandle, Job};
pub use observe::{Lines, Observer, Origin, Stream, TraceLines, from_fn};
pub use outcome::{ExitPolicy, Outcome, StageResult, StageStatus};
pub use pipeline::{Pipeline, Stage, Sink};
pub use process::{ExitStatus, Process};
