use std::io;

use thiserror::Error;

use crate::outcome::Outcome;

/// A call argument that cannot be turned into command-line tokens.
///
/// Returned while a [`Command`](crate::Command) is being built, never deferred to
/// execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("program name must not be empty")]
    EmptyProgram,

    #[error("keyword name must not be empty")]
    EmptyKeyword,

    #[error("positional argument {index} follows keyword `{keyword}`")]
    PositionalAfterKeyword { index: usize, keyword: String },

    #[error("keyword `{keyword}` has unencodable value of type {kind}")]
    Unencodable { keyword: String, kind: &'static str },

    #[error("positional argument {index} has unencodable value of type {kind}")]
    UnencodablePositional { index: usize, kind: &'static str },

    #[error("unknown execution option `{0}`")]
    UnknownOption(String),

    #[error("execution option `{option}` expects {expected}, got {kind}")]
    OptionType {
        option: String,
        expected: &'static str,
        kind: &'static str,
    },
}

/// Errors produced while running commands and pipelines.
///
/// Variants that describe a finished (or cancelled) run carry the full [`Outcome`],
/// including every byte captured before the failure.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("command failed with exit code {}: {}", .0.code(), .0.command_line())]
    CommandFailed(Box<Outcome>),

    #[error("pipeline broken, stage {} was killed: {}", broken_stage(.0), .0.command_line())]
    PipelineBroken(Box<Outcome>),

    #[error("cancelled: {}", .0.command_line())]
    Cancelled(Box<Outcome>),

    #[error("timed out: {}", .0.command_line())]
    TimedOut(Box<Outcome>),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn broken_stage(outcome: &Outcome) -> String {
    match outcome.broken_stage() {
        Some(idx) => idx.to_string(),
        None => "?".to_string(),
    }
}

impl Error {
    /// The outcome carried by this error, if the pipeline ran at all.
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            Error::CommandFailed(o)
            | Error::PipelineBroken(o)
            | Error::Cancelled(o)
            | Error::TimedOut(o) => Some(o),
            _ => None,
        }
    }

    /// Like [`outcome`](Self::outcome), but takes ownership.
    pub fn into_outcome(self) -> Option<Outcome> {
        match self {
            Error::CommandFailed(o)
            | Error::PipelineBroken(o)
            | Error::Cancelled(o)
            | Error::TimedOut(o) => Some(*o),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
