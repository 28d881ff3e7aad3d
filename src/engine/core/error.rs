use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::types::{Channel, OutputId};

/// Lifecycle phase of a transcode stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePhase {
    Registering,
    Active,
    Finished,
}

impl fmt::Display for StagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StagePhase::Registering => write!(f, "registering"),
            StagePhase::Active => write!(f, "active"),
            StagePhase::Finished => write!(f, "finished"),
        }
    }
}

/// How the encoder process failed to finish cleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitFailure {
    /// Exited on its own with a nonzero status
    Code(i32),
    /// Killed by a signal, no exit code available
    Signal,
    /// Still running when the exit bound elapsed; it was killed
    TimedOut(Duration),
    /// Waiting on the process itself failed
    Unobservable(String),
}

impl fmt::Display for ExitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitFailure::Code(code) => write!(f, "exited with code {}", code),
            ExitFailure::Signal => write!(f, "was terminated by a signal"),
            ExitFailure::TimedOut(bound) => {
                write!(f, "did not exit within {:.1}s", bound.as_secs_f64())
            }
            ExitFailure::Unobservable(reason) => write!(f, "could not be waited on: {}", reason),
        }
    }
}

/// Failures of the transcode stage
///
/// Everything raised after activation is fatal: the stage tears down the
/// encoder, its pipes and all collectors before the error is returned.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("cannot {action} while the stage is {phase}")]
    InvalidState {
        action: &'static str,
        phase: StagePhase,
    },

    #[error("output {0} is already registered")]
    DuplicateOutput(OutputId),

    #[error("invalid options for output {id}: {reason}")]
    InvalidSpec { id: OutputId, reason: String },

    #[error("failed to start encoder '{program}'")]
    ProcessStart {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write to encoder input")]
    PipeWrite(#[source] io::Error),

    #[error("reading {channel} failed: {reason}")]
    Reader { channel: Channel, reason: String },

    #[error("encoder {failure}{}", stderr_suffix(.stderr))]
    AbnormalExit {
        failure: ExitFailure,
        stderr: String,
    },

    #[error("collector for {channel} terminated without end of stream")]
    UnexpectedTermination { channel: Channel },

    #[error("failed to prepare named pipe {}", .path.display())]
    Fifo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("downstream rejected data for {channel}")]
    Downstream {
        channel: Channel,
        #[source]
        source: io::Error,
    },

    #[error("upstream disconnected before end of input")]
    UpstreamClosed,
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl StageError {
    /// Channel the failure is attributed to, if any
    pub fn channel(&self) -> Option<Channel> {
        match self {
            StageError::Reader { channel, .. }
            | StageError::UnexpectedTermination { channel }
            | StageError::Downstream { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}
