//! Instrumentation engines and the contract the session layer consumes.
//!
//! An engine owns the mechanics of running a target program and observing it
//! instruction by instruction. The analysis core stays engine-agnostic: it
//! hands the engine an [`EventSink`] and relies on the delivery contract
//! documented on [`InstrumentationEngine::run`].

#[cfg(target_os = "linux")]
pub mod ptrace;
pub mod scripted;

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use crate::{Architecture, InstructionEvent, SessionError};

/// Errors produced by an engine while launching or tracing a target.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The target could not be started.
    #[error("launch failed: {0}")]
    Launch(String),

    /// The engine lost control of a running target before delivery finished.
    #[error("trace failed: {0}")]
    Trace(String),

    /// The analysis rejected a delivered event.
    #[error(transparent)]
    Analysis(#[from] SessionError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A target program and its command line.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// Path to the target executable.
    pub path: PathBuf,
    /// Arguments passed through to the target.
    pub args: Vec<OsString>,
    /// ISA the session was configured for.
    pub architecture: Architecture,
}

/// How the target terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetExit {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Killed by the given signal.
    Signaled(i32),
}

impl TargetExit {
    /// Shell-convention exit code (128 + signal number for signal deaths).
    pub fn code(&self) -> i32 {
        match *self {
            TargetExit::Exited(code) => code,
            TargetExit::Signaled(signal) => 128 + signal,
        }
    }
}

impl fmt::Display for TargetExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetExit::Exited(code) => write!(f, "exit code {}", code),
            TargetExit::Signaled(signal) => write!(f, "signal {}", signal),
        }
    }
}

/// Receiver for the serialized event stream of one session.
///
/// Both methods return an error when the delivered event breaks the session's
/// invariants; a conforming engine stops at the first error and propagates it.
pub trait EventSink {
    /// One instruction is about to retire.
    fn before_instruction(&mut self, event: InstructionEvent) -> Result<(), SessionError>;

    /// The target has fully exited; no further events may follow.
    fn target_exited(&mut self) -> Result<(), SessionError>;
}

/// Drives a target program and reports its execution to an [`EventSink`].
pub trait InstrumentationEngine {
    /// Whether this engine can instrument targets built for `architecture`.
    fn supports(&self, architecture: Architecture) -> bool;

    /// Run `target` to natural exit, delivering events to `sink`.
    ///
    /// Delivery contract: `before_instruction` is invoked once per retired
    /// instruction, in retirement order, strictly before that instruction's
    /// effects are observable; `target_exited` is invoked exactly once, after
    /// the last instruction event; invocations never overlap. Blocks the
    /// caller for the whole target lifetime.
    fn run(
        &mut self,
        target: &TargetSpec,
        sink: &mut dyn EventSink,
    ) -> Result<TargetExit, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_shell_convention() {
        assert_eq!(TargetExit::Exited(0).code(), 0);
        assert_eq!(TargetExit::Exited(3).code(), 3);
        assert_eq!(TargetExit::Signaled(9).code(), 137);
    }

    #[test]
    fn test_target_exit_display() {
        assert_eq!(TargetExit::Exited(1).to_string(), "exit code 1");
        assert_eq!(TargetExit::Signaled(11).to_string(), "signal 11");
    }
}
