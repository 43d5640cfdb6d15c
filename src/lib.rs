//! Core session, event, and error types for the icount instruction counter.
//!
//! icount runs a target program under an instrumentation engine, counts every
//! retired instruction through a per-instruction callback, and reports the
//! total once the target has exited. The library splits into a session layer
//! (lifecycle and callback dispatch), pluggable engines (live ptrace
//! single-stepping on Linux, a scripted engine for harness use), a goblin
//! based target inspector, and report formatters.
//!
//! # Basic Usage
//!
//! ```rust
//! use icount::{
//!     engine::scripted::{ScriptedEngine, ScriptedEvent},
//!     session::{Handler, SessionController},
//!     Architecture, EventClass,
//! };
//!
//! // Replay a fixed two-instruction execution instead of a live target.
//! let engine = ScriptedEngine::new(vec![
//!     ScriptedEvent::Step(0x1000),
//!     ScriptedEvent::Step(0x1004),
//!     ScriptedEvent::Exit(0),
//! ]);
//!
//! let mut controller = SessionController::new(engine, "/bin/true");
//! controller.configure(Architecture::X86_64).unwrap();
//! controller
//!     .register_callback(
//!         EventClass::BeforeInstruction,
//!         Handler::instruction(|session, _event| session.record_instruction()),
//!     )
//!     .unwrap();
//! controller
//!     .register_callback(
//!         EventClass::OnExit,
//!         Handler::exit(|session| println!("{}", session.instruction_count())),
//!     )
//!     .unwrap();
//!
//! let report = controller.start().unwrap();
//! assert_eq!(report.instructions, 2);
//! ```

pub mod engine;
pub mod format;
pub mod loader;
pub mod session;

use std::fmt;

use clap::ValueEnum;

/// Supported target architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
#[non_exhaustive]
pub enum Architecture {
    /// 32-bit x86
    X86_32,
    /// 64-bit x86
    X86_64,
    /// ARM (32-bit)
    Arm,
    /// AArch64 (ARM 64-bit)
    AArch64,
    /// RISC-V 64-bit
    RiscV64,
    /// Unknown architecture
    #[value(skip)]
    Unknown,
}

impl Architecture {
    /// Architecture of the machine this tool is running on.
    pub fn host() -> Self {
        if cfg!(target_arch = "x86_64") {
            Architecture::X86_64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86_32
        } else if cfg!(target_arch = "arm") {
            Architecture::Arm
        } else if cfg!(target_arch = "aarch64") {
            Architecture::AArch64
        } else if cfg!(target_arch = "riscv64") {
            Architecture::RiscV64
        } else {
            Architecture::Unknown
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::X86_32 => write!(f, "x86-32"),
            Architecture::X86_64 => write!(f, "x86-64"),
            Architecture::Arm => write!(f, "ARM"),
            Architecture::AArch64 => write!(f, "AArch64"),
            Architecture::RiscV64 => write!(f, "RISC-V 64"),
            Architecture::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One instruction about to retire in the target.
///
/// Delivered synchronously to the per-instruction handler and not retained.
/// Beyond identifying the instruction it is opaque to the counting analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionEvent {
    /// Program counter of the instruction; 0 when the engine does not
    /// provide one.
    pub pc: u64,
}

/// Event classes a handler can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum EventClass {
    /// Fires once per retired instruction, before the instruction's effects
    /// are observable.
    BeforeInstruction,
    /// Fires exactly once, after the target has fully exited.
    OnExit,
}

impl fmt::Display for EventClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventClass::BeforeInstruction => write!(f, "before-instruction"),
            EventClass::OnExit => write!(f, "on-exit"),
        }
    }
}

/// Error type for analysis sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Invalid or out-of-order configuration calls.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A handler could not be attached to the requested event class.
    #[error("registration error for {class}: {reason}")]
    Registration {
        /// Event class the registration was aimed at.
        class: EventClass,
        /// Why the registration was refused.
        reason: String,
    },

    /// The target program could not be started under instrumentation.
    #[error("failed to launch target: {0}")]
    Launch(String),

    /// The engine broke its event-delivery contract. Fatal: the count can no
    /// longer be asserted, so no result is emitted.
    #[error("engine contract violation: {0}")]
    ContractViolation(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
