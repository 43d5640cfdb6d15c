//! ptrace-backed engine: single-steps a traced child process on Linux.

use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use log::debug;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use super::{EngineError, EventSink, InstrumentationEngine, TargetExit, TargetSpec};
use crate::{loader, Architecture, InstructionEvent};

/// Engine that runs the target as a ptraced child, one instruction at a time.
///
/// Every `PTRACE_SINGLESTEP` retires exactly one instruction, so the delivery
/// contract maps directly onto the stop loop: the instruction event fires at
/// each stop, before the pending instruction executes, and the exit event
/// fires when the child leaves the stop loop for good.
#[derive(Debug, Clone, Copy, Default)]
pub struct PtraceEngine;

impl PtraceEngine {
    /// Construct a new PtraceEngine.
    pub fn new() -> Self {
        PtraceEngine
    }
}

impl InstrumentationEngine for PtraceEngine {
    fn supports(&self, architecture: Architecture) -> bool {
        // Single-stepping only works for binaries the host CPU executes.
        architecture == Architecture::host() && architecture != Architecture::Unknown
    }

    fn run(
        &mut self,
        target: &TargetSpec,
        sink: &mut dyn EventSink,
    ) -> Result<TargetExit, EngineError> {
        let info = loader::inspect_file(&target.path)
            .map_err(|e| EngineError::Launch(e.to_string()))?;
        if info.architecture != target.architecture {
            return Err(EngineError::Launch(format!(
                "{} is a {} binary but the session is configured for {}",
                target.path.display(),
                info.architecture,
                target.architecture
            )));
        }

        let mut command = Command::new(&target.path);
        command.args(&target.args);
        // The child asks to be traced before exec; the kernel then stops it
        // with SIGTRAP once the new image is in place.
        unsafe {
            command.pre_exec(|| {
                ptrace::traceme().map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            });
        }

        let child = command.spawn().map_err(|e| {
            EngineError::Launch(format!("cannot spawn {}: {}", target.path.display(), e))
        })?;
        let pid = Pid::from_raw(child.id() as i32);
        debug!("spawned {} as pid {}", target.path.display(), pid);

        let result = step_to_exit(pid, sink);
        if result.is_err() {
            // Don't leave a stopped tracee behind.
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
        result
    }
}

/// Single-step `pid` from the post-exec stop until it terminates.
fn step_to_exit(pid: Pid, sink: &mut dyn EventSink) -> Result<TargetExit, EngineError> {
    match wait_on(pid)? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        status => {
            return Err(EngineError::Launch(format!(
                "expected the post-exec stop, got {:?}",
                status
            )))
        }
    }

    let mut resume_signal: Option<Signal> = None;
    loop {
        sink.before_instruction(InstructionEvent { pc: program_counter(pid) })?;
        ptrace::step(pid, resume_signal.take())
            .map_err(|errno| EngineError::Trace(format!("single-step failed: {}", errno)))?;

        match wait_on(pid)? {
            WaitStatus::Exited(_, code) => {
                sink.target_exited()?;
                return Ok(TargetExit::Exited(code));
            }
            WaitStatus::Signaled(_, signal, _) => {
                debug!("target killed by {:?}", signal);
                sink.target_exited()?;
                return Ok(TargetExit::Signaled(signal as i32));
            }
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            WaitStatus::Stopped(_, signal) => {
                // Queue the signal for re-injection so the target's handler
                // runs under trace.
                debug!("re-injecting {:?}", signal);
                resume_signal = Some(signal);
            }
            status => {
                return Err(EngineError::Trace(format!(
                    "unexpected wait status {:?}",
                    status
                )))
            }
        }
    }
}

fn wait_on(pid: Pid) -> Result<WaitStatus, EngineError> {
    waitpid(pid, None).map_err(|errno| EngineError::Trace(format!("waitpid failed: {}", errno)))
}

/// Program counter of the stopped tracee, where the host exposes it cheaply.
#[cfg(target_arch = "x86_64")]
fn program_counter(pid: Pid) -> u64 {
    ptrace::getregs(pid).map(|regs| regs.rip).unwrap_or(0)
}

#[cfg(not(target_arch = "x86_64"))]
fn program_counter(_pid: Pid) -> u64 {
    0
}
