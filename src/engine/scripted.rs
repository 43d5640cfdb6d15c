//! Scripted engine: replays a fixed event stream without a live target.

use log::trace;

use super::{EngineError, EventSink, InstrumentationEngine, TargetExit, TargetSpec};
use crate::{Architecture, InstructionEvent};

/// One entry in a [`ScriptedEngine`] event script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedEvent {
    /// Retire one instruction at the given program counter.
    Step(u64),
    /// Report target exit with the given status code.
    Exit(i32),
}

/// An engine that replays a fixed script instead of running a process.
///
/// This is the harness engine: scripts may be well formed, or deliberately
/// malformed (a second `Exit`, a `Step` after `Exit`, no `Exit` at all) to
/// observe how the analysis layer reacts to a misbehaving engine.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    script: Vec<ScriptedEvent>,
}

impl ScriptedEngine {
    /// Engine that replays `script` verbatim.
    pub fn new(script: Vec<ScriptedEvent>) -> Self {
        Self { script }
    }

    /// Well-formed script retiring exactly `n` instructions, then exiting
    /// cleanly.
    pub fn retiring(n: u64) -> Self {
        let mut script: Vec<ScriptedEvent> =
            (0..n).map(|i| ScriptedEvent::Step(0x1000 + 4 * i)).collect();
        script.push(ScriptedEvent::Exit(0));
        Self::new(script)
    }
}

impl InstrumentationEngine for ScriptedEngine {
    fn supports(&self, _architecture: Architecture) -> bool {
        true
    }

    fn run(
        &mut self,
        target: &TargetSpec,
        sink: &mut dyn EventSink,
    ) -> Result<TargetExit, EngineError> {
        trace!(
            "replaying {} scripted events for {}",
            self.script.len(),
            target.path.display()
        );

        let mut exit = None;
        for event in &self.script {
            match *event {
                ScriptedEvent::Step(pc) => sink.before_instruction(InstructionEvent { pc })?,
                ScriptedEvent::Exit(status) => {
                    sink.target_exited()?;
                    exit = Some(TargetExit::Exited(status));
                }
            }
        }

        exit.ok_or_else(|| EngineError::Trace("script ended without a target exit".into()))
    }
}
