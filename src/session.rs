//! Session lifecycle: configuration, callback registration, and the run loop.
//!
//! One [`SessionController`] owns one attach-to-exit lifecycle for one target
//! program. The controller fixes the architecture, holds the two registered
//! analysis callbacks, and drives the engine until the target has exited,
//! after which the accumulated state is immutable.

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use log::{debug, info};

use crate::engine::{EngineError, EventSink, InstrumentationEngine, TargetExit, TargetSpec};
use crate::{Architecture, EventClass, InstructionEvent, SessionError};

/// Lifecycle states of an [`AnalysisSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No architecture fixed yet.
    Unconfigured,
    /// Architecture fixed; target not started.
    Configured,
    /// Target executing under instrumentation.
    Running,
    /// Finalization complete; terminal.
    Finalized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Unconfigured => write!(f, "unconfigured"),
            SessionState::Configured => write!(f, "configured"),
            SessionState::Running => write!(f, "running"),
            SessionState::Finalized => write!(f, "finalized"),
        }
    }
}

/// Accumulated analysis state for one attach-to-exit lifecycle.
///
/// The instruction counter starts at zero and only ever moves forward: it is
/// incremented through [`record_instruction`](Self::record_instruction) by
/// the per-instruction handler and read back for reporting once the target
/// has exited.
#[derive(Debug)]
pub struct AnalysisSession {
    architecture: Architecture,
    instruction_count: u64,
    state: SessionState,
}

impl AnalysisSession {
    pub(crate) fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            instruction_count: 0,
            state: SessionState::Configured,
        }
    }

    /// ISA this session was configured for.
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    /// Instructions observed so far.
    pub fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Count one retired instruction.
    ///
    /// Single-writer: only the per-instruction handler calls this, under the
    /// engine's serialized-delivery guarantee. Should an engine ever deliver
    /// from multiple contexts, this is the seam to upgrade to an atomic.
    pub fn record_instruction(&mut self) {
        self.instruction_count += 1;
    }

    fn begin(&mut self) {
        self.state = SessionState::Running;
    }

    fn finalize(&mut self) {
        self.state = SessionState::Finalized;
    }
}

/// Per-instruction analysis callback.
///
/// Runs once per retired instruction of the target, so it must stay cheap:
/// no I/O, no blocking, nothing beyond updating session state.
pub type InstructionCallback = Box<dyn FnMut(&mut AnalysisSession, &InstructionEvent)>;

/// Finalization callback; reads the session after the target has exited.
pub type ExitCallback = Box<dyn FnMut(&AnalysisSession)>;

/// A handler for one of the two dispatched event classes.
pub enum Handler {
    /// Handler for [`EventClass::BeforeInstruction`].
    Instruction(InstructionCallback),
    /// Handler for [`EventClass::OnExit`].
    Exit(ExitCallback),
}

impl Handler {
    /// Wrap a per-instruction closure.
    pub fn instruction<F>(f: F) -> Self
    where
        F: FnMut(&mut AnalysisSession, &InstructionEvent) + 'static,
    {
        Handler::Instruction(Box::new(f))
    }

    /// Wrap a finalization closure.
    pub fn exit<F>(f: F) -> Self
    where
        F: FnMut(&AnalysisSession) + 'static,
    {
        Handler::Exit(Box::new(f))
    }
}

/// The immutable record of a finalized session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Path of the instrumented target.
    pub target: PathBuf,
    /// ISA the session ran under.
    pub architecture: Architecture,
    /// Total retired instructions observed.
    pub instructions: u64,
    /// How the target terminated.
    pub exit: TargetExit,
}

/// Serializes engine events into the registered handlers and polices the
/// delivery contract.
struct Dispatch<'a> {
    session: &'a mut AnalysisSession,
    on_instruction: &'a mut dyn FnMut(&mut AnalysisSession, &InstructionEvent),
    on_exit: &'a mut dyn FnMut(&AnalysisSession),
    exit_seen: bool,
}

impl EventSink for Dispatch<'_> {
    fn before_instruction(&mut self, event: InstructionEvent) -> Result<(), SessionError> {
        if self.exit_seen {
            return Err(SessionError::ContractViolation(format!(
                "instruction event at pc {:#x} delivered after target exit",
                event.pc
            )));
        }
        (self.on_instruction)(self.session, &event);
        Ok(())
    }

    fn target_exited(&mut self) -> Result<(), SessionError> {
        if self.exit_seen {
            return Err(SessionError::ContractViolation(
                "target exit delivered twice".into(),
            ));
        }
        self.exit_seen = true;
        (self.on_exit)(self.session);
        Ok(())
    }
}

/// Orchestrates one analysis session: architecture configuration, callback
/// registration, and the blocking run of the target program.
pub struct SessionController<E> {
    engine: E,
    target: PathBuf,
    target_args: Vec<OsString>,
    session: Option<AnalysisSession>,
    on_instruction: Option<InstructionCallback>,
    on_exit: Option<ExitCallback>,
}

impl<E: InstrumentationEngine> SessionController<E> {
    /// Controller for running `target` under `engine`.
    pub fn new(engine: E, target: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            target: target.into(),
            target_args: Vec::new(),
            session: None,
            on_instruction: None,
            on_exit: None,
        }
    }

    /// Arguments passed through to the target program.
    pub fn target_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.target_args = args.into_iter().map(Into::into).collect();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Unconfigured, AnalysisSession::state)
    }

    /// Fix the target ISA for this session.
    ///
    /// Must be called exactly once, before [`start`](Self::start).
    pub fn configure(&mut self, architecture: Architecture) -> Result<(), SessionError> {
        if self.session.is_some() {
            return Err(SessionError::Configuration(
                "architecture is already configured for this session".into(),
            ));
        }
        if architecture == Architecture::Unknown || !self.engine.supports(architecture) {
            return Err(SessionError::Configuration(format!(
                "engine does not support {} targets",
                architecture
            )));
        }

        debug!("session configured for {}", architecture);
        self.session = Some(AnalysisSession::new(architecture));
        Ok(())
    }

    /// Attach `handler` to `class`.
    ///
    /// Each of the two dispatched event classes takes exactly one handler,
    /// and the handler kind must match the class.
    pub fn register_callback(
        &mut self,
        class: EventClass,
        handler: Handler,
    ) -> Result<(), SessionError> {
        match (class, handler) {
            (EventClass::BeforeInstruction, Handler::Instruction(f)) => {
                if self.on_instruction.is_some() {
                    return Err(registration(class, "a handler is already registered"));
                }
                self.on_instruction = Some(f);
            }
            (EventClass::OnExit, Handler::Exit(f)) => {
                if self.on_exit.is_some() {
                    return Err(registration(class, "a handler is already registered"));
                }
                self.on_exit = Some(f);
            }
            (class, _) => {
                return Err(registration(class, "handler kind does not match the event class"))
            }
        }
        Ok(())
    }

    /// Run the target to natural exit under instrumentation.
    ///
    /// Blocks for the whole target lifetime; there is no cancellation path.
    /// Consumes the controller: a failed launch requires a freshly configured
    /// session, and a finished one cannot be re-run.
    pub fn start(mut self) -> Result<SessionReport, SessionError> {
        let mut session = self.session.take().ok_or_else(|| {
            SessionError::Configuration("start() requires a configured architecture".into())
        })?;
        let mut on_instruction = self.on_instruction.take().ok_or_else(|| {
            SessionError::Configuration("no before-instruction handler registered".into())
        })?;
        let mut on_exit = self
            .on_exit
            .take()
            .ok_or_else(|| SessionError::Configuration("no on-exit handler registered".into()))?;

        let target = TargetSpec {
            path: self.target.clone(),
            args: self.target_args.clone(),
            architecture: session.architecture(),
        };

        info!(
            "starting {} under instrumentation as {}",
            target.path.display(),
            target.architecture
        );
        session.begin();

        let exit = {
            let mut dispatch = Dispatch {
                session: &mut session,
                on_instruction: &mut *on_instruction,
                on_exit: &mut *on_exit,
                exit_seen: false,
            };
            let exit = self
                .engine
                .run(&target, &mut dispatch)
                .map_err(flatten_engine_error)?;
            if !dispatch.exit_seen {
                return Err(SessionError::ContractViolation(
                    "engine returned without delivering target exit".into(),
                ));
            }
            exit
        };

        session.finalize();
        info!(
            "target exited ({}); {} instructions retired",
            exit,
            session.instruction_count()
        );

        Ok(SessionReport {
            target: target.path,
            architecture: session.architecture(),
            instructions: session.instruction_count(),
            exit,
        })
    }
}

fn registration(class: EventClass, reason: &str) -> SessionError {
    SessionError::Registration {
        class,
        reason: reason.into(),
    }
}

/// Engine failures map onto the session error taxonomy: launch problems stay
/// launch problems, while an engine that cannot finish delivering events has
/// broken its contract.
fn flatten_engine_error(err: EngineError) -> SessionError {
    match err {
        EngineError::Analysis(inner) => inner,
        EngineError::Launch(msg) => SessionError::Launch(msg),
        EngineError::Trace(msg) => SessionError::ContractViolation(msg),
        EngineError::Io(e) => SessionError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use rstest::rstest;

    use super::*;
    use crate::engine::scripted::{ScriptedEngine, ScriptedEvent};

    /// Controller wired with the plain counting analysis.
    fn wired<E: InstrumentationEngine>(engine: E) -> SessionController<E> {
        let mut controller = SessionController::new(engine, "/bin/true");
        controller.configure(Architecture::X86_64).unwrap();
        controller
            .register_callback(
                EventClass::BeforeInstruction,
                Handler::instruction(|session, _event| session.record_instruction()),
            )
            .unwrap();
        controller
            .register_callback(EventClass::OnExit, Handler::exit(|_session| {}))
            .unwrap();
        controller
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(5)]
    #[case(1000)]
    fn test_count_matches_retired_instructions(#[case] n: u64) {
        let report = wired(ScriptedEngine::retiring(n)).start().unwrap();
        assert_eq!(report.instructions, n);
        assert_eq!(report.exit, TargetExit::Exited(0));
    }

    #[test]
    fn test_events_arrive_in_retirement_order() {
        let pcs = vec![0x10, 0x14, 0x18, 0x1c];
        let mut script: Vec<ScriptedEvent> = pcs.iter().map(|&pc| ScriptedEvent::Step(pc)).collect();
        script.push(ScriptedEvent::Exit(0));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);

        let mut controller = SessionController::new(ScriptedEngine::new(script), "/bin/true");
        controller.configure(Architecture::X86_64).unwrap();
        controller
            .register_callback(
                EventClass::BeforeInstruction,
                Handler::instruction(move |session, event| {
                    sink.borrow_mut().push(event.pc);
                    session.record_instruction();
                }),
            )
            .unwrap();
        controller
            .register_callback(EventClass::OnExit, Handler::exit(|_session| {}))
            .unwrap();
        controller.start().unwrap();

        assert_eq!(*seen.borrow(), pcs);
    }

    #[test]
    fn test_exit_handler_sees_the_final_count() {
        let observed = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&observed);

        let mut controller = SessionController::new(ScriptedEngine::retiring(5), "/bin/true");
        controller.configure(Architecture::X86_64).unwrap();
        controller
            .register_callback(
                EventClass::BeforeInstruction,
                Handler::instruction(|session, _event| session.record_instruction()),
            )
            .unwrap();
        controller
            .register_callback(
                EventClass::OnExit,
                Handler::exit(move |session| {
                    *sink.borrow_mut() = Some(session.instruction_count());
                }),
            )
            .unwrap();
        controller.start().unwrap();

        assert_eq!(*observed.borrow(), Some(5));
    }

    #[test]
    fn test_configure_twice_is_rejected_and_leaves_state_unchanged() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(1), "/bin/true");
        controller.configure(Architecture::X86_64).unwrap();

        let err = controller.configure(Architecture::AArch64).unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(controller.state(), SessionState::Configured);
    }

    #[test]
    fn test_unknown_architecture_is_rejected() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(1), "/bin/true");

        let err = controller.configure(Architecture::Unknown).unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
        assert_eq!(controller.state(), SessionState::Unconfigured);
    }

    #[test]
    fn test_start_requires_configuration() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(1), "/bin/true");
        controller
            .register_callback(
                EventClass::BeforeInstruction,
                Handler::instruction(|session, _event| session.record_instruction()),
            )
            .unwrap();
        controller
            .register_callback(EventClass::OnExit, Handler::exit(|_session| {}))
            .unwrap();

        let err = controller.start().unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn test_start_requires_both_handlers() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(1), "/bin/true");
        controller.configure(Architecture::X86_64).unwrap();

        let err = controller.start().unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn test_mismatched_handler_kind_is_rejected() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(1), "/bin/true");

        let err = controller
            .register_callback(EventClass::BeforeInstruction, Handler::exit(|_session| {}))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Registration {
                class: EventClass::BeforeInstruction,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(1), "/bin/true");
        controller
            .register_callback(EventClass::OnExit, Handler::exit(|_session| {}))
            .unwrap();

        let err = controller
            .register_callback(EventClass::OnExit, Handler::exit(|_session| {}))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Registration {
                class: EventClass::OnExit,
                ..
            }
        ));
    }

    #[test]
    fn test_double_exit_is_a_contract_violation() {
        let script = vec![
            ScriptedEvent::Step(0x1000),
            ScriptedEvent::Exit(0),
            ScriptedEvent::Exit(0),
        ];
        let err = wired(ScriptedEngine::new(script)).start().unwrap_err();
        assert!(matches!(err, SessionError::ContractViolation(_)));
    }

    #[test]
    fn test_instruction_after_exit_is_a_contract_violation() {
        let script = vec![ScriptedEvent::Exit(0), ScriptedEvent::Step(0x1000)];
        let err = wired(ScriptedEngine::new(script)).start().unwrap_err();
        assert!(matches!(err, SessionError::ContractViolation(_)));
    }

    #[test]
    fn test_missing_exit_is_a_contract_violation() {
        let script = vec![ScriptedEvent::Step(0x1000)];
        let err = wired(ScriptedEngine::new(script)).start().unwrap_err();
        assert!(matches!(err, SessionError::ContractViolation(_)));
    }

    /// Engine that claims success without delivering any events.
    struct SilentEngine;

    impl InstrumentationEngine for SilentEngine {
        fn supports(&self, _architecture: Architecture) -> bool {
            true
        }

        fn run(
            &mut self,
            _target: &TargetSpec,
            _sink: &mut dyn EventSink,
        ) -> Result<TargetExit, EngineError> {
            Ok(TargetExit::Exited(0))
        }
    }

    #[test]
    fn test_exit_must_be_delivered_not_just_returned() {
        let err = wired(SilentEngine).start().unwrap_err();
        assert!(matches!(err, SessionError::ContractViolation(_)));
    }

    #[test]
    fn test_lifecycle_states_advance_in_order() {
        let mut controller = SessionController::new(ScriptedEngine::retiring(2), "/bin/true");
        assert_eq!(controller.state(), SessionState::Unconfigured);

        controller.configure(Architecture::X86_64).unwrap();
        assert_eq!(controller.state(), SessionState::Configured);

        let running = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&running);
        controller
            .register_callback(
                EventClass::BeforeInstruction,
                Handler::instruction(move |session, _event| {
                    *sink.borrow_mut() = Some(session.state());
                    session.record_instruction();
                }),
            )
            .unwrap();
        controller
            .register_callback(EventClass::OnExit, Handler::exit(|_session| {}))
            .unwrap();

        controller.start().unwrap();
        assert_eq!(*running.borrow(), Some(SessionState::Running));
    }
}
