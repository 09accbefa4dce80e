//! Debugger Gateway: the capability set the orchestrators need from the
//! external machine-code debugger, plus the event vocabulary its listeners
//! consume. The concrete adapter lives in [`mi_session`]; the event pump and
//! the immediate/enqueued command dispatch live in [`driver`].

pub mod driver;
pub mod mi;
pub mod mi_session;
#[cfg(test)]
pub mod testing;

pub use driver::{DebuggerDriver, Gateway};

use crate::code_addr::CodeAddr;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Global thread numbering of the debugger, stable across the run.
pub type ThreadId = u32;

/// The primary thread of the inferior.
pub const MAIN_THREAD: ThreadId = 1;

/// Debugger-assigned breakpoint number, reported back on stops.
pub type BreakpointNum = u32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointLocation {
    Symbol(String),
    Address(CodeAddr),
}

impl fmt::Display for BreakpointLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakpointLocation::Symbol(name) => f.write_str(name),
            BreakpointLocation::Address(addr) => f.write_str(&addr.breakpoint_location()),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Ordinary code breakpoint.
    Code,
    /// Data watchpoint firing on read or write of the expression.
    AccessWatch,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointSpec {
    pub location: BreakpointLocation,
    /// Only this thread may be stopped by the breakpoint.
    pub thread: Option<ThreadId>,
    /// Released by the debugger once hit.
    pub temporary: bool,
    pub kind: BreakpointKind,
}

impl BreakpointSpec {
    pub fn code(location: BreakpointLocation) -> BreakpointSpec {
        BreakpointSpec {
            location,
            thread: None,
            temporary: false,
            kind: BreakpointKind::Code,
        }
    }

    pub fn temporary_at(location: BreakpointLocation) -> BreakpointSpec {
        BreakpointSpec {
            temporary: true,
            ..BreakpointSpec::code(location)
        }
    }

    pub fn thread_scoped(location: BreakpointLocation, thread: ThreadId) -> BreakpointSpec {
        BreakpointSpec {
            thread: Some(thread),
            ..BreakpointSpec::code(location)
        }
    }

    pub fn access_watch(variable: &str) -> BreakpointSpec {
        BreakpointSpec {
            location: BreakpointLocation::Symbol(variable.to_owned()),
            thread: None,
            temporary: false,
            kind: BreakpointKind::AccessWatch,
        }
    }
}

/// Opaque per-debugger handle for an installed breakpoint. Owned by the
/// orchestrator from installation until the debugger releases it on hit
/// (temporary) or an explicit delete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointHandle {
    pub number: BreakpointNum,
    pub spec: BreakpointSpec,
}

/// The control-command surface the core consumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GdbCommand {
    Run,
    Continue,
    Finish,
    SelectThread(ThreadId),
    SetSchedulerLocking(bool),
    SetPagination(bool),
    SetConfirm(bool),
    CatchSyscall(String),
    DeleteBreakpoints,
    Quit,
}

impl GdbCommand {
    /// Commands that set the target running; nothing else may be issued
    /// until the next stop.
    pub fn resumes_target(&self) -> bool {
        matches!(self, GdbCommand::Run | GdbCommand::Continue | GdbCommand::Finish)
    }
}

impl fmt::Display for GdbCommand {
    /// The CLI spelling, used for logging and command-trace assertions.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn on_off(value: bool) -> &'static str {
            if value {
                "on"
            } else {
                "off"
            }
        }
        match self {
            GdbCommand::Run => f.write_str("run"),
            GdbCommand::Continue => f.write_str("continue"),
            GdbCommand::Finish => f.write_str("finish"),
            GdbCommand::SelectThread(thread) => write!(f, "thread {}", thread),
            GdbCommand::SetSchedulerLocking(value) => {
                write!(f, "set scheduler-locking {}", on_off(*value))
            }
            GdbCommand::SetPagination(value) => write!(f, "set pagination {}", on_off(*value)),
            GdbCommand::SetConfirm(value) => write!(f, "set confirm {}", on_off(*value)),
            GdbCommand::CatchSyscall(name) => write!(f, "catch syscall {}", name),
            GdbCommand::DeleteBreakpoints => f.write_str("delete"),
            GdbCommand::Quit => f.write_str("quit"),
        }
    }
}

/// A stop of the inferior. `breakpoint` is absent for signals and for the
/// completion of a `finish`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StopEvent {
    pub thread: ThreadId,
    pub pc: Option<CodeAddr>,
    pub breakpoint: Option<BreakpointNum>,
}

/// A thread was born. The carried id is the thread the debugger considers
/// current when it reports the birth, i.e. the creator while the scheduler
/// is locked; the born thread itself is recovered from the tracker diff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewThreadEvent {
    pub inferior_thread: ThreadId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadExitedEvent {
    pub thread: ThreadId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitedEvent {
    pub exit_code: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebuggerEvent {
    Stop(StopEvent),
    NewThread(NewThreadEvent),
    ThreadExited(ThreadExitedEvent),
    Exited(ExitedEvent),
}

impl DebuggerEvent {
    pub fn stream(&self) -> EventStream {
        match self {
            DebuggerEvent::Stop(_) => EventStream::Stop,
            DebuggerEvent::NewThread(_) => EventStream::NewThread,
            DebuggerEvent::ThreadExited(_) => EventStream::ThreadExited,
            DebuggerEvent::Exited(_) => EventStream::Exited,
        }
    }
}

/// The event streams listeners can connect to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventStream {
    Stop,
    NewThread,
    ThreadExited,
    Exited,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("debugger command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("could not set breakpoint at {location}: {message}")]
    Breakpoint { location: String, message: String },
    #[error("could not launch debugger: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("debugger session ended unexpectedly")]
    Disconnected,
    #[error("malformed debugger output: {0}")]
    Protocol(String),
}

/// What a concrete debugger adapter must provide. All operations are
/// synchronous against the debugger; deferral is layered on top by the
/// [`Gateway`].
pub trait Debugger {
    fn execute(&mut self, command: &GdbCommand) -> Result<(), GatewayError>;

    fn insert_breakpoint(&mut self, spec: &BreakpointSpec)
        -> Result<BreakpointHandle, GatewayError>;

    fn live_threads(&mut self) -> Result<Vec<ThreadId>, GatewayError>;

    fn selected_thread(&mut self) -> Result<ThreadId, GatewayError>;

    fn current_pc(&mut self) -> Result<CodeAddr, GatewayError>;

    /// PC of the frame one older than the current one; during recording this
    /// is the caller of the thread-creation syscall stub.
    fn caller_pc(&mut self) -> Result<CodeAddr, GatewayError>;

    /// Blocks until the next event. `None` means the debugger terminated.
    fn wait_event(&mut self) -> Result<Option<DebuggerEvent>, GatewayError>;
}

/// A callable subscribed to one or more event streams. Listeners must be
/// short and must never issue `continue` or `thread N` immediately; such
/// commands go through the gateway's enqueue variants.
pub trait EventListener {
    fn on_event(
        &mut self,
        gdb: &mut Gateway<'_>,
        event: &DebuggerEvent,
    ) -> Result<(), crate::error::Error>;
}

pub type ListenerRef = Rc<RefCell<dyn EventListener>>;
pub type ListenerId = u64;
