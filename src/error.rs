use crate::checkpoint::LogFileError;
use crate::gdb::GatewayError;
use crate::session::record_session::RecordError;
use crate::session::replay_session::ReplayError;
use thiserror::Error;

/// Top-level error taxonomy. Every failure surfaces here and terminates the
/// run; the only condition swallowed lower down is a spurious stop with no
/// attached breakpoint.
#[derive(Debug, Error)]
pub enum Error {
    /// A symbol was unknown, a watchpoint limit was exceeded, or the target
    /// could not be paused at entry. Fatal before any useful work.
    #[error("setup failed: {0}")]
    SetupFailed(String),
    /// The gateway surfaced a debugger failure; propagated verbatim.
    #[error(transparent)]
    Debugger(#[from] GatewayError),
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    LogFile(#[from] LogFileError),
}

pub type Result<T> = std::result::Result<T, Error>;
