//! The record orchestrator: a two-pass recorder. Pass 1 catches the
//! thread-creation syscall to collect the set of PCs threads are created
//! from. Pass 2 re-runs the target under access watchpoints on the declared
//! shared variables plus breakpoints at the creation PCs and start routines,
//! appending a record on every stop. The creation matcher then repairs the
//! creator/child ordering offline and the log goes to disk.

use super::creation_matcher::{CreationMatcher, MatcherError, ThreadCreation};
use crate::checkpoint::{CheckpointAction, CheckpointLog, CheckpointRecord};
use crate::code_addr::CodeAddr;
use crate::error::Error;
use crate::gdb::{
    BreakpointLocation, BreakpointSpec, DebuggerEvent, EventListener, Gateway, GdbCommand,
    NewThreadEvent, StopEvent,
};
use crate::thread_tracker::{ThreadTracker, TrackerError};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecordError {
    /// The matcher's post-conditions failed; the recording is rejected but
    /// the raw sequence is kept for inspection.
    #[error("creation matching failed: {source}; raw checkpoint log preserved at {}", .raw_path.display())]
    Matcher {
        #[source]
        source: MatcherError,
        raw_path: PathBuf,
    },
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Pass {
    /// Pass 1: the target runs once with a syscall catchpoint; every stop
    /// contributes its caller's PC to the creation-site set.
    DiscoverCreationSites,
    /// Between passes: waiting for the fresh run to pause at `main`.
    AwaitSecondEntry,
    /// Pass 2: every stop appends a checkpoint record.
    Recording,
    /// The log is on disk and `quit` has been issued.
    Done,
}

pub struct RecordSession {
    shared_variables: Vec<String>,
    start_routines: Vec<String>,
    output: PathBuf,
    pass: Pass,
    creation_pcs: BTreeSet<CodeAddr>,
    records: Vec<CheckpointRecord>,
    next_id: u64,
    creations: Vec<ThreadCreation>,
    tracker: ThreadTracker,
}

impl RecordSession {
    pub fn new(
        shared_variables: Vec<String>,
        start_routines: Vec<String>,
        output: PathBuf,
    ) -> RecordSession {
        RecordSession {
            shared_variables,
            start_routines,
            output,
            pass: Pass::DiscoverCreationSites,
            creation_pcs: BTreeSet::new(),
            records: Vec::new(),
            next_id: 0,
            creations: Vec::new(),
            tracker: ThreadTracker::new(),
        }
    }

    /// Kicks off pass 1: non-interactive debugger, a catchpoint on the
    /// thread-creation syscall, and a free run to exit.
    pub fn start(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        gdb.execute(&GdbCommand::SetPagination(false))?;
        gdb.execute(&GdbCommand::SetConfirm(false))?;
        gdb.execute(&GdbCommand::CatchSyscall("clone".to_owned()))?;
        gdb.execute(&GdbCommand::Run)?;
        Ok(())
    }

    pub fn finished(&self) -> bool {
        self.pass == Pass::Done
    }

    fn on_stop(&mut self, gdb: &mut Gateway<'_>, stop: &StopEvent) -> Result<(), Error> {
        match self.pass {
            Pass::DiscoverCreationSites => {
                // The stop is inside the syscall stub; the interesting PC is
                // the caller's, one frame older.
                let pc = gdb.caller_pc()?;
                self.creation_pcs.insert(pc);
                gdb.enqueue_execute(GdbCommand::Continue);
                Ok(())
            }
            Pass::AwaitSecondEntry => self.arm_recording(gdb),
            Pass::Recording => {
                let pc = match stop.pc {
                    Some(pc) => pc,
                    None => gdb.current_pc()?,
                };
                self.append_record(stop.thread, pc);
                gdb.enqueue_execute(GdbCommand::Continue);
                Ok(())
            }
            Pass::Done => Ok(()),
        }
    }

    /// The second run is paused at `main`: install everything pass 2
    /// observes through, then set it running.
    fn arm_recording(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        for variable in &self.shared_variables {
            gdb.insert_breakpoint(&BreakpointSpec::access_watch(variable))
                .map_err(|err| Error::SetupFailed(err.to_string()))?;
        }
        for pc in &self.creation_pcs {
            gdb.insert_breakpoint(&BreakpointSpec::code(BreakpointLocation::Address(*pc)))
                .map_err(|err| Error::SetupFailed(err.to_string()))?;
        }
        for routine in &self.start_routines {
            gdb.insert_breakpoint(&BreakpointSpec::code(BreakpointLocation::Symbol(
                routine.clone(),
            )))
            .map_err(|err| Error::SetupFailed(err.to_string()))?;
        }
        self.tracker = ThreadTracker::new();
        self.pass = Pass::Recording;
        info!(
            "recording with {} watchpoint(s) and {} creation site(s)",
            self.shared_variables.len(),
            self.creation_pcs.len()
        );
        gdb.enqueue_execute(GdbCommand::Continue);
        Ok(())
    }

    fn append_record(&mut self, thread: crate::gdb::ThreadId, pc: CodeAddr) {
        debug!(
            "checkpoint {} at {} on thread {}",
            self.next_id, pc, thread
        );
        self.records.push(CheckpointRecord {
            id: self.next_id,
            thread,
            location: pc,
            action: CheckpointAction::SharedAccess,
        });
        self.next_id += 1;
    }

    fn on_new_thread(&mut self, gdb: &mut Gateway<'_>, event: &NewThreadEvent) -> Result<(), Error> {
        if self.pass != Pass::Recording {
            return Ok(());
        }
        let live = gdb.live_threads()?;
        self.tracker.refresh(live);
        let created = self
            .tracker
            .newly_born_singleton()
            .map_err(RecordError::from)?;
        debug!(
            "thread {} created thread {}",
            event.inferior_thread, created
        );
        self.creations.push(ThreadCreation {
            creator: event.inferior_thread,
            created,
        });
        Ok(())
    }

    fn on_exited(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        match self.pass {
            Pass::DiscoverCreationSites => {
                debug!(
                    "pass 1 done; {} creation site(s) found",
                    self.creation_pcs.len()
                );
                self.pass = Pass::AwaitSecondEntry;
                gdb.enqueue_execute(GdbCommand::DeleteBreakpoints);
                gdb.enqueue_insert_breakpoint(BreakpointSpec::temporary_at(
                    BreakpointLocation::Symbol("main".to_owned()),
                ));
                gdb.enqueue_execute(GdbCommand::Run);
                Ok(())
            }
            Pass::AwaitSecondEntry => Err(Error::SetupFailed(
                "target exited before reaching main".to_owned(),
            )),
            Pass::Recording => {
                self.finish_recording(gdb)?;
                gdb.enqueue_execute(GdbCommand::Quit);
                Ok(())
            }
            Pass::Done => Ok(()),
        }
    }

    fn finish_recording(&mut self, _gdb: &mut Gateway<'_>) -> Result<(), Error> {
        let matcher = CreationMatcher::new(
            self.records.clone(),
            self.creations.clone(),
            self.creation_pcs.clone(),
        );
        let checkpoints = match matcher.into_matched() {
            Ok(checkpoints) => checkpoints,
            Err(source) => {
                let raw_path = raw_log_path(&self.output);
                let raw = CheckpointLog {
                    checkpoints: self.records.clone(),
                    thread_start_routines: self.start_routines.clone(),
                };
                if let Err(err) = raw.save(&raw_path) {
                    warn!("could not preserve raw checkpoint log: {}", err);
                }
                return Err(RecordError::Matcher { source, raw_path }.into());
            }
        };
        let log = CheckpointLog {
            checkpoints,
            thread_start_routines: self.start_routines.clone(),
        };
        log.save(&self.output)?;
        info!(
            "wrote {} checkpoint(s) to {}",
            log.checkpoints.len(),
            self.output.display()
        );
        self.pass = Pass::Done;
        Ok(())
    }

    fn on_thread_exited(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        if self.pass == Pass::Recording {
            let live = gdb.live_threads()?;
            self.tracker.refresh(live);
            debug!("thread exited; {} still live", self.tracker.alive().len());
        }
        Ok(())
    }
}

/// `checkpoints.json` becomes `checkpoints.raw.json`.
fn raw_log_path(output: &Path) -> PathBuf {
    output.with_extension("raw.json")
}

impl EventListener for RecordSession {
    fn on_event(&mut self, gdb: &mut Gateway<'_>, event: &DebuggerEvent) -> Result<(), Error> {
        match event {
            DebuggerEvent::Stop(stop) => self.on_stop(gdb, stop),
            DebuggerEvent::NewThread(new_thread) => self.on_new_thread(gdb, new_thread),
            DebuggerEvent::ThreadExited(_) => self.on_thread_exited(gdb),
            DebuggerEvent::Exited(_) => self.on_exited(gdb),
        }
    }
}
