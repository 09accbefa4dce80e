//! The replay orchestrator: an event-driven state machine that drives one
//! suspended multithreaded target forward one checkpoint at a time. With the
//! debugger's scheduler locked, at most one target thread advances between
//! two stops, so every decision here is local: classify the stop, mark the
//! checkpoint, pick the thread owning the next one, and enqueue the switch.

use crate::checkpoint::store::{CheckpointStore, StoreError};
use crate::checkpoint::{CheckpointAction, CheckpointLog, CheckpointRecord};
use crate::error::Error;
use crate::gdb::{
    BreakpointLocation, BreakpointSpec, DebuggerEvent, EventListener, Gateway, GdbCommand,
    StopEvent, ThreadExitedEvent, ThreadId, MAIN_THREAD,
};
use crate::thread_tracker::{ThreadTracker, TrackerError};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum ReplayError {
    /// The target exited while unhit records remained, or a drained thread
    /// stopped with no breakpoint attached.
    #[error(
        "replay diverged; first unreplayed checkpoint is id {} (thread {} at {})",
        .first_unhit.id, .first_unhit.thread, .first_unhit.location
    )]
    Divergence { first_unhit: CheckpointRecord },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

/// Where the orchestrator is in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    /// Waiting for the temporary breakpoint on `main` to fire.
    AwaitingEntry,
    /// Normal checkpoint-by-checkpoint advance.
    Driving,
    /// All records hit; scheduler-locking is off and the target runs to its
    /// natural exit.
    Terminating,
    /// The target exited and `quit` has been issued.
    Done,
}

pub struct ReplaySession {
    log: CheckpointLog,
    store: CheckpointStore,
    tracker: ThreadTracker,
    phase: Phase,
    /// Thread with no remaining checkpoints, being allowed to run to exit.
    /// Stale stops from it are swallowed; its exit resumes the schedule.
    draining: Option<ThreadId>,
}

impl ReplaySession {
    pub fn new(log: CheckpointLog) -> Result<ReplaySession, Error> {
        log.validate()?;
        let store = CheckpointStore::new(&log);
        Ok(ReplaySession {
            log,
            store,
            tracker: ThreadTracker::new(),
            phase: Phase::AwaitingEntry,
            draining: None,
        })
    }

    /// Setup work done before entering the event loop: make the debugger
    /// non-interactive and get the target paused at entry. Everything else
    /// waits for the entry stop.
    pub fn start(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        gdb.execute(&GdbCommand::SetPagination(false))?;
        gdb.execute(&GdbCommand::SetConfirm(false))?;
        gdb.insert_breakpoint(&BreakpointSpec::temporary_at(BreakpointLocation::Symbol(
            "main".to_owned(),
        )))
        .map_err(|err| Error::SetupFailed(err.to_string()))?;
        gdb.execute(&GdbCommand::Run)?;
        Ok(())
    }

    pub fn finished(&self) -> bool {
        self.phase == Phase::Done
    }

    fn on_entry_stop(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        gdb.execute(&GdbCommand::SetSchedulerLocking(true))?;
        // Persistent thread-scoped breakpoints for everything main will hit.
        // Installing once per (thread, location) pair avoids the race where
        // a stop arrives while the handler is still mutating the table.
        for location in self
            .log
            .locations_for(MAIN_THREAD, CheckpointAction::CreatedThread)
        {
            gdb.insert_breakpoint(&BreakpointSpec::thread_scoped(
                BreakpointLocation::Address(location),
                MAIN_THREAD,
            ))
            .map_err(|err| Error::SetupFailed(err.to_string()))?;
        }
        self.phase = Phase::Driving;
        gdb.enqueue_execute(GdbCommand::Continue);
        Ok(())
    }

    fn on_stop(&mut self, gdb: &mut Gateway<'_>, stop: &StopEvent) -> Result<(), Error> {
        match self.phase {
            Phase::AwaitingEntry => self.on_entry_stop(gdb),
            Phase::Driving => self.on_checkpoint_stop(gdb, stop),
            // Stray stops during teardown carry no information.
            Phase::Terminating | Phase::Done => Ok(()),
        }
    }

    fn on_checkpoint_stop(&mut self, gdb: &mut Gateway<'_>, stop: &StopEvent) -> Result<(), Error> {
        if stop.breakpoint.is_none() {
            if self.draining.is_some() {
                // A drained thread may only exit; anything else means the
                // schedule no longer corresponds to the log.
                return Err(self.divergence());
            }
            warn!(
                "ignoring stop with no breakpoint on thread {} at {:?}",
                stop.thread, stop.pc
            );
            gdb.enqueue_execute(GdbCommand::Continue);
            return Ok(());
        }

        let is_next = stop
            .pc
            .map_or(false, |pc| self.store.matches(pc, stop.thread));
        if !is_next {
            // Either a drained thread re-ran one of its stale breakpoints on
            // the way out, or a breakpoint belonging to some future
            // checkpoint fired early (which cannot happen under
            // scheduler-locking). The drain, if any, stays in force until
            // the thread exits.
            debug!(
                "stop on thread {} at {:?} does not match the next checkpoint; ignoring",
                stop.thread, stop.pc
            );
            gdb.enqueue_execute(GdbCommand::Continue);
            return Ok(());
        }

        self.draining = None;

        let hit_id = self.store.next_unhit().map_err(ReplayError::from)?.id;
        self.store.mark_hit(hit_id).map_err(ReplayError::from)?;
        debug!("checkpoint {} hit on thread {}", hit_id, stop.thread);
        self.advance(gdb, stop.thread);
        Ok(())
    }

    /// Decides what runs next after a checkpoint was marked hit.
    fn advance(&mut self, gdb: &mut Gateway<'_>, hit_thread: ThreadId) {
        let next_thread = match self.store.next_unhit() {
            Ok(next) => next.thread,
            Err(_) => {
                // Log exhausted: let the whole target run to its natural end.
                info!("all checkpoints hit; releasing the scheduler");
                self.phase = Phase::Terminating;
                gdb.enqueue_execute(GdbCommand::SetSchedulerLocking(false));
                gdb.enqueue_execute(GdbCommand::Continue);
                return;
            }
        };
        if self.store.remaining_for(hit_thread) == 0 {
            // The thread is done with its checkpoints but still alive; let it
            // run out under the lock. Its exit resumes the schedule.
            debug!("thread {} has no remaining checkpoints; draining", hit_thread);
            self.draining = Some(hit_thread);
            gdb.enqueue_execute(GdbCommand::Continue);
        } else {
            gdb.enqueue_execute(GdbCommand::SelectThread(next_thread));
            gdb.enqueue_execute(GdbCommand::Continue);
        }
    }

    /// A thread was born, necessarily while its creator was running its
    /// clone-site checkpoint. The child is paused under the scheduler lock;
    /// its breakpoints are enqueued so they land at the creator's stop. The
    /// thread switch itself belongs to that stop's handler.
    fn on_new_thread(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        let live = gdb.live_threads()?;
        self.tracker.refresh(live);
        let child = self
            .tracker
            .newly_born_singleton()
            .map_err(ReplayError::from)?;
        debug!("thread {} born; installing its breakpoints", child);
        for location in self.log.locations_for(child, CheckpointAction::CreatorThread) {
            gdb.enqueue_insert_breakpoint(BreakpointSpec::thread_scoped(
                BreakpointLocation::Address(location),
                child,
            ));
        }
        Ok(())
    }

    fn on_thread_exited(&mut self, gdb: &mut Gateway<'_>, event: &ThreadExitedEvent) -> Result<(), Error> {
        let live = gdb.live_threads()?;
        self.tracker.refresh(live);
        if self.draining != Some(event.thread) {
            return Ok(());
        }
        self.draining = None;
        debug!("drained thread {} exited; resuming the schedule", event.thread);
        if self.phase == Phase::Driving {
            let next = self.store.next_unhit().map_err(ReplayError::from)?;
            gdb.enqueue_execute(GdbCommand::SelectThread(next.thread));
            gdb.enqueue_execute(GdbCommand::Continue);
        }
        Ok(())
    }

    fn on_exited(&mut self, gdb: &mut Gateway<'_>) -> Result<(), Error> {
        match self.phase {
            Phase::Terminating => {
                info!("target exited; replay complete");
                self.phase = Phase::Done;
                gdb.enqueue_execute(GdbCommand::DeleteBreakpoints);
                gdb.enqueue_execute(GdbCommand::Quit);
                Ok(())
            }
            Phase::AwaitingEntry => Err(Error::SetupFailed(
                "target exited before reaching main".to_owned(),
            )),
            Phase::Driving => Err(self.divergence()),
            Phase::Done => Ok(()),
        }
    }

    fn divergence(&self) -> Error {
        let first_unhit = self
            .store
            .next_unhit()
            .expect("divergence implies unhit records")
            .clone();
        ReplayError::Divergence { first_unhit }.into()
    }
}

impl EventListener for ReplaySession {
    fn on_event(&mut self, gdb: &mut Gateway<'_>, event: &DebuggerEvent) -> Result<(), Error> {
        match event {
            DebuggerEvent::Stop(stop) => self.on_stop(gdb, stop),
            DebuggerEvent::NewThread(_) => self.on_new_thread(gdb),
            DebuggerEvent::ThreadExited(exited) => self.on_thread_exited(gdb, exited),
            DebuggerEvent::Exited(_) => self.on_exited(gdb),
        }
    }
}
