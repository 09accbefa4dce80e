use super::{CheckpointLog, CheckpointRecord};
use crate::code_addr::CodeAddr;
use crate::gdb::ThreadId;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Every record has been hit.
    #[error("checkpoint log exhausted")]
    LogExhausted,
    #[error("no unhit checkpoints remain for thread {0}")]
    NoMoreForThread(ThreadId),
    #[error("checkpoint {0} was already hit")]
    AlreadyHit(u64),
    /// An earlier record of the same thread is still unhit.
    #[error("checkpoint {id} hit before checkpoint {earlier} of the same thread")]
    OutOfOrder { id: u64, earlier: u64 },
    #[error("no checkpoint with id {0}")]
    UnknownCheckpoint(u64),
}

struct StoredCheckpoint {
    record: CheckpointRecord,
    hit: bool,
}

/// Stateful view over a checkpoint log during replay. Records gain a `hit`
/// flag that transitions false to true exactly once, in log order per thread;
/// cross-thread order is the orchestrator's business.
pub struct CheckpointStore {
    checkpoints: Vec<StoredCheckpoint>,
}

impl CheckpointStore {
    pub fn new(log: &CheckpointLog) -> CheckpointStore {
        CheckpointStore {
            checkpoints: log
                .checkpoints
                .iter()
                .map(|record| StoredCheckpoint {
                    record: record.clone(),
                    hit: false,
                })
                .collect(),
        }
    }

    /// The lowest-id record that has not been hit yet.
    pub fn next_unhit(&self) -> Result<&CheckpointRecord, StoreError> {
        self.checkpoints
            .iter()
            .find(|cp| !cp.hit)
            .map(|cp| &cp.record)
            .ok_or(StoreError::LogExhausted)
    }

    /// The lowest-id unhit record belonging to `thread`.
    pub fn next_unhit_for(&self, thread: ThreadId) -> Result<&CheckpointRecord, StoreError> {
        self.checkpoints
            .iter()
            .find(|cp| !cp.hit && cp.record.thread == thread)
            .map(|cp| &cp.record)
            .ok_or(StoreError::NoMoreForThread(thread))
    }

    pub fn remaining_for(&self, thread: ThreadId) -> usize {
        self.checkpoints
            .iter()
            .filter(|cp| !cp.hit && cp.record.thread == thread)
            .count()
    }

    /// True iff the globally next unhit record is at `location` on `thread`.
    pub fn matches(&self, location: CodeAddr, thread: ThreadId) -> bool {
        match self.next_unhit() {
            Ok(next) => next.location == location && next.thread == thread,
            Err(_) => false,
        }
    }

    pub fn mark_hit(&mut self, id: u64) -> Result<(), StoreError> {
        let index = self
            .checkpoints
            .iter()
            .position(|cp| cp.record.id == id)
            .ok_or(StoreError::UnknownCheckpoint(id))?;
        if self.checkpoints[index].hit {
            return Err(StoreError::AlreadyHit(id));
        }
        let thread = self.checkpoints[index].record.thread;
        if let Some(earlier) = self.checkpoints[..index]
            .iter()
            .find(|cp| !cp.hit && cp.record.thread == thread)
        {
            return Err(StoreError::OutOfOrder {
                id,
                earlier: earlier.record.id,
            });
        }
        self.checkpoints[index].hit = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointAction;

    fn store() -> CheckpointStore {
        let log = CheckpointLog {
            checkpoints: vec![
                CheckpointRecord {
                    id: 0,
                    thread: 1,
                    location: CodeAddr::new(0xa),
                    action: CheckpointAction::SharedAccess,
                },
                CheckpointRecord {
                    id: 1,
                    thread: 2,
                    location: CodeAddr::new(0xb),
                    action: CheckpointAction::SharedAccess,
                },
                CheckpointRecord {
                    id: 2,
                    thread: 1,
                    location: CodeAddr::new(0xc),
                    action: CheckpointAction::SharedAccess,
                },
            ],
            thread_start_routines: vec![],
        };
        CheckpointStore::new(&log)
    }

    #[test]
    fn next_unhit_is_ordered_by_id() {
        let mut store = store();
        assert_eq!(store.next_unhit().unwrap().id, 0);
        store.mark_hit(0).unwrap();
        assert_eq!(store.next_unhit().unwrap().id, 1);
        assert_eq!(store.next_unhit_for(1).unwrap().id, 2);
    }

    #[test]
    fn exhaustion_and_per_thread_exhaustion_are_reported() {
        let mut store = store();
        store.mark_hit(0).unwrap();
        store.mark_hit(1).unwrap();
        assert_eq!(store.next_unhit_for(2), Err(StoreError::NoMoreForThread(2)));
        assert_eq!(store.remaining_for(1), 1);
        store.mark_hit(2).unwrap();
        assert_eq!(store.remaining_for(1), 0);
        assert_eq!(store.next_unhit().unwrap_err(), StoreError::LogExhausted);
    }

    #[test]
    fn mark_hit_enforces_intra_thread_order() {
        let mut store = store();
        assert_eq!(
            store.mark_hit(2),
            Err(StoreError::OutOfOrder { id: 2, earlier: 0 })
        );
        store.mark_hit(0).unwrap();
        assert_eq!(store.mark_hit(0), Err(StoreError::AlreadyHit(0)));
        // Thread 2 is unconstrained by thread 1's remaining records.
        store.mark_hit(1).unwrap();
        assert_eq!(store.mark_hit(7), Err(StoreError::UnknownCheckpoint(7)));
    }

    #[test]
    fn matches_compares_location_and_thread_of_the_global_next() {
        let store = store();
        assert!(store.matches(CodeAddr::new(0xa), 1));
        assert!(!store.matches(CodeAddr::new(0xa), 2));
        assert!(!store.matches(CodeAddr::new(0xb), 2));
    }
}
