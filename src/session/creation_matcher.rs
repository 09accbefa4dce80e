//! Offline post-recording pass that repairs the inherent ambiguity between a
//! thread-creation syscall and the first instruction of the child: a data
//! watchpoint firing in the child can be delivered before the parent's
//! creation-site breakpoint. The matcher walks the raw sequence, tags
//! creator and created records, pairs them against the recorded thread
//! creations, and moves each late creator in front of its child so the
//! linear order respects "creator creates before child runs".

use crate::checkpoint::{CheckpointAction, CheckpointRecord};
use crate::code_addr::CodeAddr;
use crate::gdb::{ThreadId, MAIN_THREAD};
use log::debug;
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

/// One thread creation as observed through a new-thread event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ThreadCreation {
    pub creator: ThreadId,
    pub created: ThreadId,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MatcherError {
    #[error("{0} creator-thread checkpoint(s) left unmatched")]
    UnmatchedCreators(usize),
    #[error("{0} created-thread checkpoint(s) left unmatched")]
    UnmatchedCreated(usize),
    #[error("no thread creation recorded for creator thread {0}")]
    MissingCreation(ThreadId),
}

pub struct CreationMatcher {
    checkpoints: Vec<CheckpointRecord>,
    creations: VecDeque<ThreadCreation>,
    creation_pcs: BTreeSet<CodeAddr>,
    seen_threads: BTreeSet<ThreadId>,
    unmatched_creators: Vec<u64>,
    unmatched_created: Vec<u64>,
    reorderings: Vec<(u64, u64)>,
}

impl CreationMatcher {
    pub fn new(
        checkpoints: Vec<CheckpointRecord>,
        creations: Vec<ThreadCreation>,
        creation_pcs: BTreeSet<CodeAddr>,
    ) -> CreationMatcher {
        let mut seen_threads = BTreeSet::new();
        seen_threads.insert(MAIN_THREAD);
        CreationMatcher {
            checkpoints,
            creations: creations.into(),
            creation_pcs,
            seen_threads,
            unmatched_creators: Vec::new(),
            unmatched_created: Vec::new(),
            reorderings: Vec::new(),
        }
    }

    /// Produces the canonical log sequence. Both unmatched queues must come
    /// out empty; a leftover entry means the recording missed an event and
    /// the whole recording is rejected.
    pub fn into_matched(mut self) -> Result<Vec<CheckpointRecord>, MatcherError> {
        for index in 0..self.checkpoints.len() {
            self.classify(index);
            self.attempt_match()?;
        }
        if !self.unmatched_creators.is_empty() {
            return Err(MatcherError::UnmatchedCreators(self.unmatched_creators.len()));
        }
        if !self.unmatched_created.is_empty() {
            return Err(MatcherError::UnmatchedCreated(self.unmatched_created.len()));
        }
        self.apply_reorderings();
        for (index, checkpoint) in self.checkpoints.iter_mut().enumerate() {
            checkpoint.id = index as u64;
        }
        Ok(self.checkpoints)
    }

    fn classify(&mut self, index: usize) {
        let checkpoint = &mut self.checkpoints[index];
        if !self.seen_threads.contains(&checkpoint.thread) {
            checkpoint.action = CheckpointAction::CreatedThread;
            self.seen_threads.insert(checkpoint.thread);
            self.unmatched_created.push(checkpoint.id);
        } else if self.creation_pcs.contains(&checkpoint.location) {
            checkpoint.action = CheckpointAction::CreatorThread;
            self.unmatched_creators.push(checkpoint.id);
        }
    }

    /// Pairs at most one creator with its created record. Creators are tried
    /// in queue order, so ties between multiple creations by the same thread
    /// are broken by recording order.
    fn attempt_match(&mut self) -> Result<(), MatcherError> {
        for creator_index in 0..self.unmatched_creators.len() {
            let creator_id = self.unmatched_creators[creator_index];
            let creator_thread = self.thread_of(creator_id);
            let created_thread = match self
                .creations
                .iter()
                .find(|creation| creation.creator == creator_thread)
            {
                Some(creation) => creation.created,
                None => return Err(MatcherError::MissingCreation(creator_thread)),
            };
            let created_index = match self
                .unmatched_created
                .iter()
                .position(|&id| self.thread_of(id) == created_thread)
            {
                Some(position) => position,
                None => continue,
            };
            let created_id = self.unmatched_created[created_index];
            if creator_id > created_id {
                debug!(
                    "child checkpoint {} beat its creator {}; scheduling reorder",
                    created_id, creator_id
                );
                self.reorderings.push((creator_id, created_id));
            }
            self.unmatched_creators.remove(creator_index);
            self.unmatched_created.remove(created_index);
            let consumed = self
                .creations
                .iter()
                .position(|creation| creation.creator == creator_thread)
                .expect("creation was just found");
            self.creations.remove(consumed);
            return Ok(());
        }
        Ok(())
    }

    fn thread_of(&self, id: u64) -> ThreadId {
        self.checkpoints
            .iter()
            .find(|checkpoint| checkpoint.id == id)
            .expect("queued ids come from the sequence")
            .thread
    }

    /// Moves each late creator record to just before its child, preserving
    /// the pair's adjacency.
    fn apply_reorderings(&mut self) {
        for (creator_id, created_id) in self.reorderings.clone() {
            let from = self.index_of(creator_id);
            let to = self.index_of(created_id);
            let creator = self.checkpoints.remove(from);
            self.checkpoints.insert(to, creator);
        }
    }

    fn index_of(&self, id: u64) -> usize {
        self.checkpoints
            .iter()
            .position(|checkpoint| checkpoint.id == id)
            .expect("reordered ids come from the sequence")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: u64, thread: ThreadId, location: u64) -> CheckpointRecord {
        CheckpointRecord {
            id,
            thread,
            location: CodeAddr::new(location),
            action: CheckpointAction::SharedAccess,
        }
    }

    fn creation_pcs(pcs: &[u64]) -> BTreeSet<CodeAddr> {
        pcs.iter().map(|&pc| CodeAddr::new(pc)).collect()
    }

    #[test]
    fn tags_an_in_order_creation_without_reordering() {
        let checkpoints = vec![
            raw(0, 1, 0xa),
            raw(1, 1, 0xb), // clone site
            raw(2, 2, 0xc), // child's first record
            raw(3, 2, 0xd),
            raw(4, 1, 0xe),
        ];
        let creations = vec![ThreadCreation {
            creator: 1,
            created: 2,
        }];
        let matched = CreationMatcher::new(checkpoints, creations, creation_pcs(&[0xb]))
            .into_matched()
            .unwrap();
        let actions: Vec<CheckpointAction> = matched.iter().map(|cp| cp.action).collect();
        assert_eq!(
            actions,
            vec![
                CheckpointAction::SharedAccess,
                CheckpointAction::CreatorThread,
                CheckpointAction::CreatedThread,
                CheckpointAction::SharedAccess,
                CheckpointAction::SharedAccess,
            ]
        );
        let ids: Vec<u64> = matched.iter().map(|cp| cp.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn moves_a_late_creator_in_front_of_its_child() {
        // Watchpoint delivery on the child beat the parent's creation-site
        // stop: the child's first record precedes the clone site.
        let checkpoints = vec![
            raw(0, 1, 0xa),
            raw(1, 1, 0xa),
            raw(2, 2, 0xc), // child appears first
            raw(3, 1, 0xb), // clone site observed late
            raw(4, 2, 0xd),
        ];
        let creations = vec![ThreadCreation {
            creator: 1,
            created: 2,
        }];
        let matched = CreationMatcher::new(checkpoints, creations, creation_pcs(&[0xb]))
            .into_matched()
            .unwrap();
        let order: Vec<(ThreadId, CheckpointAction)> =
            matched.iter().map(|cp| (cp.thread, cp.action)).collect();
        assert_eq!(
            order,
            vec![
                (1, CheckpointAction::SharedAccess),
                (1, CheckpointAction::SharedAccess),
                (1, CheckpointAction::CreatorThread),
                (2, CheckpointAction::CreatedThread),
                (2, CheckpointAction::SharedAccess),
            ]
        );
        // Ids are renumbered to the repaired sequence order.
        let ids: Vec<u64> = matched.iter().map(|cp| cp.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn two_creations_by_the_same_thread_pair_in_recording_order() {
        let checkpoints = vec![
            raw(0, 1, 0xb), // creates thread 2
            raw(1, 2, 0xc),
            raw(2, 1, 0xb), // creates thread 3
            raw(3, 3, 0xc),
        ];
        let creations = vec![
            ThreadCreation {
                creator: 1,
                created: 2,
            },
            ThreadCreation {
                creator: 1,
                created: 3,
            },
        ];
        let matched = CreationMatcher::new(checkpoints, creations, creation_pcs(&[0xb]))
            .into_matched()
            .unwrap();
        let order: Vec<(ThreadId, CheckpointAction)> =
            matched.iter().map(|cp| (cp.thread, cp.action)).collect();
        assert_eq!(
            order,
            vec![
                (1, CheckpointAction::CreatorThread),
                (2, CheckpointAction::CreatedThread),
                (1, CheckpointAction::CreatorThread),
                (3, CheckpointAction::CreatedThread),
            ]
        );
    }

    #[test]
    fn leftover_creator_rejects_the_recording() {
        // A clone site was hit but the child never produced a record.
        let checkpoints = vec![raw(0, 1, 0xb), raw(1, 1, 0xa)];
        let creations = vec![ThreadCreation {
            creator: 1,
            created: 2,
        }];
        let err = CreationMatcher::new(checkpoints, creations, creation_pcs(&[0xb]))
            .into_matched()
            .unwrap_err();
        assert_eq!(err, MatcherError::UnmatchedCreators(1));
    }

    #[test]
    fn creator_without_a_recorded_creation_is_an_error() {
        let checkpoints = vec![raw(0, 1, 0xb)];
        let err = CreationMatcher::new(checkpoints, vec![], creation_pcs(&[0xb]))
            .into_matched()
            .unwrap_err();
        assert_eq!(err, MatcherError::MissingCreation(1));
    }
}
