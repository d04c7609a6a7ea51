use crate::api::{ApplyError, CommitApplier, RaftCommitStreamPublisher, RaftCommittedEntry, RaftEntryId};
use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::local_state::Term;
use crate::replica::WriteAheadLogEntry;
use bytes::Bytes;
use std::io;

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// After compaction the oldest entries only survive as the snapshot point `(term, index)`. Term
/// lookups at the snapshot point still succeed, so consistency checks work across the boundary.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,

    log: L,
    // Highest locally written entry, or the snapshot point when nothing is retained after it.
    latest_entry_metadata: Option<(Term, Index)>,
    // Last entry covered by the most recent snapshot.
    snapshot_point: Option<(Term, Index)>,

    commit_stream: RaftCommitStreamPublisher,
    commit_index: Option<Index>,
    last_applied_index: Option<Index>,
    // Set when the state machine rejects an entry. Nothing is applied after that.
    apply_halted: bool,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    pub(crate) fn new(logger: slog::Logger, log: L, commit_stream: RaftCommitStreamPublisher) -> io::Result<Self> {
        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            Some(last) if last >= log.first_index() => log.read(last)?.map(|entry| (entry.term, last)),
            _ => None,
        };

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            snapshot_point: None,
            commit_stream,
            commit_index: None,
            last_applied_index: None,
            apply_halted: false,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn snapshot_point(&self) -> Option<(Term, Index)> {
        self.snapshot_point
    }

    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn retained_entries(&self) -> u64 {
        self.log.next_index().as_u64() - self.log.first_index().as_u64()
    }

    pub(crate) fn data_size(&self) -> u64 {
        self.log.data_size()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    /// Reads up to `max` consecutive entries starting at `start`.
    pub(crate) fn read_from(&self, start: Index, max: usize) -> Result<Vec<WriteAheadLogEntry>, io::Error> {
        let mut entries = Vec::new();
        let mut index = start;
        while entries.len() < max && index < self.log.next_index() {
            match self.log.read(index)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
            index = index.plus(1);
        }
        Ok(entries)
    }

    /// Term of the entry at `index`, including the compacted entry at the snapshot point.
    pub(crate) fn term_at(&self, index: Index) -> Result<Option<Term>, io::Error> {
        if let Some((term, snapshot_index)) = self.snapshot_point {
            if snapshot_index == index {
                return Ok(Some(term));
            }
        }
        Ok(self.log.read(index)?.map(|entry| entry.term))
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        // Committed entries are never rolled back.
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. Truncate={:?}, CommitIndex={:?}",
                index,
                commit_index
            );
        }

        let new_latest_entry_metadata = match index.checked_minus(1) {
            None => None,
            Some(new_latest_index) => self.term_at(new_latest_index)?.map(|term| (term, new_latest_index)),
        };

        self.log.truncate(index)?;
        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader path. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if ci >= tentative_new_commit_index) {
            return Ok(false);
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        if self.term_at(tentative_new_commit_index)? != Some(current_term) {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);
        Ok(true)
    }

    /// Follower path. The leader already checked the majority. Never moves backwards.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index, Some(ci) if ci >= new_commit_index) {
            return;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        let latest_locally_written_index = self
            .latest_entry_metadata
            .map(|(_, index)| index)
            .expect("Can't ratchet commit index forward if we don't have any local logs");
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// Moves the log onto a snapshot point that the state machine already reflects. Used for
    /// recovery and for an installed snapshot. If our entry at `index` has the snapshot's term the
    /// suffix after it is kept, otherwise the whole log is discarded. Returns whether the suffix
    /// was kept.
    pub(crate) fn reset_to_snapshot(&mut self, term: Term, index: Index) -> Result<bool, io::Error> {
        // Already compacted through `index` means we took this snapshot ourselves.
        let suffix_matches =
            index < self.log.first_index() || self.log.read(index)?.map(|entry| entry.term) == Some(term);
        if !suffix_matches {
            let first = self.log.first_index();
            self.log.truncate(first)?;
            self.latest_entry_metadata = None;
        }
        if index >= self.log.first_index() {
            self.log.compact(index)?;
        }

        self.snapshot_point = Some((term, index));
        if self.latest_entry_metadata.map(|(_, latest)| latest < index).unwrap_or(true) {
            self.latest_entry_metadata = Some((term, index));
        }
        if self.commit_index < Some(index) {
            self.commit_index = Some(index);
        }
        if self.last_applied_index < Some(index) {
            self.last_applied_index = Some(index);
        }
        Ok(suffix_matches)
    }

    /// Records a freshly captured snapshot and drops entries up to `compact_through`.
    pub(crate) fn record_snapshot(
        &mut self,
        term: Term,
        index: Index,
        compact_through: Option<Index>,
    ) -> Result<(), io::Error> {
        if matches!(self.snapshot_point, Some((_, existing)) if existing >= index) {
            return Ok(());
        }
        self.snapshot_point = Some((term, index));

        if let Some(through) = compact_through {
            if through >= self.log.first_index() {
                self.log.compact(through)?;
            }
        }
        Ok(())
    }

    /// Marks entries up to `index` as applied without handing them to the applier. Recovery does
    /// the replay itself through the recovery cohort.
    pub(crate) fn mark_recovered(&mut self, index: Index) {
        if self.commit_index < Some(index) {
            self.commit_index = Some(index);
        }
        if self.last_applied_index < Some(index) {
            self.last_applied_index = Some(index);
        }
    }

    /// Applies all committed but unapplied entries in order. Returns the new last applied index if
    /// anything was applied.
    pub(crate) fn apply_all_committed_entries<A>(&mut self, applier: &mut A) -> Option<Index>
    where
        A: CommitApplier + ?Sized,
    {
        if self.apply_halted {
            return None;
        }
        let commit_index = self.commit_index?;

        let mut newly_applied = None;
        while self.last_applied_index < Some(commit_index) {
            let next_index = self
                .last_applied_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index);

            match self.apply_single_entry(next_index, applier) {
                Ok(()) => {
                    self.last_applied_index = Some(next_index);
                    newly_applied = Some(next_index);
                }
                Err(ApplyFailure::Read(e)) => {
                    // Entry stays committed in the log. We'll retry on the next commit.
                    slog::error!(self.logger, "Failed to read committed entry {:?}: {:?}", next_index, e);
                    break;
                }
                Err(ApplyFailure::Rejected(e)) => {
                    slog::crit!(
                        self.logger,
                        "State machine rejected committed entry {:?}. No further entries will be applied. {}",
                        next_index,
                        e
                    );
                    self.apply_halted = true;
                    break;
                }
            }
        }

        newly_applied
    }

    pub(crate) fn is_apply_halted(&self) -> bool {
        self.apply_halted
    }

    fn apply_single_entry<A>(&mut self, index: Index, applier: &mut A) -> Result<(), ApplyFailure>
    where
        A: CommitApplier + ?Sized,
    {
        let entry = self
            .read(index)
            .map_err(ApplyFailure::Read)?
            .ok_or_else(|| {
                ApplyFailure::Read(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("No log entry at committed index {:?}", index),
                ))
            })?;
        if !entry.is_command() {
            return Ok(());
        }

        let committed = to_committed_entry(index, entry);
        applier
            .apply_committed(&committed)
            .map_err(ApplyFailure::Rejected)?;
        self.commit_stream.notify_commit(&self.logger, committed);

        Ok(())
    }
}

pub(crate) fn to_committed_entry(index: Index, entry: WriteAheadLogEntry) -> RaftCommittedEntry {
    RaftCommittedEntry {
        entry_id: RaftEntryId {
            term: entry.term,
            entry_index: index,
        },
        client_request_id: entry.client_request_id.map(Into::into),
        data: Bytes::from(entry.data),
    }
}

enum ApplyFailure {
    Read(io::Error),
    Rejected(ApplyError),
}
