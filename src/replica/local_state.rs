use crate::commitlog::Index;
use crate::replica::peers::ReplicaId;
use crate::rpc::ProtoLocalState;
use prost::Message;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub(crate) const LOCAL_STATE_FILE_NAME: &str = "local_state.bin";

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub(crate) struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub(crate) fn as_u64(&self) -> u64 {
        self.0
    }

    fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The values Raft requires to survive a restart.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LocalStateValues {
    current_term: Term,
    voted_for: Option<ReplicaId>,
    last_applied: Option<Index>,
}

impl Default for LocalStateValues {
    fn default() -> Self {
        LocalStateValues {
            current_term: Term::new(0),
            voted_for: None,
            last_applied: None,
        }
    }
}

/// PersistentLocalState is used whenever Raft requires that something is persisted before we act
/// on it. Implementors only provide `values()` and `store()`; the compare-and-set operations are
/// built on top and return true iff they mutated state.
///
/// A failed `store()` must leave `values()` unchanged.
pub(crate) trait PersistentLocalState: Send {
    fn values(&self) -> &LocalStateValues;

    fn store(&mut self, new_values: LocalStateValues) -> io::Result<()>;

    /// Set current term to `new_term` iff it is larger than current term. Clears the vote.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        let current = self.values();
        if new_term <= current.current_term {
            return Ok(false);
        }

        let new_values = LocalStateValues {
            current_term: new_term,
            voted_for: None,
            last_applied: current.last_applied,
        };
        self.store(new_values)?;
        Ok(true)
    }

    /// Store our vote iff `expected_term` is still the current term and we haven't voted in it.
    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: ReplicaId) -> io::Result<bool> {
        let current = self.values();
        if expected_term != current.current_term || current.voted_for.is_some() {
            return Ok(false);
        }

        let mut new_values = current.clone();
        new_values.voted_for = Some(vote);
        self.store(new_values)?;
        Ok(true)
    }

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self, my_replica_id: &ReplicaId) -> io::Result<Term> {
        let mut new_values = self.values().clone();
        new_values.current_term.incr();
        new_values.voted_for = Some(my_replica_id.clone());

        let new_term = new_values.current_term;
        self.store(new_values)?;
        Ok(new_term)
    }

    /// Ratchets the persisted last-applied index forward. Older indexes are ignored.
    fn store_last_applied(&mut self, index: Index) -> io::Result<()> {
        let current = self.values();
        if Some(index) <= current.last_applied {
            return Ok(());
        }

        let mut new_values = current.clone();
        new_values.last_applied = Some(index);
        self.store(new_values)
    }

    fn current_term(&self) -> Term {
        self.values().current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<ReplicaId>) {
        let values = self.values();
        (values.current_term, values.voted_for.clone())
    }

    fn last_applied(&self) -> Option<Index> {
        self.values().last_applied
    }
}

/// Keeps local state in memory only. For members configured without a storage directory.
#[derive(Default)]
pub(crate) struct VolatileLocalState {
    values: LocalStateValues,
}

impl VolatileLocalState {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn values(&self) -> &LocalStateValues {
        &self.values
    }

    fn store(&mut self, new_values: LocalStateValues) -> io::Result<()> {
        self.values = new_values;
        Ok(())
    }
}

/// FileLocalState keeps local state in `local_state.bin`. Every store writes a temp file, fsyncs
/// it, and renames it over the previous one, so a crash leaves either the old or the new state.
pub(crate) struct FileLocalState {
    path: PathBuf,
    values: LocalStateValues,
}

impl FileLocalState {
    pub(crate) fn open(directory: &Path) -> io::Result<Self> {
        let path = directory.join(LOCAL_STATE_FILE_NAME);
        let values = if path.exists() {
            let bytes = fs::read(&path)?;
            let proto = ProtoLocalState::decode(bytes.as_slice())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{:?}: {}", path, e)))?;
            LocalStateValues::from(proto)
        } else {
            LocalStateValues::default()
        };

        Ok(FileLocalState { path, values })
    }

    fn write_file(&self, values: &LocalStateValues) -> io::Result<()> {
        let proto = ProtoLocalState::from(values);
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let tmp_path = self.path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

impl PersistentLocalState for FileLocalState {
    fn values(&self) -> &LocalStateValues {
        &self.values
    }

    fn store(&mut self, new_values: LocalStateValues) -> io::Result<()> {
        self.write_file(&new_values)?;
        self.values = new_values;
        Ok(())
    }
}

// ------- Conversions --------

impl From<ProtoLocalState> for LocalStateValues {
    fn from(proto: ProtoLocalState) -> Self {
        LocalStateValues {
            current_term: Term::new(proto.current_term),
            voted_for: if proto.voted_for.is_empty() {
                None
            } else {
                Some(ReplicaId::new(proto.voted_for))
            },
            last_applied: Index::from_u64_opt(proto.last_applied),
        }
    }
}

impl From<&LocalStateValues> for ProtoLocalState {
    fn from(values: &LocalStateValues) -> Self {
        ProtoLocalState {
            current_term: values.current_term.as_u64(),
            voted_for: values
                .voted_for
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
            last_applied: values.last_applied.map(|i| i.as_u64()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_cas(state: &mut dyn PersistentLocalState) {
        let me = ReplicaId::new("me");
        let other = ReplicaId::new("other");

        assert!(state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());

        // Wrong term, then a real vote, then a second vote in the same term.
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(2), other.clone()).unwrap());
        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), other.clone()).unwrap());
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), me.clone()).unwrap());
        assert_eq!(state.voted_for_current_term(), (Term::new(3), Some(other)));

        assert_eq!(state.increment_term_and_vote_for_self(&me).unwrap(), Term::new(4));
        assert_eq!(state.voted_for_current_term(), (Term::new(4), Some(me)));

        state.store_last_applied(Index::new(7)).unwrap();
        state.store_last_applied(Index::new(5)).unwrap();
        assert_eq!(state.last_applied(), Some(Index::new(7)));

        // A new term clears the vote but keeps last applied.
        assert!(state.store_term_if_increased(Term::new(9)).unwrap());
        assert_eq!(state.voted_for_current_term(), (Term::new(9), None));
        assert_eq!(state.last_applied(), Some(Index::new(7)));
    }

    #[test]
    fn volatile_compare_and_set() {
        exercise_cas(&mut VolatileLocalState::new());
    }

    #[test]
    fn file_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut state = FileLocalState::open(dir.path()).unwrap();
            exercise_cas(&mut state);
            state
                .store_vote_for_term_if_unvoted(Term::new(9), ReplicaId::new("candidate"))
                .unwrap();
        }

        let reopened = FileLocalState::open(dir.path()).unwrap();
        assert_eq!(
            reopened.voted_for_current_term(),
            (Term::new(9), Some(ReplicaId::new("candidate")))
        );
        assert_eq!(reopened.last_applied(), Some(Index::new(7)));
        assert!(!dir.path().join("local_state.bin.tmp").exists());
    }

    #[test]
    fn garbage_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOCAL_STATE_FILE_NAME), [0xff, 0xff, 0xff]).unwrap();

        let err = FileLocalState::open(dir.path()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
