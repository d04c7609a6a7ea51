use crate::actor::ActorClient;
use crate::admission::{AdmissionGate, Throttled};
use crate::api::types::{ClientRequestId, RaftEntryId, RaftLeaderInfo};
use crate::replica;
use bytes::Bytes;
use std::io;
use tokio::time::Duration;

/// ReplicatedLog is the replicated log for external application to append to.
#[derive(Clone)]
pub struct ReplicatedLog {
    actor_client: ActorClient,
    admission: AdmissionGate,
    commit_timeout: Duration,
}

impl ReplicatedLog {
    pub(crate) fn new(actor_client: ActorClient, admission: AdmissionGate, commit_timeout: Duration) -> Self {
        ReplicatedLog {
            actor_client,
            admission,
            commit_timeout,
        }
    }

    /// Appends an entry on the leader and waits until it is committed and applied locally.
    pub async fn append(&self, input: AppendEntryInput) -> Result<AppendEntryOutput, AppendError> {
        // Held until we return, so the tracker learns how long the whole append took.
        let admitted = self.admission.try_admit()?;
        if admitted.delay() > Duration::from_secs(0) {
            tokio::time::sleep(admitted.delay()).await;
        }

        let replica_input = replica::ClientAppendInput {
            data: input.data,
            client_request_id: input.client_request_id.map(replica::EntryOrigin::from),
        };

        match tokio::time::timeout(self.commit_timeout, self.actor_client.client_append(replica_input)).await {
            Ok(result) => result.map(AppendEntryOutput::from).map_err(AppendError::from),
            Err(_) => Err(AppendError::Timeout),
        }
    }
}

#[derive(Debug)]
pub struct AppendEntryInput {
    pub data: Bytes,
    /// Lets the state machine drop the duplicate if this append is retried after `Timeout`.
    pub client_request_id: Option<ClientRequestId>,
}

impl AppendEntryInput {
    pub fn new(data: impl Into<Bytes>) -> Self {
        AppendEntryInput {
            data: data.into(),
            client_request_id: None,
        }
    }

    pub fn with_client_request_id(mut self, id: ClientRequestId) -> Self {
        self.client_request_id = Some(id);
        self
    }
}

#[derive(Debug)]
pub struct AppendEntryOutput {
    pub entry_id: RaftEntryId,
}

#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    #[error("I'm not leader")]
    NotLeader(RaftLeaderInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Leader can't reach a majority of voting members")]
    NoQuorum,

    #[error("Too many appends in flight. Estimated delay {estimated_delay:?}")]
    Throttled { estimated_delay: Duration },

    // The entry may still commit later under a new leader. Retry with the same ClientRequestId.
    #[error("Leadership was lost before the entry committed")]
    NotCommitted,

    // Outcome unknown. Retry with the same ClientRequestId.
    #[error("Timed out waiting for the entry to be applied")]
    Timeout,

    #[error("Failed to persist log")]
    LocalIoError(io::Error),

    // Replica logic runs on a background task. This error is returned if the task has exited.
    #[error("Replica task has exited")]
    ReplicaExited,
}

// ------- Conversions --------

impl From<replica::ClientAppendOutput> for AppendEntryOutput {
    fn from(internal_output: replica::ClientAppendOutput) -> Self {
        AppendEntryOutput {
            entry_id: RaftEntryId {
                term: internal_output.term,
                entry_index: internal_output.index,
            },
        }
    }
}

impl From<replica::ClientAppendError> for AppendError {
    fn from(internal_error: replica::ClientAppendError) -> Self {
        match internal_error {
            replica::ClientAppendError::LeaderRedirect(leader_id) => {
                AppendError::NotLeader(RaftLeaderInfo::from(leader_id))
            }
            replica::ClientAppendError::NoLeader => AppendError::NoLeader,
            // Leadership is being handed over. Retrying finds the new leader.
            replica::ClientAppendError::TransferringLeadership => AppendError::NoLeader,
            replica::ClientAppendError::NoQuorum => AppendError::NoQuorum,
            replica::ClientAppendError::NotCommitted => AppendError::NotCommitted,
            replica::ClientAppendError::LocalIoError(e) => AppendError::LocalIoError(e),
            replica::ClientAppendError::ActorExited => AppendError::ReplicaExited,
        }
    }
}

impl From<Throttled> for AppendError {
    fn from(throttled: Throttled) -> Self {
        AppendError::Throttled {
            estimated_delay: throttled.estimated_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::Event;
    use crate::admission::AveragingProgressTracker;
    use std::sync::Arc;

    fn replicated_log(commit_timeout: Duration) -> (ReplicatedLog, tokio::sync::mpsc::Receiver<Event>) {
        let (actor_client, rx) = ActorClient::new(10);
        let tracker = Arc::new(AveragingProgressTracker::new(10, 4, Duration::from_millis(10)));
        let gate = AdmissionGate::new(tracker, Duration::from_secs(1));
        (ReplicatedLog::new(actor_client, gate, commit_timeout), rx)
    }

    #[tokio::test]
    async fn redirect_carries_leader() {
        let (log, mut rx) = replicated_log(Duration::from_secs(5));
        tokio::spawn(async move {
            if let Some(Event::ClientAppend(_, callback)) = rx.recv().await {
                callback.send(Err(replica::ClientAppendError::LeaderRedirect(replica::ReplicaId::new("b"))));
            }
        });

        match log.append(AppendEntryInput::new(vec![1u8])).await {
            Err(AppendError::NotLeader(leader)) => assert_eq!(leader.replica_id, "b"),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn unanswered_append_times_out() {
        let (log, mut rx) = replicated_log(Duration::from_millis(50));
        let holder = tokio::spawn(async move {
            // Keep the callback alive so the append can't complete.
            let event = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(event);
        });

        let input = AppendEntryInput::new(vec![1u8]).with_client_request_id(ClientRequestId::new("c", 1));
        assert!(matches!(log.append(input).await, Err(AppendError::Timeout)));
        holder.abort();
    }
}
