use crate::commitlog;
use crate::replica;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

pub(crate) fn create<L, S>(receiver: mpsc::Receiver<Event>, replica: replica::Replica<L, S>) -> ReplicaActor<L, S>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
    S: replica::PersistentLocalState,
{
    ReplicaActor { receiver, replica }
}

/// Everything the replica task reacts to. Handlers never await; slow work is spawned and comes
/// back as another event.
pub(crate) enum Event {
    // Leader: Append locally, replicate eagerly, reply once applied.
    // Candidate/Follower: Redirect or reject.
    ClientAppend(
        replica::ClientAppendInput,
        Callback<replica::ClientAppendOutput, replica::ClientAppendError>,
    ),

    // All states: Grant vote if applicable (includes write to disk). Higher term demotes us.
    RequestVote(
        replica::RequestVoteInput,
        Callback<replica::RequestVoteOutput, replica::RequestVoteError>,
    ),

    // Candidate: Count vote, become leader on majority. Others: discard.
    RequestVoteReplyFromPeer(replica::RequestVoteReplyFromPeer),

    // Leader/Candidate: Step down if the term is current or newer.
    // Follower: Write to disk then respond. Reset election timeout.
    AppendEntries(
        replica::AppendEntriesInput,
        Callback<replica::AppendEntriesOutput, replica::AppendEntriesError>,
    ),

    // Leader: Track peer progress, advance commit index, apply. Others: discard.
    AppendEntriesReplyFromPeer(replica::AppendEntriesReplyFromPeer),

    // Follower: Stage chunk, install on the final one. Reset election timeout.
    InstallSnapshot(
        replica::InstallSnapshotInput,
        Callback<replica::InstallSnapshotOutput, replica::InstallSnapshotError>,
    ),

    // Leader: Advance the peer's snapshot transfer. Others: discard.
    InstallSnapshotReplyFromPeer(replica::InstallSnapshotReplyFromPeer),

    // Leader: Send AppendEntries (or the next snapshot chunk) to one peer.
    HeartbeatTick(replica::HeartbeatTick),

    // Follower/Candidate: Start a new election. Leader and non-voting members: discard.
    ElectionTimeout,

    // All states: Persist a finished capture and compact the log.
    SnapshotCaptured(replica::SnapshotCaptured),

    TakeSnapshot(Callback<replica::TakeSnapshotOutput, replica::TakeSnapshotError>),

    // Leader: Queue the change, reply once its configuration entry commits.
    // Candidate/Follower: Redirect or reject.
    MembershipChange(
        replica::MembershipChange,
        Callback<replica::MembershipChangeOutput, replica::MembershipChangeError>,
    ),

    // Leader: Fail the change with this id if it's still pending.
    MembershipChangeTimeout(u64),

    // Leader: Catch the target up, then tell it to campaign. Others: reject.
    TransferLeadership(
        Option<replica::ReplicaId>,
        Callback<(), replica::LeadershipTransferError>,
    ),

    // Leader: Give up the transfer with this id and resume client appends.
    LeadershipTransferTimeout(u64),

    // Voting member: Campaign right away on the leader's request.
    TimeoutNow(
        replica::TimeoutNowInput,
        Callback<replica::TimeoutNowOutput, replica::TimeoutNowError>,
    ),

    // Leader: A refusal ends the transfer early.
    TimeoutNowReplyFromPeer(replica::TimeoutNowReplyFromPeer),

    RaftState(oneshot::Sender<replica::RaftStateReport>),
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::ClientAppend(input, _) => write!(f, "ClientAppend({} bytes)", input.data.len()),
            Event::RequestVote(input, _) => write!(f, "RequestVote({:?})", input),
            Event::RequestVoteReplyFromPeer(reply) => write!(f, "RequestVoteReplyFromPeer({:?})", reply),
            Event::AppendEntries(input, _) => write!(
                f,
                "AppendEntries(Leader={:?}, Term={:?}, Entries={})",
                input.leader_id,
                input.leader_term,
                input.new_entries.len()
            ),
            Event::AppendEntriesReplyFromPeer(reply) => write!(f, "AppendEntriesReplyFromPeer({:?})", reply),
            Event::InstallSnapshot(input, _) => write!(
                f,
                "InstallSnapshot(Leader={:?}, Offset={}, Len={}, Done={})",
                input.leader_id,
                input.offset,
                input.data.len(),
                input.done
            ),
            Event::InstallSnapshotReplyFromPeer(reply) => write!(f, "InstallSnapshotReplyFromPeer({:?})", reply),
            Event::HeartbeatTick(tick) => write!(f, "HeartbeatTick({:?})", tick),
            Event::ElectionTimeout => write!(f, "ElectionTimeout"),
            Event::SnapshotCaptured(captured) => write!(
                f,
                "SnapshotCaptured({:?}, ok={})",
                captured.last_included_index,
                captured.result.is_ok()
            ),
            Event::TakeSnapshot(_) => write!(f, "TakeSnapshot"),
            Event::MembershipChange(change, _) => write!(f, "MembershipChange({:?})", change),
            Event::MembershipChangeTimeout(id) => write!(f, "MembershipChangeTimeout({})", id),
            Event::TransferLeadership(target, _) => write!(f, "TransferLeadership({:?})", target),
            Event::LeadershipTransferTimeout(id) => write!(f, "LeadershipTransferTimeout({})", id),
            Event::TimeoutNow(input, _) => write!(f, "TimeoutNow({:?})", input),
            Event::TimeoutNowReplyFromPeer(reply) => write!(f, "TimeoutNowReplyFromPeer({:?})", reply),
            Event::RaftState(_) => write!(f, "RaftState"),
        }
    }
}

pub(crate) struct Callback<O, E>(oneshot::Sender<Result<O, E>>);

impl<O, E> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Replica actor is gone")]
pub(crate) struct ActorExited;

/// Keeps the replica task alive. The event loop ends once every ActorClient is dropped.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        (ActorClient { sender }, receiver)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn client_append(
        &self,
        input: replica::ClientAppendInput,
    ) -> Result<replica::ClientAppendOutput, replica::ClientAppendError> {
        let (tx, rx) = oneshot::channel();
        if send(&self.sender, Event::ClientAppend(input, Callback(tx))).await.is_err() {
            return Err(replica::ClientAppendError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::ClientAppendError::ActorExited))
    }

    pub(crate) async fn take_snapshot(
        &self,
    ) -> Result<replica::TakeSnapshotOutput, replica::TakeSnapshotError> {
        let (tx, rx) = oneshot::channel();
        if send(&self.sender, Event::TakeSnapshot(Callback(tx))).await.is_err() {
            return Err(replica::TakeSnapshotError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::TakeSnapshotError::ActorExited))
    }

    pub(crate) async fn change_membership(
        &self,
        change: replica::MembershipChange,
    ) -> Result<replica::MembershipChangeOutput, replica::MembershipChangeError> {
        let (tx, rx) = oneshot::channel();
        if send(&self.sender, Event::MembershipChange(change, Callback(tx))).await.is_err() {
            return Err(replica::MembershipChangeError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::MembershipChangeError::ActorExited))
    }

    pub(crate) async fn transfer_leadership(
        &self,
        target: Option<replica::ReplicaId>,
    ) -> Result<(), replica::LeadershipTransferError> {
        let (tx, rx) = oneshot::channel();
        if send(&self.sender, Event::TransferLeadership(target, Callback(tx))).await.is_err() {
            return Err(replica::LeadershipTransferError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::LeadershipTransferError::ActorExited))
    }

    pub(crate) async fn raft_state(&self) -> Result<replica::RaftStateReport, ActorExited> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::RaftState(tx)).await?;

        rx.await.map_err(|_| ActorExited)
    }
}

/// Used by timers, spawned peer calls and the RPC server. None of them keep the replica alive.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn request_vote(
        &self,
        input: replica::RequestVoteInput,
    ) -> Result<replica::RequestVoteOutput, replica::RequestVoteError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::RequestVote(input, Callback(tx))).await.is_err() {
            return Err(replica::RequestVoteError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: replica::AppendEntriesInput,
    ) -> Result<replica::AppendEntriesOutput, replica::AppendEntriesError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::AppendEntries(input, Callback(tx))).await.is_err() {
            return Err(replica::AppendEntriesError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: replica::InstallSnapshotInput,
    ) -> Result<replica::InstallSnapshotOutput, replica::InstallSnapshotError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::InstallSnapshot(input, Callback(tx))).await.is_err() {
            return Err(replica::InstallSnapshotError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::InstallSnapshotError::ActorExited))
    }

    pub(crate) async fn timeout_now(
        &self,
        input: replica::TimeoutNowInput,
    ) -> Result<replica::TimeoutNowOutput, replica::TimeoutNowError> {
        let (tx, rx) = oneshot::channel();
        if self.send(Event::TimeoutNow(input, Callback(tx))).await.is_err() {
            return Err(replica::TimeoutNowError::ActorExited);
        }

        rx.await.unwrap_or(Err(replica::TimeoutNowError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: replica::RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: replica::AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_install_snapshot_reply_from_peer(
        &self,
        reply: replica::InstallSnapshotReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::InstallSnapshotReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_snapshot_captured(&self, captured: replica::SnapshotCaptured) -> Result<(), ActorExited> {
        self.send(Event::SnapshotCaptured(captured)).await
    }

    pub(crate) async fn notify_timeout_now_reply_from_peer(
        &self,
        reply: replica::TimeoutNowReplyFromPeer,
    ) -> Result<(), ActorExited> {
        self.send(Event::TimeoutNowReplyFromPeer(reply)).await
    }

    pub(crate) async fn membership_change_timeout(&self, id: u64) -> Result<(), ActorExited> {
        self.send(Event::MembershipChangeTimeout(id)).await
    }

    pub(crate) async fn leadership_transfer_timeout(&self, id: u64) -> Result<(), ActorExited> {
        self.send(Event::LeadershipTransferTimeout(id)).await
    }

    pub(crate) async fn heartbeat_tick(&self, tick: replica::HeartbeatTick) -> Result<(), ActorExited> {
        self.send(Event::HeartbeatTick(tick)).await
    }

    pub(crate) async fn election_timeout(&self) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout).await
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        match self.sender.upgrade() {
            Some(sender) => send(&sender, event).await,
            None => Err(ActorExited),
        }
    }
}

async fn send(sender: &mpsc::Sender<Event>, event: Event) -> Result<(), ActorExited> {
    sender.send(event).await.map_err(|_| ActorExited)
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L, S>
where
    L: commitlog::Log<replica::WriteAheadLogEntry>,
    S: replica::PersistentLocalState,
{
    receiver: mpsc::Receiver<Event>,
    replica: replica::Replica<L, S>,
}

impl<L, S> ReplicaActor<L, S>
where
    L: commitlog::Log<replica::WriteAheadLogEntry> + 'static,
    S: replica::PersistentLocalState + 'static,
{
    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        self.replica.shutdown();
    }

    // This must NOT be async. Any long running work must be spawned on another task and come
    // back as an event to this actor.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientAppend(input, callback) => {
                self.replica.handle_client_append(input, callback);
            }
            Event::RequestVote(input, callback) => {
                callback.send(self.replica.server_handle_request_vote(input));
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                self.replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                callback.send(self.replica.server_handle_append_entries(input));
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                self.replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::InstallSnapshot(input, callback) => {
                callback.send(self.replica.server_handle_install_snapshot(input));
            }
            Event::InstallSnapshotReplyFromPeer(reply) => {
                self.replica.handle_install_snapshot_reply_from_peer(reply);
            }
            Event::HeartbeatTick(tick) => {
                self.replica.handle_heartbeat_tick(tick);
            }
            Event::ElectionTimeout => {
                self.replica.handle_election_timeout();
            }
            Event::SnapshotCaptured(captured) => {
                self.replica.handle_snapshot_captured(captured);
            }
            Event::TakeSnapshot(callback) => {
                self.replica.handle_take_snapshot(callback);
            }
            Event::MembershipChange(change, callback) => {
                self.replica.handle_membership_change(change, callback);
            }
            Event::MembershipChangeTimeout(id) => {
                self.replica.handle_membership_change_timeout(id);
            }
            Event::TransferLeadership(target, callback) => {
                self.replica.handle_transfer_leadership(target, callback);
            }
            Event::LeadershipTransferTimeout(id) => {
                self.replica.handle_leadership_transfer_timeout(id);
            }
            Event::TimeoutNow(input, callback) => {
                callback.send(self.replica.server_handle_timeout_now(input));
            }
            Event::TimeoutNowReplyFromPeer(reply) => {
                self.replica.handle_timeout_now_reply_from_peer(reply);
            }
            Event::RaftState(reply_to) => {
                let _ = reply_to.send(self.replica.raft_state());
            }
        }
    }
}
