use super::Replica;
use crate::actor::{Callback, WeakActorClient};
use crate::commitlog::{Index, Log};
use crate::io::SharedFileBackedOutputStream;
use crate::replica::election::{PeerStateUpdate, SnapshotTransfer};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::membership::ServerConfiguration;
use crate::replica::peers::{Peer, ReplicaId};
use crate::replica::replica_api::{
    InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput, InstallSnapshotReplyFromPeer,
    InstallSnapshotReplyFromPeerError, PeerRequestDescriptor, SnapshotCaptured, TakeSnapshotError,
    TakeSnapshotOutput, TermOutOfDateInfo,
};
use crate::replica::snapshot::{self, CapturePoint, SnapshotMeta};
use crate::replica::WriteAheadLogEntry;
use crate::rpc::{
    proto_install_snapshot_error, proto_install_snapshot_result, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    TransportError,
};
use chrono::Utc;
use std::io::{self, Write};
use tokio::time::error::Elapsed;
use tokio::time::{Duration, Instant};

/// The newest snapshot this replica holds, kept spilled so it can be streamed to lagging peers.
pub(super) struct LatestSnapshot {
    pub(super) term: Term,
    pub(super) index: Index,
    pub(super) configuration: Option<ServerConfiguration>,
    pub(super) stream: SharedFileBackedOutputStream,
}

/// Chunks received from the leader so far.
struct StagedSnapshot {
    leader_term: Term,
    term: Term,
    index: Index,
    configuration: Option<ServerConfiguration>,
    stream: SharedFileBackedOutputStream,
}

pub(super) struct SnapshotState {
    capture_in_progress: Option<Index>,
    waiting: Vec<Callback<TakeSnapshotOutput, TakeSnapshotError>>,
    latest: Option<LatestSnapshot>,
    staged: Option<StagedSnapshot>,
}

impl SnapshotState {
    pub(super) fn new(latest: Option<LatestSnapshot>) -> Self {
        SnapshotState {
            capture_in_progress: None,
            waiting: Vec::new(),
            latest,
            staged: None,
        }
    }

    pub(super) fn latest(&self) -> Option<&LatestSnapshot> {
        self.latest.as_ref()
    }

    /// Swaps in a newer snapshot. Transfers still streaming the old one hold their own reference.
    fn replace_latest(&mut self, logger: &slog::Logger, new_latest: LatestSnapshot) {
        if let Some(old) = self.latest.replace(new_latest) {
            release_stream(logger, &old.stream);
        }
    }

    fn discard_staged(&mut self, logger: &slog::Logger) {
        if let Some(staged) = self.staged.take() {
            release_stream(logger, &staged.stream);
        }
    }

    pub(super) fn release(&mut self, logger: &slog::Logger) {
        self.discard_staged(logger);
        if let Some(latest) = self.latest.take() {
            release_stream(logger, &latest.stream);
        }
        for callback in self.waiting.drain(..) {
            callback.send(Err(TakeSnapshotError::ActorExited));
        }
    }
}

fn release_stream(logger: &slog::Logger, stream: &SharedFileBackedOutputStream) {
    if let Err(e) = stream.cleanup() {
        slog::warn!(logger, "Failed to clean up snapshot spill file: {:?}", e);
    }
}

impl<L, S> Replica<L, S>
where
    L: Log<WriteAheadLogEntry> + 'static,
    S: PersistentLocalState + 'static,
{
    // ------- Capture --------

    /// Starts a capture once enough has been applied since the last snapshot, or the retained
    /// log grew too large.
    pub(super) fn maybe_start_snapshot(&mut self) {
        if self.snapshots.capture_in_progress.is_some() {
            return;
        }
        let last_applied = match self.wal.last_applied() {
            Some(last_applied) => last_applied.as_u64(),
            None => return,
        };
        let snapshot_index = self.wal.snapshot_point().map(|(_, index)| index.as_u64()).unwrap_or(0);
        let applied_since_snapshot = last_applied.saturating_sub(snapshot_index);
        if applied_since_snapshot == 0 {
            return;
        }

        let by_count = applied_since_snapshot >= self.options.snapshot_batch_count;
        let by_size = self.wal.data_size() > self.options.snapshot_data_threshold
            && applied_since_snapshot > self.options.snapshot_retained_entries;
        if by_count || by_size {
            slog::info!(
                self.logger,
                "Starting snapshot. AppliedSinceSnapshot={}, LogDataSize={}",
                applied_since_snapshot,
                self.wal.data_size()
            );
            self.start_snapshot_capture();
        }
    }

    /// Captures the state machine at the last applied index. The heavy lifting runs off the
    /// replica task and comes back as SnapshotCaptured.
    pub(super) fn start_snapshot_capture(&mut self) {
        if self.snapshots.capture_in_progress.is_some() {
            return;
        }
        let last_applied = match self.wal.last_applied() {
            Some(last_applied) => last_applied,
            None => return,
        };
        let term = match self.wal.term_at(last_applied) {
            Ok(Some(term)) => term,
            Ok(None) => {
                slog::error!(self.logger, "Applied entry {:?} is missing, can't snapshot", last_applied);
                return;
            }
            Err(e) => {
                slog::error!(self.logger, "Failed to read term of {:?}: {:?}", last_applied, e);
                return;
            }
        };

        self.snapshots.capture_in_progress = Some(last_applied);
        snapshot::spawn_capture(
            self.logger.clone(),
            self.state_machine.capture_state(),
            CapturePoint {
                last_included_term: term,
                last_included_index: last_applied,
                configuration: Some(self.membership.at(last_applied).clone()),
            },
            self.options.snapshot_io.clone(),
            self.snapshot_store.clone(),
            self.actor_client.clone(),
        );
    }

    pub(crate) fn handle_snapshot_captured(&mut self, captured: SnapshotCaptured) {
        self.snapshots.capture_in_progress = None;
        let waiting = std::mem::take(&mut self.snapshots.waiting);

        let stream = match captured.result {
            Ok(stream) => stream,
            Err(e) => {
                for callback in waiting {
                    callback.send(Err(TakeSnapshotError::LocalIoError(io::Error::new(
                        e.kind(),
                        e.to_string(),
                    ))));
                }
                return;
            }
        };

        let (term, index) = (captured.last_included_term, captured.last_included_index);
        if matches!(self.snapshots.latest(), Some(latest) if latest.index >= index) {
            // An installed snapshot overtook this capture.
            release_stream(&self.logger, &stream);
        } else {
            let compact_through = index.checked_minus(self.options.snapshot_retained_entries);
            match self.wal.record_snapshot(term, index, compact_through) {
                Ok(()) => {
                    if let Some(compact_through) = compact_through {
                        self.membership.compact_through(compact_through);
                    }
                }
                Err(e) => slog::error!(self.logger, "Failed to compact log through {:?}: {:?}", compact_through, e),
            }
            slog::info!(
                self.logger,
                "Snapshot at {:?} (term {:?}) captured, {} bytes. Log now starts at {:?}",
                index,
                term,
                stream.count(),
                self.wal.first_index()
            );
            self.snapshots.replace_latest(
                &self.logger,
                LatestSnapshot {
                    term,
                    index,
                    configuration: captured.configuration,
                    stream,
                },
            );
        }

        for callback in waiting {
            callback.send(Ok(TakeSnapshotOutput {
                last_included_term: term,
                last_included_index: index,
            }));
        }

        // More may have been applied while capturing.
        self.maybe_start_snapshot();
    }

    pub(crate) fn handle_take_snapshot(&mut self, callback: Callback<TakeSnapshotOutput, TakeSnapshotError>) {
        let last_applied = match self.wal.last_applied() {
            Some(last_applied) => last_applied,
            None => {
                callback.send(Err(TakeSnapshotError::NothingApplied));
                return;
            }
        };

        if let Some((term, index)) = self.wal.snapshot_point() {
            if index >= last_applied && self.snapshots.capture_in_progress.is_none() {
                callback.send(Ok(TakeSnapshotOutput {
                    last_included_term: term,
                    last_included_index: index,
                }));
                return;
            }
        }

        self.snapshots.waiting.push(callback);
        self.start_snapshot_capture();
    }

    // ------- Install (follower) --------

    pub(crate) fn server_handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(InstallSnapshotError::ClientNotInCluster);
        }

        // 1. Reply immediately if term < currentTerm
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(InstallSnapshotError::ClientTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }
        let increased = self
            .observe_term(input.leader_term, Some(input.leader_id.clone()))
            .map_err(InstallSnapshotError::ServerIoError)?;
        if !increased {
            self.accept_leader_of_current_term(&input.leader_id)
                .map_err(InstallSnapshotError::ClientTermOutOfDate)?;
        }
        self.election_state.reset_timeout_if_follower();

        let chunk_end = input.offset + input.data.len() as u64;
        if matches!(self.wal.last_applied(), Some(last_applied) if last_applied >= input.last_included_index) {
            // We already reflect everything this snapshot holds.
            self.snapshots.discard_staged(&self.logger);
            return Ok(InstallSnapshotOutput { next_offset: chunk_end });
        }

        // 2. Create new snapshot file if first chunk (offset is 0)
        if input.offset == 0 {
            self.snapshots.discard_staged(&self.logger);
            self.snapshots.staged = Some(StagedSnapshot {
                leader_term: input.leader_term,
                term: input.last_included_term,
                index: input.last_included_index,
                configuration: input.configuration,
                stream: self.options.snapshot_io.new_spill_stream(),
            });
        }

        // 3. Write data into snapshot file at given offset
        let expected_offset = match &self.snapshots.staged {
            Some(staged)
                if staged.leader_term == input.leader_term
                    && staged.term == input.last_included_term
                    && staged.index == input.last_included_index =>
            {
                staged.stream.count()
            }
            _ => 0,
        };
        if input.offset != expected_offset {
            return Err(InstallSnapshotError::UnexpectedOffset {
                offset: input.offset,
                expected_offset,
            });
        }
        let written = match self.snapshots.staged.as_mut() {
            Some(staged) => staged.stream.write_all(&input.data).and_then(|_| staged.stream.flush()),
            None => Ok(()),
        };
        if let Err(e) = written {
            self.snapshots.discard_staged(&self.logger);
            return Err(InstallSnapshotError::ServerIoError(e));
        }

        // 4. Reply and wait for more data chunks if done is false
        if !input.done {
            return Ok(InstallSnapshotOutput { next_offset: chunk_end });
        }

        // 5. Save snapshot file, discard any existing or partial snapshot
        // 6. If existing log entry has same index and term as snapshot's last included entry,
        // retain log entries following it
        // 7. Discard the entire log otherwise
        // 8. Reset state machine using snapshot contents
        let staged = match self.snapshots.staged.take() {
            Some(staged) => staged,
            None => return Ok(InstallSnapshotOutput { next_offset: chunk_end }),
        };
        match self.install_staged_snapshot(&staged) {
            Ok(()) => {
                slog::info!(
                    self.logger,
                    "Installed snapshot at {:?} (term {:?}) from {:?}, {} bytes",
                    staged.index,
                    staged.term,
                    input.leader_id,
                    staged.stream.count()
                );
                self.snapshots.replace_latest(
                    &self.logger,
                    LatestSnapshot {
                        term: staged.term,
                        index: staged.index,
                        configuration: staged.configuration,
                        stream: staged.stream,
                    },
                );
                Ok(InstallSnapshotOutput { next_offset: chunk_end })
            }
            Err(e) => {
                release_stream(&self.logger, &staged.stream);
                Err(e)
            }
        }
    }

    fn install_staged_snapshot(&mut self, staged: &StagedSnapshot) -> Result<(), InstallSnapshotError> {
        let data = staged.stream.as_byte_source().map_err(InstallSnapshotError::ServerIoError)?;
        if let Err(e) = snapshot::restore_snapshot(&data, self.state_machine.as_mut()) {
            slog::crit!(self.logger, "State machine rejected snapshot at {:?}: {}", staged.index, e);
            return Err(InstallSnapshotError::SnapshotRejected(e.to_string()));
        }

        let meta = SnapshotMeta {
            last_included_term: staged.term,
            last_included_index: staged.index,
            size: data.size(),
            created_at: Utc::now(),
            configuration: staged.configuration.clone(),
        };
        self.snapshot_store
            .save(&meta, &data)
            .map_err(InstallSnapshotError::ServerIoError)?;
        let suffix_kept = self
            .wal
            .reset_to_snapshot(staged.term, staged.index)
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.membership
            .reset_to_snapshot(staged.index, staged.configuration.clone(), suffix_kept);
        self.apply_latest_configuration();
        self.local_state
            .store_last_applied(staged.index)
            .map_err(InstallSnapshotError::ServerIoError)?;
        Ok(())
    }

    // ------- Transfer (leader) --------

    pub(crate) fn handle_install_snapshot_reply_from_peer(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let peer_id = reply.descriptor.peer_id;
        let logger = self
            .logger
            .new(slog::o!("Peer" => format!("{:?}", peer_id), "SeqNo" => reply.descriptor.seq_no));

        let current_term = self.local_state.current_term();
        if current_term != reply.descriptor.term {
            slog::info!(
                logger,
                "Received InstallSnapshot reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }

        let heard_back = !matches!(reply.result, Err(InstallSnapshotReplyFromPeerError::Unreachable(_)));
        let mut send_next_now = true;
        let update = match reply.result {
            Ok(_) if reply.done => PeerStateUpdate::SnapshotInstalled,
            Ok(next_offset) => PeerStateUpdate::SnapshotChunkAccepted { next_offset },
            Err(InstallSnapshotReplyFromPeerError::UnexpectedOffset { expected_offset }) => {
                PeerStateUpdate::SnapshotOffsetMismatch { expected_offset }
            }
            Err(InstallSnapshotReplyFromPeerError::StaleTerm { new_term }) => match self.observe_term(new_term, None) {
                Ok(true) => return,
                Ok(false) => {
                    send_next_now = false;
                    PeerStateUpdate::OtherError
                }
                Err(e) => {
                    slog::error!(logger, "Failed to persist newer term {:?}: {:?}", new_term, e);
                    return;
                }
            },
            Err(InstallSnapshotReplyFromPeerError::RetryableFailure(msg)) => {
                slog::warn!(logger, "InstallSnapshot failure: {}", msg);
                send_next_now = false;
                PeerStateUpdate::OtherError
            }
            Err(InstallSnapshotReplyFromPeerError::Unreachable(msg)) => {
                slog::debug!(logger, "Peer unreachable: {}", msg);
                send_next_now = false;
                PeerStateUpdate::OtherError
            }
        };

        {
            let peer_state = match self
                .election_state
                .leader_state_mut()
                .and_then(|leader_state| leader_state.peer_state_mut(&peer_id))
            {
                Some(peer_state) => peer_state,
                None => {
                    slog::info!(logger, "No longer leader, or peer unknown");
                    return;
                }
            };
            if heard_back {
                peer_state.record_contact(Instant::now());
            }
            if !peer_state.handle_reply(&logger, reply.descriptor.seq_no, update) {
                return;
            }
        }

        self.advance_leader_commit_index();
        if send_next_now {
            self.replicate_to_peer(&peer_id, current_term);
        }
    }

    pub(super) fn new_install_snapshot_request(
        current_term: Term,
        my_id: &ReplicaId,
        transfer: &SnapshotTransfer,
        chunk_size: usize,
    ) -> io::Result<(ProtoInstallSnapshotReq, bool)> {
        let remaining = transfer.size.saturating_sub(transfer.offset);
        let len = std::cmp::min(remaining, chunk_size as u64) as usize;
        let data = transfer.data.as_byte_source()?.read_range(transfer.offset, len)?;
        let done = transfer.offset + len as u64 >= transfer.size;

        let request = ProtoInstallSnapshotReq {
            client_node_id: my_id.as_str().to_string(),
            term: current_term.as_u64(),
            last_included_index: transfer.last_included_index.as_u64(),
            last_included_term: transfer.last_included_term.as_u64(),
            offset: transfer.offset,
            data,
            done,
            servers: transfer
                .configuration
                .as_ref()
                .map(ServerConfiguration::to_proto)
                .unwrap_or_default(),
        };
        Ok((request, done))
    }

    pub(super) async fn call_peer_install_snapshot(
        logger: slog::Logger,
        peer: Peer,
        rpc_request: ProtoInstallSnapshotReq,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: PeerRequestDescriptor,
        done: bool,
    ) {
        let peer_id = peer.metadata.replica_id().as_str();
        slog::debug!(
            logger,
            "ClientWire - InstallSnapshot(offset={}, len={}, done={})",
            rpc_request.offset,
            rpc_request.data.len(),
            rpc_request.done
        );
        let rpc_reply = tokio::time::timeout(rpc_timeout, peer.transport.install_snapshot(peer_id, rpc_request)).await;
        slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

        let reply = InstallSnapshotReplyFromPeer {
            descriptor,
            done,
            result: convert_install_snapshot_rpc_reply(rpc_reply),
        };
        let _ = callback.notify_install_snapshot_reply_from_peer(reply).await;
    }
}

fn convert_install_snapshot_rpc_reply(
    rpc_reply: Result<Result<ProtoInstallSnapshotResult, TransportError>, Elapsed>,
) -> Result<u64, InstallSnapshotReplyFromPeerError> {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.result {
            Some(proto_install_snapshot_result::Result::Ok(success)) => Ok(success.next_offset),
            Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
                Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => {
                    Err(InstallSnapshotReplyFromPeerError::StaleTerm {
                        new_term: Term::new(payload.current_term),
                    })
                }
                Some(proto_install_snapshot_error::Err::UnexpectedOffset(payload)) => {
                    Err(InstallSnapshotReplyFromPeerError::UnexpectedOffset {
                        expected_offset: payload.expected_offset,
                    })
                }
                Some(proto_install_snapshot_error::Err::ServerFault(payload)) => Err(
                    InstallSnapshotReplyFromPeerError::RetryableFailure(format!("Explicit server fault: {}", payload.message)),
                ),
                Some(proto_install_snapshot_error::Err::ClientNotInCluster(_)) => Err(
                    InstallSnapshotReplyFromPeerError::RetryableFailure("Peer doesn't think we're in the cluster".into()),
                ),
                None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                    "Malformed InstallSnapshot Err".into(),
                )),
            },
            None => Err(InstallSnapshotReplyFromPeerError::RetryableFailure(
                "Malformed InstallSnapshot Result".into(),
            )),
        },
        Ok(Err(transport_error)) => Err(InstallSnapshotReplyFromPeerError::Unreachable(transport_error.to_string())),
        Err(_timeout) => Err(InstallSnapshotReplyFromPeerError::Unreachable(
            "Timed out calling InstallSnapshot".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;
    use crate::replica::VolatileLocalState;

    type Repl = Replica<InMemoryLog<WriteAheadLogEntry>, VolatileLocalState>;

    fn transfer_of(bytes: &[u8], offset: u64) -> (SharedFileBackedOutputStream, SnapshotTransfer) {
        let mut stream = SharedFileBackedOutputStream::new(1024, None);
        stream.write_all(bytes).unwrap();
        let transfer = SnapshotTransfer {
            last_included_term: Term::new(2),
            last_included_index: Index::new(40),
            configuration: None,
            data: stream.acquire(),
            size: stream.count(),
            offset,
        };
        (stream, transfer)
    }

    #[test]
    fn snapshot_is_sent_in_chunks() {
        let payload: Vec<u8> = (0..25u8).collect();
        let me = ReplicaId::new("leader");

        let (_stream, transfer) = transfer_of(&payload, 0);
        let (first, done) = Repl::new_install_snapshot_request(Term::new(5), &me, &transfer, 10).unwrap();
        assert!(!done);
        assert_eq!(first.data, payload[..10].to_vec());
        assert_eq!(first.last_included_index, 40);
        assert_eq!(first.term, 5);

        let (_stream, transfer) = transfer_of(&payload, 20);
        let (last, done) = Repl::new_install_snapshot_request(Term::new(5), &me, &transfer, 10).unwrap();
        assert!(done);
        assert_eq!(last.offset, 20);
        assert_eq!(last.data, payload[20..].to_vec());
    }

    #[test]
    fn offset_mismatch_is_reported() {
        let reply = ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(
                crate::rpc::ProtoInstallSnapshotError {
                    err: Some(proto_install_snapshot_error::Err::UnexpectedOffset(
                        crate::rpc::ProtoSnapshotOffsetMismatch { expected_offset: 0 },
                    )),
                },
            )),
        };
        assert!(matches!(
            convert_install_snapshot_rpc_reply(Ok(Ok(reply))),
            Err(InstallSnapshotReplyFromPeerError::UnexpectedOffset { expected_offset: 0 })
        ));
    }
}
