use crate::actor::WeakActorClient;
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, ReplicaId, RequestVoteError, RequestVoteInput, RequestVoteOutput, ServerConfiguration,
    Term, TimeoutNowError, TimeoutNowInput, TimeoutNowOutput,
};
use crate::rpc::convert;
use crate::rpc::proto::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, proto_timeout_now_error,
    proto_timeout_now_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientNotInCluster,
    ProtoClientStaleTerm, ProtoInstallSnapshotError, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult,
    ProtoInstallSnapshotSuccess, ProtoRequestVoteError, ProtoRequestVoteReq, ProtoRequestVoteResult,
    ProtoRequestVoteSuccess, ProtoServerFault, ProtoServerMissingPreviousLog, ProtoSnapshotOffsetMismatch,
    ProtoTimeoutNowError, ProtoTimeoutNowReq, ProtoTimeoutNowResult, ProtoTimeoutNowSuccess,
};

/// RpcServer is the inbound side of the raft RPCs for one member. A transport hands it decoded
/// requests; it forwards them to the replica task and converts the outcome back to a wire reply.
///
/// It only holds a weak handle on the replica, so a lingering server doesn't keep a stopped
/// member alive. Requests to a stopped member get a `ServerFault` reply.
#[derive(Clone)]
pub struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> ProtoRequestVoteResult {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let app_input = match Self::convert_request_vote_input(rpc_request) {
            Ok(input) => input,
            Err(message) => return request_vote_fault(message),
        };
        let app_result = self.local_replica.request_vote(app_input).await;
        Self::convert_request_vote_result(app_result)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, String> {
        let candidate_last_log_entry =
            convert::log_entry_metadata_from_proto(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let vote = |vote_granted: bool, current_term: Term| ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                vote_granted,
                current_term: current_term.as_u64(),
            })),
        };

        match app_result {
            Ok(ok) => vote(ok.vote_granted, ok.current_term),
            Err(RequestVoteError::CandidateNotInCluster) => vote(false, Term::new(0)),
            Err(RequestVoteError::RequestTermOutOfDate(info)) => vote(false, info.current_term),
            Err(RequestVoteError::LocalIoError(e)) => request_vote_fault(format!("Failed to persist vote: {:?}", e)),
            Err(RequestVoteError::ActorExited) => {
                request_vote_fault("Server internal replica task has exited".to_string())
            }
        }
    }

    pub async fn handle_append_entries(&self, rpc_request: ProtoAppendEntriesReq) -> ProtoAppendEntriesResult {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let app_input = match Self::convert_append_entries_input(rpc_request) {
            Ok(input) => input,
            Err(message) => {
                return append_entries_err(proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message,
                }))
            }
        };
        let app_result = self.local_replica.append_entries(app_input).await;
        Self::convert_append_entries_result(app_result)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, String> {
        let leader_previous_log_entry = convert::log_entry_metadata_from_proto(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let new_entries = rpc_request
            .new_entries
            .into_iter()
            .map(convert::log_entry_from_proto)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_previous_log_entry,
            leader_commit_index: convert::index_from_proto(rpc_request.commit_index),
            new_entries,
        })
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {})),
                }
            }
            Err(AppendEntriesError::ClientNotInCluster) => {
                proto_append_entries_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(AppendEntriesError::ClientTermOutOfDate(info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_entry_index: convert::index_to_proto(last_log_index),
                })
            }
            Err(AppendEntriesError::ServerIoError(e)) => {
                proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: format!("Server IO error: {:?}", e),
                })
            }
            Err(AppendEntriesError::ActorExited) => proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                message: "Server internal replica task has exited".to_string(),
            }),
        };

        append_entries_err(err)
    }

    pub async fn handle_install_snapshot(&self, rpc_request: ProtoInstallSnapshotReq) -> ProtoInstallSnapshotResult {
        slog::debug!(
            self.logger,
            "ServerWire - InstallSnapshot(from={}, term={}, offset={}, len={}, done={})",
            rpc_request.client_node_id,
            rpc_request.term,
            rpc_request.offset,
            rpc_request.data.len(),
            rpc_request.done
        );
        let app_input = match Self::convert_install_snapshot_input(rpc_request) {
            Ok(input) => input,
            Err(message) => {
                return install_snapshot_err(proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message,
                }))
            }
        };
        let app_result = self.local_replica.install_snapshot(app_input).await;
        Self::convert_install_snapshot_result(app_result)
    }

    fn convert_install_snapshot_input(rpc_request: ProtoInstallSnapshotReq) -> Result<InstallSnapshotInput, String> {
        let (last_included_term, last_included_index) =
            convert::log_entry_metadata_from_proto(rpc_request.last_included_term, rpc_request.last_included_index)?
                .ok_or_else(|| "Snapshot must cover at least one entry".to_string())?;

        Ok(InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            last_included_term,
            last_included_index,
            configuration: ServerConfiguration::from_proto(rpc_request.servers),
            offset: rpc_request.offset,
            data: rpc_request.data,
            done: rpc_request.done,
        })
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let err = match app_result {
            Ok(ok) => {
                return ProtoInstallSnapshotResult {
                    result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                        next_offset: ok.next_offset,
                    })),
                }
            }
            Err(InstallSnapshotError::ClientNotInCluster) => {
                proto_install_snapshot_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(InstallSnapshotError::ClientTermOutOfDate(info)) => {
                proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                })
            }
            Err(InstallSnapshotError::UnexpectedOffset { expected_offset, .. }) => {
                proto_install_snapshot_error::Err::UnexpectedOffset(ProtoSnapshotOffsetMismatch { expected_offset })
            }
            Err(e) => proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                message: e.to_string(),
            }),
        };

        install_snapshot_err(err)
    }

    pub async fn handle_timeout_now(&self, rpc_request: ProtoTimeoutNowReq) -> ProtoTimeoutNowResult {
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let app_input = TimeoutNowInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
        };
        let app_result = self.local_replica.timeout_now(app_input).await;
        Self::convert_timeout_now_result(app_result)
    }

    fn convert_timeout_now_result(app_result: Result<TimeoutNowOutput, TimeoutNowError>) -> ProtoTimeoutNowResult {
        let err = match app_result {
            Ok(_) => {
                return ProtoTimeoutNowResult {
                    result: Some(proto_timeout_now_result::Result::Ok(ProtoTimeoutNowSuccess {})),
                }
            }
            Err(TimeoutNowError::ClientNotInCluster) => {
                proto_timeout_now_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(TimeoutNowError::ClientTermOutOfDate(info)) => proto_timeout_now_error::Err::StaleTerm(ProtoClientStaleTerm {
                current_term: info.current_term.as_u64(),
            }),
            Err(e) => proto_timeout_now_error::Err::ServerFault(ProtoServerFault {
                message: e.to_string(),
            }),
        };

        ProtoTimeoutNowResult {
            result: Some(proto_timeout_now_result::Result::Err(ProtoTimeoutNowError { err: Some(err) })),
        }
    }
}

fn request_vote_fault(message: String) -> ProtoRequestVoteResult {
    ProtoRequestVoteResult {
        result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
            err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault { message })),
        })),
    }
}

fn append_entries_err(err: proto_append_entries_error::Err) -> ProtoAppendEntriesResult {
    ProtoAppendEntriesResult {
        result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
            err: Some(err),
        })),
    }
}

fn install_snapshot_err(err: proto_install_snapshot_error::Err) -> ProtoInstallSnapshotResult {
    ProtoInstallSnapshotResult {
        result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
            err: Some(err),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event};
    use crate::commitlog::Index;
    use crate::replica::TermOutOfDateInfo;

    fn server() -> (RpcServer, ActorClient, tokio::sync::mpsc::Receiver<Event>) {
        let (client, rx) = ActorClient::new(4);
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        (RpcServer::new(logger, client.weak()), client, rx)
    }

    #[tokio::test]
    async fn malformed_request_is_a_server_fault() {
        let (server, _client, _rx) = server();
        let reply = server
            .handle_append_entries(ProtoAppendEntriesReq {
                client_node_id: "a".into(),
                term: 1,
                commit_index: 0,
                previous_log_entry_term: 0,
                previous_log_entry_index: 4,
                new_entries: vec![],
            })
            .await;

        assert!(matches!(
            reply.result,
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::ServerFault(_))
            }))
        ));
    }

    #[tokio::test]
    async fn unknown_entry_kind_is_a_server_fault() {
        let (server, _client, _rx) = server();
        let reply = server
            .handle_append_entries(ProtoAppendEntriesReq {
                client_node_id: "a".into(),
                term: 1,
                commit_index: 0,
                previous_log_entry_term: 0,
                previous_log_entry_index: 0,
                new_entries: vec![crate::rpc::ProtoLogEntry {
                    term: 1,
                    data: vec![],
                    client_request_id: None,
                    kind: 7,
                }],
            })
            .await;

        assert!(matches!(
            reply.result,
            Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::ServerFault(_))
            }))
        ));
    }

    #[tokio::test]
    async fn stopped_replica_is_a_server_fault() {
        let (server, client, rx) = server();
        drop(client);
        drop(rx);

        let reply = server
            .handle_request_vote(ProtoRequestVoteReq {
                client_node_id: "a".into(),
                term: 1,
                last_log_entry_index: 0,
                last_log_entry_term: 0,
            })
            .await;
        assert!(matches!(
            reply.result,
            Some(proto_request_vote_result::Result::Err(_))
        ));
    }

    #[test]
    fn replica_errors_map_to_wire_errors() {
        let reply = RpcServer::convert_append_entries_result(Err(AppendEntriesError::ServerMissingPreviousLogEntry {
            last_log_index: Some(Index::new(12)),
        }));
        assert_eq!(
            reply,
            append_entries_err(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                last_log_entry_index: 12
            }))
        );

        let reply = RpcServer::convert_request_vote_result(Err(RequestVoteError::RequestTermOutOfDate(
            TermOutOfDateInfo {
                current_term: Term::new(9),
            },
        )));
        assert_eq!(
            reply.result,
            Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                vote_granted: false,
                current_term: 9,
            }))
        );

        let reply = RpcServer::convert_install_snapshot_result(Err(InstallSnapshotError::UnexpectedOffset {
            offset: 10,
            expected_offset: 4,
        }));
        assert_eq!(
            reply,
            install_snapshot_err(proto_install_snapshot_error::Err::UnexpectedOffset(
                ProtoSnapshotOffsetMismatch { expected_offset: 4 }
            ))
        );

        let reply = RpcServer::convert_timeout_now_result(Err(TimeoutNowError::NotVoting));
        assert!(matches!(
            reply.result,
            Some(proto_timeout_now_result::Result::Err(ProtoTimeoutNowError {
                err: Some(proto_timeout_now_error::Err::ServerFault(_))
            }))
        ));
    }
}
