//! Mapping between wire messages and replica types. On the wire, 0 stands for "no index" and
//! `(0, 0)` for "no previous entry".
use crate::commitlog::Index;
use crate::replica::{EntryKind, EntryOrigin, Term, WriteAheadLogEntry};
use crate::rpc::proto::{ProtoClientRequestId, ProtoEntryKind, ProtoLogEntry};

pub(crate) fn log_entry_to_proto(entry: WriteAheadLogEntry) -> ProtoLogEntry {
    let kind = match entry.kind {
        EntryKind::Command => ProtoEntryKind::Command,
        EntryKind::Noop => ProtoEntryKind::Noop,
        EntryKind::ServerConfig => ProtoEntryKind::ServerConfig,
    };
    ProtoLogEntry {
        term: entry.term.as_u64(),
        data: entry.data,
        client_request_id: entry.client_request_id.map(|origin| ProtoClientRequestId {
            client: origin.client,
            sequence: origin.sequence,
        }),
        kind: kind as i32,
    }
}

pub(crate) fn log_entry_from_proto(entry: ProtoLogEntry) -> Result<WriteAheadLogEntry, String> {
    let term = Term::new(entry.term);
    match ProtoEntryKind::from_i32(entry.kind) {
        Some(ProtoEntryKind::Command) => {
            let origin = entry.client_request_id.map(|id| EntryOrigin {
                client: id.client,
                sequence: id.sequence,
            });
            Ok(WriteAheadLogEntry::new(term, origin, entry.data))
        }
        Some(ProtoEntryKind::Noop) => Ok(WriteAheadLogEntry::noop(term)),
        Some(ProtoEntryKind::ServerConfig) => Ok(WriteAheadLogEntry::server_config(term, entry.data)),
        None => Err(format!("Unknown log entry kind {}", entry.kind)),
    }
}

pub(crate) fn log_entry_metadata_from_proto(term: u64, index: u64) -> Result<Option<(Term, Index)>, String> {
    match (term, index) {
        (0, 0) => Ok(None),
        (0, _) => Err("Log entry term 0 with non-0 index".to_string()),
        (_, 0) => Err("Log entry index 0 with non-0 term".to_string()),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

pub(crate) fn log_entry_metadata_to_proto(metadata: Option<(Term, Index)>) -> (u64, u64) {
    match metadata {
        None => (0, 0),
        Some((term, index)) => (term.as_u64(), index.as_u64()),
    }
}

pub(crate) fn index_from_proto(index: u64) -> Option<Index> {
    Index::from_u64_opt(index)
}

pub(crate) fn index_to_proto(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}
