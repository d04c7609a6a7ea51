use crate::commitlog;
use crate::replica::Term;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::convert::TryFrom;
use std::io;
use std::io::{Cursor, Read};

/// Byte representation:
///
/// ```text
/// +-----+---------------+------+- - - - - - - - - - - - - - - - - - - - - -+-----...-+
/// | Vrs | Term (8 bytes)| Flag | [ClientLen (2) | Client (var) | Seq (8)] | Data ... |
/// +-----+---------------+------+- - - - - - - - - - - - - - - - - - - - - -+-----...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - raft leadership term when this entry was created
/// * `Flag` - 1 if a client request id follows, 2 for a leader no-op entry, 3 for a membership
///   entry, else 0
/// * `Data` - app specific data payload, or the encoded membership, runs to the end of the record
///
/// Checksums and the record length are the journal's job.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub(crate) term: Term,
    pub(crate) kind: EntryKind,
    pub(crate) client_request_id: Option<EntryOrigin>,
    pub(crate) data: Vec<u8>,
}

/// Only `Command` entries reach the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Command,
    /// Appended by a new leader to commit entries of earlier terms.
    Noop,
    /// Cluster membership, in effect from the moment it is appended.
    ServerConfig,
}

impl WriteAheadLogEntry {
    pub(crate) fn new(term: Term, client_request_id: Option<EntryOrigin>, data: Vec<u8>) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::Command,
            client_request_id,
            data,
        }
    }

    pub(crate) fn noop(term: Term) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::Noop,
            client_request_id: None,
            data: Vec::new(),
        }
    }

    pub(crate) fn server_config(term: Term, encoded_configuration: Vec<u8>) -> Self {
        WriteAheadLogEntry {
            term,
            kind: EntryKind::ServerConfig,
            client_request_id: None,
            data: encoded_configuration,
        }
    }

    pub(crate) fn is_command(&self) -> bool {
        self.kind == EntryKind::Command
    }
}

/// The client write an entry was created for, used to drop retried duplicates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EntryOrigin {
    pub(crate) client: String,
    pub(crate) sequence: u64,
}

const WAL_ENTRY_FORMAT_VERSION: u8 = 2;
const NO_ORIGIN: u8 = 0;
const HAS_ORIGIN: u8 = 1;
const NOOP: u8 = 2;
const SERVER_CONFIG: u8 = 3;

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = io::Error;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        let mut cursor = Cursor::new(bytes);

        let version = cursor.read_u8()?;
        if version != WAL_ENTRY_FORMAT_VERSION {
            return Err(invalid_data(format!("Unknown log entry version {}", version)));
        }
        let term = Term::new(cursor.read_u64::<BigEndian>()?);

        let mut kind = EntryKind::Command;
        let client_request_id = match cursor.read_u8()? {
            NO_ORIGIN => None,
            NOOP => {
                kind = EntryKind::Noop;
                None
            }
            SERVER_CONFIG => {
                kind = EntryKind::ServerConfig;
                None
            }
            HAS_ORIGIN => {
                let len = cursor.read_u16::<BigEndian>()? as usize;
                let mut client = vec![0u8; len];
                cursor.read_exact(&mut client)?;
                let client = String::from_utf8(client).map_err(|e| invalid_data(e.to_string()))?;
                let sequence = cursor.read_u64::<BigEndian>()?;
                Some(EntryOrigin { client, sequence })
            }
            flag => return Err(invalid_data(format!("Unknown origin flag {}", flag))),
        };

        let header_len = cursor.position() as usize;
        let mut bytes = cursor.into_inner();
        let data = bytes.split_off(header_len);

        Ok(WriteAheadLogEntry {
            term,
            kind,
            client_request_id,
            data,
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let origin_len = entry
            .client_request_id
            .as_ref()
            .map(|origin| 2 + origin.client.len() + 8)
            .unwrap_or(0);
        let mut bytes = Vec::with_capacity(1 + 8 + 1 + origin_len + entry.data.len());

        // Writes to a Vec can't fail.
        let _ = bytes.write_u8(WAL_ENTRY_FORMAT_VERSION);
        let _ = bytes.write_u64::<BigEndian>(entry.term.as_u64());
        match entry.client_request_id {
            None if entry.kind == EntryKind::Noop => {
                let _ = bytes.write_u8(NOOP);
            }
            None if entry.kind == EntryKind::ServerConfig => {
                let _ = bytes.write_u8(SERVER_CONFIG);
            }
            None => {
                let _ = bytes.write_u8(NO_ORIGIN);
            }
            Some(origin) => {
                let _ = bytes.write_u8(HAS_ORIGIN);
                let _ = bytes.write_u16::<BigEndian>(origin.client.len() as u16);
                bytes.extend_from_slice(origin.client.as_bytes());
                let _ = bytes.write_u64::<BigEndian>(origin.sequence);
            }
        }
        bytes.extend_from_slice(&entry.data);

        bytes
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_without_origin() {
        let entry = WriteAheadLogEntry::new(Term::new(0x0102), None, vec![9, 9]);

        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0, 0, 0, 1, 2, 0, 9, 9]);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn origin_survives_and_data_may_be_empty() {
        let entry = WriteAheadLogEntry::new(
            Term::new(4),
            Some(EntryOrigin {
                client: "writer-1".into(),
                sequence: 77,
            }),
            Vec::new(),
        );

        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn noop_flag() {
        let bytes: Vec<u8> = WriteAheadLogEntry::noop(Term::new(3)).into();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0, 0, 0, 0, 3, 2]);

        let decoded = WriteAheadLogEntry::try_from(bytes).unwrap();
        assert_eq!(decoded.kind, EntryKind::Noop);
        assert!(!decoded.is_command());
        assert_eq!(decoded.term, Term::new(3));
    }

    #[test]
    fn server_config_flag_keeps_payload() {
        let entry = WriteAheadLogEntry::server_config(Term::new(5), vec![0xAA, 0xBB]);
        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(bytes, vec![2, 0, 0, 0, 0, 0, 0, 0, 5, 3, 0xAA, 0xBB]);

        let decoded = WriteAheadLogEntry::try_from(bytes).unwrap();
        assert_eq!(decoded.kind, EntryKind::ServerConfig);
        assert_eq!(decoded, entry);
    }

    #[test]
    fn rejects_bad_records() {
        assert!(WriteAheadLogEntry::try_from(vec![]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![1, 0, 0, 0, 0, 0, 0, 0, 1, 0]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![2, 0, 0, 0, 0, 0, 0, 0, 1, 7]).is_err());
        // Origin flag set but the client id is cut short.
        assert!(WriteAheadLogEntry::try_from(vec![2, 0, 0, 0, 0, 0, 0, 0, 1, 1, 0, 5, b'a']).is_err());
    }
}
