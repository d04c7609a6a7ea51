use crate::api::{
    ApplyError, ClientRequestId, CommitApplier, RaftCommittedEntry, RecoveryCohort, SnapshotCohort, StateSnapshot,
};
use crate::codec::{CodecError, NodeStreamReader, NodeStreamWriter, NormalizedNode, PathArgument, QName, Value};
use crate::shard::payload::PayloadDecoder;
use crate::shard::tree::{DataTree, DataTreeSnapshot};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const CLIENT_TABLE_NAMESPACE: &str = "urn:shard-raft:clients";

/// Highest applied request sequence per client name. Shared with readers so a new `ShardClient`
/// can continue where its predecessor left off.
pub(crate) type ClientSequences = Arc<Mutex<HashMap<String, u64>>>;

/// Shard applies committed modification batches to its `DataTree` and publishes every new
/// version of the tree to its readers.
///
/// A batch that doesn't fit the tree (e.g. its parent was deleted concurrently) is skipped on
/// every member alike. A payload that can't be decoded halts application.
pub struct Shard {
    logger: slog::Logger,
    tree: DataTree,
    decoder: PayloadDecoder,
    client_sequences: ClientSequences,
    publisher: watch::Sender<DataTreeSnapshot>,
    recovering: bool,
}

impl Shard {
    pub fn new(logger: slog::Logger) -> (Shard, ShardReader) {
        let tree = DataTree::new();
        let (publisher, receiver) = watch::channel(tree.snapshot());
        let client_sequences = ClientSequences::default();

        let shard = Shard {
            logger,
            tree,
            decoder: PayloadDecoder::new(),
            client_sequences: client_sequences.clone(),
            publisher,
            recovering: false,
        };
        let reader = ShardReader {
            receiver,
            client_sequences,
        };

        (shard, reader)
    }

    fn apply_entry(&mut self, entry: &RaftCommittedEntry) -> Result<(), ApplyError> {
        if let Some(request_id) = &entry.client_request_id {
            if self.is_duplicate(request_id) {
                slog::debug!(
                    self.logger,
                    "Dropping duplicate request {}#{} at {}",
                    request_id.client,
                    request_id.sequence,
                    entry.entry_id.index()
                );
                return Ok(());
            }
        }

        let batch = self.decoder.decode(&entry.data)?;
        if let Err(e) = self.tree.apply(&batch) {
            slog::warn!(self.logger, "Skipping modification batch at {}: {}", entry.entry_id.index(), e);
        }

        if let Some(request_id) = &entry.client_request_id {
            self.client_sequences
                .lock()
                .expect("client sequences mutex guard poison")
                .insert(request_id.client.clone(), request_id.sequence);
        }

        Ok(())
    }

    fn is_duplicate(&self, request_id: &ClientRequestId) -> bool {
        self.client_sequences
            .lock()
            .expect("client sequences mutex guard poison")
            .get(&request_id.client)
            .map(|last| request_id.sequence <= *last)
            .unwrap_or(false)
    }

    fn publish(&self) {
        // Nobody may be reading. That's fine.
        let _ = self.publisher.send(self.tree.snapshot());
    }
}

impl CommitApplier for Shard {
    fn apply_committed(&mut self, entry: &RaftCommittedEntry) -> Result<(), ApplyError> {
        self.apply_entry(entry)?;
        self.publish();
        Ok(())
    }
}

impl RecoveryCohort for Shard {
    fn start_recovery_batch(&mut self, max_batch_size: usize) {
        slog::debug!(self.logger, "Starting recovery batch of up to {} entries", max_batch_size);
        self.recovering = true;
    }

    fn append_recovered_entry(&mut self, entry: &RaftCommittedEntry) -> Result<(), ApplyError> {
        self.apply_entry(entry)
    }

    fn apply_recovery_batch(&mut self) -> Result<(), ApplyError> {
        if self.recovering {
            self.recovering = false;
            self.publish();
        }
        Ok(())
    }
}

impl SnapshotCohort for Shard {
    fn capture_state(&self) -> Box<dyn StateSnapshot> {
        let client_sequences = self
            .client_sequences
            .lock()
            .expect("client sequences mutex guard poison")
            .iter()
            .map(|(client, sequence)| (client.clone(), *sequence))
            .collect();

        Box::new(ShardSnapshot {
            tree: self.tree.snapshot(),
            client_sequences,
        })
    }

    fn apply_snapshot(&mut self, source: &mut dyn Read) -> Result<(), ApplyError> {
        let mut reader = NodeStreamReader::new(source);
        let root = reader.read_node()?;
        let client_table = reader.read_node()?;

        let tree = DataTree::from_root(root).map_err(|e| ApplyError::Rejected(e.to_string()))?;
        let client_sequences = decode_client_table(&client_table)?;

        slog::info!(
            self.logger,
            "Restored shard snapshot with {} known clients",
            client_sequences.len()
        );
        self.tree = tree;
        *self
            .client_sequences
            .lock()
            .expect("client sequences mutex guard poison") = client_sequences;
        self.publish();
        Ok(())
    }
}

/// Snapshot stream layout: the tree root, then a map node of client sequences.
struct ShardSnapshot {
    tree: DataTreeSnapshot,
    client_sequences: Vec<(String, u64)>,
}

impl StateSnapshot for ShardSnapshot {
    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        let mut writer = NodeStreamWriter::new(sink);
        writer.write_node(self.tree.root()).map_err(codec_to_io)?;
        writer
            .write_node(&encode_client_table(&self.client_sequences))
            .map_err(codec_to_io)?;
        writer.flush().map_err(codec_to_io)
    }
}

fn codec_to_io(e: CodecError) -> io::Error {
    match e {
        CodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

fn client_qname(local_name: &str) -> QName {
    QName::new(CLIENT_TABLE_NAMESPACE, local_name)
}

fn encode_client_table(client_sequences: &[(String, u64)]) -> NormalizedNode {
    let entries = client_sequences
        .iter()
        .map(|(client, sequence)| {
            let mut keys = BTreeMap::new();
            keys.insert(client_qname("name"), Value::String(client.clone()));
            NormalizedNode::map_entry(
                client_qname("client"),
                keys,
                vec![NormalizedNode::leaf(client_qname("sequence"), *sequence as i64)],
            )
        })
        .collect();

    NormalizedNode::map(client_qname("client"), entries)
}

fn decode_client_table(table: &NormalizedNode) -> Result<HashMap<String, u64>, ApplyError> {
    let name_key = client_qname("name");
    let sequence_leaf = PathArgument::Node(client_qname("sequence"));
    let mut client_sequences = HashMap::with_capacity(table.children().len());

    for entry in table.children() {
        let client = match entry {
            NormalizedNode::MapEntry(_, keys, _) => match keys.get(&name_key) {
                Some(Value::String(client)) => client.clone(),
                _ => return Err(ApplyError::Rejected(format!("Client entry without name: {:?}", entry))),
            },
            _ => return Err(ApplyError::Rejected(format!("Unexpected {} in client table", entry.kind()))),
        };
        let sequence = match entry.child(&sequence_leaf).and_then(|leaf| leaf.value()) {
            Some(Value::Int64(sequence)) => *sequence as u64,
            _ => return Err(ApplyError::Rejected(format!("Client {} has no sequence", client))),
        };
        client_sequences.insert(client, sequence);
    }

    Ok(client_sequences)
}

/// ShardReader gives snapshot-isolated reads of one member's copy of the shard.
#[derive(Clone)]
pub struct ShardReader {
    receiver: watch::Receiver<DataTreeSnapshot>,
    client_sequences: ClientSequences,
}

impl ShardReader {
    /// The latest applied version of the tree. Later applies don't affect it.
    pub fn snapshot(&self) -> DataTreeSnapshot {
        self.receiver.borrow().clone()
    }

    pub fn read(&self, path: &crate::codec::NodePath) -> Option<NormalizedNode> {
        self.snapshot().read(path).cloned()
    }

    /// Waits for the next applied version. None once the shard is gone.
    pub async fn changed(&mut self) -> Option<DataTreeSnapshot> {
        match self.receiver.changed().await {
            Ok(_) => Some(self.receiver.borrow().clone()),
            Err(_) => None,
        }
    }

    pub(crate) fn last_sequence(&self, client: &str) -> Option<u64> {
        self.client_sequences
            .lock()
            .expect("client sequences mutex guard poison")
            .get(client)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RaftEntryId;
    use crate::codec::NodePath;
    use crate::commitlog::Index;
    use crate::replica::Term;
    use crate::shard::payload::ModificationBatch;
    use bytes::Bytes;

    fn qname(local: &str) -> QName {
        QName::new("urn:test", local)
    }

    fn leaf_path(local: &str) -> NodePath {
        NodePath::root().child(PathArgument::Node(qname(local)))
    }

    fn entry_id(index: u64) -> RaftEntryId {
        RaftEntryId {
            term: Term::new(1),
            entry_index: Index::new(index),
        }
    }

    fn committed(index: u64, request: Option<(&str, u64)>, batch: &ModificationBatch) -> RaftCommittedEntry {
        RaftCommittedEntry {
            entry_id: entry_id(index),
            client_request_id: request.map(|(client, sequence)| ClientRequestId::new(client, sequence)),
            data: Bytes::from(batch.encode().unwrap()),
        }
    }

    fn set_counter(value: i32) -> ModificationBatch {
        ModificationBatch::new().write(leaf_path("counter"), NormalizedNode::leaf(qname("counter"), value))
    }

    fn counter(reader: &ShardReader) -> Option<Value> {
        reader.read(&leaf_path("counter")).and_then(|n| n.value().cloned())
    }

    fn new_shard() -> (Shard, ShardReader) {
        Shard::new(slog::Logger::root(slog::Discard, slog::o!()))
    }

    #[test]
    fn committed_batches_are_visible_to_readers() {
        let (mut shard, reader) = new_shard();
        let before = reader.snapshot();

        shard.apply_committed(&committed(1, None, &set_counter(5))).unwrap();

        assert_eq!(counter(&reader), Some(Value::Int32(5)));
        assert!(before.read(&leaf_path("counter")).is_none());
    }

    #[test]
    fn retried_requests_apply_once() {
        let (mut shard, reader) = new_shard();

        shard.apply_committed(&committed(1, Some(("c1", 1)), &set_counter(1))).unwrap();
        shard.apply_committed(&committed(2, Some(("c1", 2)), &set_counter(2))).unwrap();
        // Retry of request 1 that committed again under a new leader.
        shard.apply_committed(&committed(3, Some(("c1", 1)), &set_counter(1))).unwrap();

        assert_eq!(counter(&reader), Some(Value::Int32(2)));
        assert_eq!(reader.last_sequence("c1"), Some(2));
        assert_eq!(reader.last_sequence("c2"), None);
    }

    #[test]
    fn undecodable_payload_is_an_error() {
        let (mut shard, _reader) = new_shard();
        let entry = RaftCommittedEntry {
            entry_id: entry_id(1),
            client_request_id: None,
            data: Bytes::from_static(b"\x01\x00\x04evil\x00\x00\x00\x00"),
        };

        assert!(matches!(
            shard.apply_committed(&entry),
            Err(ApplyError::Codec(CodecError::TypeNotFound(_)))
        ));
    }

    #[test]
    fn batch_that_does_not_fit_is_skipped() {
        let (mut shard, reader) = new_shard();
        let orphan = ModificationBatch::new().write(
            leaf_path("missing").child(PathArgument::Node(qname("x"))),
            NormalizedNode::leaf(qname("x"), 1),
        );

        shard.apply_committed(&committed(1, Some(("c1", 1)), &orphan)).unwrap();
        shard.apply_committed(&committed(2, None, &set_counter(3))).unwrap();

        assert_eq!(counter(&reader), Some(Value::Int32(3)));
        assert_eq!(reader.last_sequence("c1"), Some(1));
    }

    #[test]
    fn snapshot_restores_tree_and_clients() {
        let (mut shard, _reader) = new_shard();
        shard.apply_committed(&committed(1, Some(("c1", 4)), &set_counter(9))).unwrap();

        let mut bytes = Vec::new();
        shard.capture_state().write_to(&mut bytes).unwrap();

        let (mut restored, reader) = new_shard();
        restored.apply_snapshot(&mut bytes.as_slice()).unwrap();

        assert_eq!(counter(&reader), Some(Value::Int32(9)));
        assert_eq!(reader.last_sequence("c1"), Some(4));
    }

    #[test]
    fn recovery_publishes_once_per_batch() {
        let (mut shard, reader) = new_shard();

        shard.start_recovery_batch(2);
        shard.append_recovered_entry(&committed(1, None, &set_counter(1))).unwrap();
        shard.append_recovered_entry(&committed(2, None, &set_counter(2))).unwrap();
        assert_eq!(counter(&reader), None);

        shard.apply_recovery_batch().unwrap();
        assert_eq!(counter(&reader), Some(Value::Int32(2)));
    }
}
