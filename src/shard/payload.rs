use crate::codec::{
    AllowListResolver, CodecError, DecodedObject, NodePath, NodeStreamReader, NodeStreamWriter, NormalizedNode,
    RestrictedObjectReader, RestrictedObjectWriter, RestrictedTypeResolver, TypeResolver, Value,
};
use std::sync::Arc;

/// Envelope type name of a replicated modification batch.
pub const MODIFICATION_BATCH_TYPE: &str = "shard.modification-batch.v1";

const SHARD_RESOLVER_NAME: &str = "shard";

mod op_tag {
    pub const WRITE: i8 = 1;
    pub const MERGE: i8 = 2;
    pub const DELETE: i8 = 3;
}

#[derive(Clone, Debug, PartialEq)]
pub enum Modification {
    /// Replaces whatever is at `path`.
    Write { path: NodePath, data: NormalizedNode },
    /// Recursively merges `data` into whatever is at `path`.
    Merge { path: NodePath, data: NormalizedNode },
    Delete { path: NodePath },
}

/// ModificationBatch is the command carried by one log entry. It is applied atomically.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModificationBatch {
    modifications: Vec<Modification>,
}

impl ModificationBatch {
    pub fn new() -> Self {
        ModificationBatch::default()
    }

    pub fn write(mut self, path: NodePath, data: NormalizedNode) -> Self {
        self.modifications.push(Modification::Write { path, data });
        self
    }

    pub fn merge(mut self, path: NodePath, data: NormalizedNode) -> Self {
        self.modifications.push(Modification::Merge { path, data });
        self
    }

    pub fn delete(mut self, path: NodePath) -> Self {
        self.modifications.push(Modification::Delete { path });
        self
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn is_empty(&self) -> bool {
        self.modifications.is_empty()
    }

    /// Encodes the batch as a typed envelope around a node stream.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut body = NodeStreamWriter::new(Vec::new());
        body.write_value(&Value::Int32(self.modifications.len() as i32))?;
        for modification in self.modifications.iter() {
            match modification {
                Modification::Write { path, data } => {
                    body.write_value(&Value::Int8(op_tag::WRITE))?;
                    body.write_path(path)?;
                    body.write_node(data)?;
                }
                Modification::Merge { path, data } => {
                    body.write_value(&Value::Int8(op_tag::MERGE))?;
                    body.write_path(path)?;
                    body.write_node(data)?;
                }
                Modification::Delete { path } => {
                    body.write_value(&Value::Int8(op_tag::DELETE))?;
                    body.write_path(path)?;
                }
            }
        }

        let mut envelope = RestrictedObjectWriter::new(Vec::new());
        envelope.write_typed(MODIFICATION_BATCH_TYPE, &body.into_inner())?;
        Ok(envelope.into_inner())
    }

    fn decode_body(body: &[u8]) -> Result<Self, CodecError> {
        let mut reader = NodeStreamReader::new(body);
        let count = match reader.read_value()? {
            Value::Int32(count) if count >= 0 => count as usize,
            other => return Err(malformed(format!("bad modification count {:?}", other))),
        };

        let mut modifications = Vec::with_capacity(count);
        for _ in 0..count {
            let modification = match reader.read_value()? {
                Value::Int8(op_tag::WRITE) => Modification::Write {
                    path: reader.read_path()?,
                    data: reader.read_node()?,
                },
                Value::Int8(op_tag::MERGE) => Modification::Merge {
                    path: reader.read_path()?,
                    data: reader.read_node()?,
                },
                Value::Int8(op_tag::DELETE) => Modification::Delete {
                    path: reader.read_path()?,
                },
                other => return Err(malformed(format!("unknown modification {:?}", other))),
            };
            modifications.push(modification);
        }

        Ok(ModificationBatch { modifications })
    }
}

fn malformed(reason: String) -> CodecError {
    CodecError::InvalidTree(format!("Malformed modification batch: {}", reason))
}

/// PayloadDecoder only accepts envelopes of the shard's own payload types.
#[derive(Clone)]
pub(crate) struct PayloadDecoder {
    reader: RestrictedObjectReader<ModificationBatch>,
}

impl PayloadDecoder {
    pub(crate) fn new() -> Self {
        let allow_list =
            AllowListResolver::new(SHARD_RESOLVER_NAME).allow(MODIFICATION_BATCH_TYPE, ModificationBatch::decode_body);
        let resolver = RestrictedTypeResolver::new(vec![
            Arc::new(allow_list) as Arc<dyn TypeResolver<ModificationBatch>>
        ]);

        PayloadDecoder {
            reader: RestrictedObjectReader::new(Arc::new(resolver)),
        }
    }

    pub(crate) fn decode(&self, payload: &[u8]) -> Result<ModificationBatch, CodecError> {
        match self.reader.read_from_slice(payload)? {
            DecodedObject::Typed { value, .. } => Ok(value),
            DecodedObject::Primitive(value) => Err(malformed(format!("expected an envelope, got {}", value))),
        }
    }
}
