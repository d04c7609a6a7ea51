use crate::codec::node::{NodePath, NormalizedNode, PathArgument, QName, Value};
use crate::codec::CodecError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Read, Write};
use std::sync::Arc;

/// Stream layout
///
/// ```text
/// stream    := VERSION node*
/// node      := tag qname value                                (leaf, leaf-set-entry)
///            | tag qname child* END                           (containers and lists)
///            | MAP_ENTRY qname u32 (qname value)* child* END
///            | AUGMENTATION u32 qname* child* END
///            | ANYXML qname string
/// qname     := coded(namespace) coded-or-null(revision) coded(local-name)
/// coded     := 0x01 u32-len utf8     (defines the next code)
///            | 0x02 u32-code
/// path      := u32-count argument*
/// ```
///
/// All integers are big-endian.
pub const STREAM_VERSION: u8 = 1;

/// Deepest node nesting a reader accepts before rejecting the stream.
pub const MAX_NODE_DEPTH: usize = 128;

mod node_tag {
    pub const END: u8 = 0;
    pub const LEAF: u8 = 1;
    pub const LEAF_SET: u8 = 2;
    pub const LEAF_SET_ENTRY: u8 = 3;
    pub const CONTAINER: u8 = 4;
    pub const UNKEYED_LIST: u8 = 5;
    pub const UNKEYED_LIST_ITEM: u8 = 6;
    pub const MAP: u8 = 7;
    pub const MAP_ENTRY: u8 = 8;
    pub const ORDERED_MAP: u8 = 9;
    pub const CHOICE: u8 = 10;
    pub const AUGMENTATION: u8 = 11;
    pub const ANYXML: u8 = 12;
}

mod value_tag {
    pub const BOOL: u8 = 1;
    pub const INT8: u8 = 2;
    pub const INT16: u8 = 3;
    pub const INT32: u8 = 4;
    pub const INT64: u8 = 5;
    pub const STRING: u8 = 6;
    pub const BINARY: u8 = 7;
    pub const BITS: u8 = 8;
    pub const QNAME: u8 = 9;
    pub const DECIMAL: u8 = 10;
    pub const BIG_INTEGER: u8 = 11;
    pub const IDENTIFIER: u8 = 12;
    pub const EMPTY: u8 = 13;
}

mod path_tag {
    pub const NODE: u8 = 1;
    pub const NODE_WITH_PREDICATES: u8 = 2;
    pub const NODE_WITH_VALUE: u8 = 3;
    pub const AUGMENTATION: u8 = 4;
}

mod string_tag {
    pub const NULL: u8 = 0;
    pub const INLINE: u8 = 1;
    pub const CODE: u8 = 2;
}

/// NodeStreamWriter encodes nodes, values and paths into a single versioned stream. Strings used
/// in QNames are written once and referenced by code afterwards, so one writer should be used for
/// the whole stream.
pub struct NodeStreamWriter<W: Write> {
    sink: W,
    header_written: bool,
    string_codes: HashMap<Arc<str>, u32>,
}

impl<W: Write> NodeStreamWriter<W> {
    pub fn new(sink: W) -> Self {
        NodeStreamWriter {
            sink,
            header_written: false,
            string_codes: HashMap::new(),
        }
    }

    pub fn write_node(&mut self, node: &NormalizedNode) -> Result<(), CodecError> {
        self.ensure_header()?;
        self.write_node_body(node)
    }

    pub fn write_path(&mut self, path: &NodePath) -> Result<(), CodecError> {
        self.ensure_header()?;
        self.write_path_body(path)
    }

    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        self.ensure_header()?;
        self.write_value_body(value)
    }

    pub fn flush(&mut self) -> Result<(), CodecError> {
        self.sink.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    fn ensure_header(&mut self) -> Result<(), CodecError> {
        if !self.header_written {
            self.sink.write_u8(STREAM_VERSION)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn write_node_body(&mut self, node: &NormalizedNode) -> Result<(), CodecError> {
        match node {
            NormalizedNode::Leaf(name, value) => {
                self.sink.write_u8(node_tag::LEAF)?;
                self.write_qname(name)?;
                self.write_value_body(value)
            }
            NormalizedNode::LeafSetEntry(name, value) => {
                self.sink.write_u8(node_tag::LEAF_SET_ENTRY)?;
                self.write_qname(name)?;
                self.write_value_body(value)
            }
            NormalizedNode::AnyXml(name, body) => {
                self.sink.write_u8(node_tag::ANYXML)?;
                self.write_qname(name)?;
                self.write_plain_string(body)
            }
            NormalizedNode::LeafSet(name, children) => self.write_parent(node_tag::LEAF_SET, name, children),
            NormalizedNode::Container(name, children) => self.write_parent(node_tag::CONTAINER, name, children),
            NormalizedNode::UnkeyedList(name, children) => self.write_parent(node_tag::UNKEYED_LIST, name, children),
            NormalizedNode::UnkeyedListItem(name, children) => {
                self.write_parent(node_tag::UNKEYED_LIST_ITEM, name, children)
            }
            NormalizedNode::Map(name, children) => self.write_parent(node_tag::MAP, name, children),
            NormalizedNode::OrderedMap(name, children) => self.write_parent(node_tag::ORDERED_MAP, name, children),
            NormalizedNode::Choice(name, children) => self.write_parent(node_tag::CHOICE, name, children),
            NormalizedNode::MapEntry(name, keys, children) => {
                self.sink.write_u8(node_tag::MAP_ENTRY)?;
                self.write_qname(name)?;
                self.write_predicates(keys)?;
                self.write_children(children)
            }
            NormalizedNode::Augmentation(names, children) => {
                self.sink.write_u8(node_tag::AUGMENTATION)?;
                self.write_qname_set(names)?;
                self.write_children(children)
            }
        }
    }

    fn write_parent(&mut self, tag: u8, name: &QName, children: &[NormalizedNode]) -> Result<(), CodecError> {
        self.sink.write_u8(tag)?;
        self.write_qname(name)?;
        self.write_children(children)
    }

    fn write_children(&mut self, children: &[NormalizedNode]) -> Result<(), CodecError> {
        for child in children {
            self.write_node_body(child)?;
        }
        self.sink.write_u8(node_tag::END)?;
        Ok(())
    }

    fn write_predicates(&mut self, keys: &BTreeMap<QName, Value>) -> Result<(), CodecError> {
        self.sink.write_u32::<BigEndian>(keys.len() as u32)?;
        for (key, value) in keys.iter() {
            self.write_qname(key)?;
            self.write_value_body(value)?;
        }
        Ok(())
    }

    fn write_qname_set(&mut self, names: &BTreeSet<QName>) -> Result<(), CodecError> {
        self.sink.write_u32::<BigEndian>(names.len() as u32)?;
        for name in names.iter() {
            self.write_qname(name)?;
        }
        Ok(())
    }

    fn write_path_body(&mut self, path: &NodePath) -> Result<(), CodecError> {
        self.sink.write_u32::<BigEndian>(path.arguments().len() as u32)?;
        for argument in path.arguments() {
            match argument {
                PathArgument::Node(name) => {
                    self.sink.write_u8(path_tag::NODE)?;
                    self.write_qname(name)?;
                }
                PathArgument::NodeWithPredicates(name, keys) => {
                    self.sink.write_u8(path_tag::NODE_WITH_PREDICATES)?;
                    self.write_qname(name)?;
                    self.write_predicates(keys)?;
                }
                PathArgument::NodeWithValue(name, value) => {
                    self.sink.write_u8(path_tag::NODE_WITH_VALUE)?;
                    self.write_qname(name)?;
                    self.write_value_body(value)?;
                }
                PathArgument::Augmentation(names) => {
                    self.sink.write_u8(path_tag::AUGMENTATION)?;
                    self.write_qname_set(names)?;
                }
            }
        }
        Ok(())
    }

    fn write_value_body(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Bool(v) => {
                self.sink.write_u8(value_tag::BOOL)?;
                self.sink.write_u8(*v as u8)?;
            }
            Value::Int8(v) => {
                self.sink.write_u8(value_tag::INT8)?;
                self.sink.write_i8(*v)?;
            }
            Value::Int16(v) => {
                self.sink.write_u8(value_tag::INT16)?;
                self.sink.write_i16::<BigEndian>(*v)?;
            }
            Value::Int32(v) => {
                self.sink.write_u8(value_tag::INT32)?;
                self.sink.write_i32::<BigEndian>(*v)?;
            }
            Value::Int64(v) => {
                self.sink.write_u8(value_tag::INT64)?;
                self.sink.write_i64::<BigEndian>(*v)?;
            }
            Value::String(v) => {
                self.sink.write_u8(value_tag::STRING)?;
                self.write_plain_string(v)?;
            }
            Value::Binary(bytes) => {
                self.sink.write_u8(value_tag::BINARY)?;
                self.sink.write_u32::<BigEndian>(bytes.len() as u32)?;
                self.sink.write_all(bytes)?;
            }
            Value::Bits(bits) => {
                self.sink.write_u8(value_tag::BITS)?;
                self.sink.write_u32::<BigEndian>(bits.len() as u32)?;
                for bit in bits.iter() {
                    self.write_coded_string(bit)?;
                }
            }
            Value::QName(name) => {
                self.sink.write_u8(value_tag::QNAME)?;
                self.write_qname(name)?;
            }
            Value::Decimal(v) => {
                self.sink.write_u8(value_tag::DECIMAL)?;
                self.write_plain_string(v)?;
            }
            Value::BigInteger(v) => {
                self.sink.write_u8(value_tag::BIG_INTEGER)?;
                self.write_plain_string(v)?;
            }
            Value::Identifier(path) => {
                self.sink.write_u8(value_tag::IDENTIFIER)?;
                self.write_path_body(path)?;
            }
            Value::Empty => {
                self.sink.write_u8(value_tag::EMPTY)?;
            }
        }
        Ok(())
    }

    fn write_qname(&mut self, name: &QName) -> Result<(), CodecError> {
        self.write_coded_string(name.namespace())?;
        match name.revision() {
            Some(revision) => self.write_coded_string(revision)?,
            None => self.sink.write_u8(string_tag::NULL)?,
        }
        self.write_coded_string(name.local_name())
    }

    fn write_coded_string(&mut self, s: &str) -> Result<(), CodecError> {
        if let Some(code) = self.string_codes.get(s) {
            self.sink.write_u8(string_tag::CODE)?;
            self.sink.write_u32::<BigEndian>(*code)?;
            return Ok(());
        }

        self.sink.write_u8(string_tag::INLINE)?;
        self.write_plain_string(s)?;
        let code = self.string_codes.len() as u32;
        self.string_codes.insert(Arc::from(s), code);
        Ok(())
    }

    fn write_plain_string(&mut self, s: &str) -> Result<(), CodecError> {
        self.sink.write_u32::<BigEndian>(s.len() as u32)?;
        self.sink.write_all(s.as_bytes())?;
        Ok(())
    }
}

/// NodeStreamReader is the inverse of `NodeStreamWriter`.
pub struct NodeStreamReader<R: Read> {
    source: R,
    header_read: bool,
    strings: Vec<Arc<str>>,
    depth: usize,
}

impl<R: Read> NodeStreamReader<R> {
    pub fn new(source: R) -> Self {
        NodeStreamReader {
            source,
            header_read: false,
            strings: Vec::new(),
            depth: 0,
        }
    }

    pub fn read_node(&mut self) -> Result<NormalizedNode, CodecError> {
        self.ensure_header()?;
        let tag = self.source.read_u8()?;
        self.read_node_body(tag)
    }

    pub fn read_path(&mut self) -> Result<NodePath, CodecError> {
        self.ensure_header()?;
        self.read_path_body()
    }

    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        self.ensure_header()?;
        self.read_value_body()
    }

    pub fn into_inner(self) -> R {
        self.source
    }

    fn ensure_header(&mut self) -> Result<(), CodecError> {
        if !self.header_read {
            let version = self.source.read_u8()?;
            if version != STREAM_VERSION {
                return Err(CodecError::UnsupportedVersion(version));
            }
            self.header_read = true;
        }
        Ok(())
    }

    fn read_node_body(&mut self, tag: u8) -> Result<NormalizedNode, CodecError> {
        let node = match tag {
            node_tag::LEAF => {
                let name = self.read_qname()?;
                NormalizedNode::Leaf(name, self.read_value_body()?)
            }
            node_tag::LEAF_SET_ENTRY => {
                let name = self.read_qname()?;
                NormalizedNode::LeafSetEntry(name, self.read_value_body()?)
            }
            node_tag::ANYXML => {
                let name = self.read_qname()?;
                NormalizedNode::AnyXml(name, self.read_plain_string()?)
            }
            node_tag::LEAF_SET => {
                let name = self.read_qname()?;
                NormalizedNode::LeafSet(name, self.read_children()?)
            }
            node_tag::CONTAINER => {
                let name = self.read_qname()?;
                NormalizedNode::Container(name, self.read_children()?)
            }
            node_tag::UNKEYED_LIST => {
                let name = self.read_qname()?;
                NormalizedNode::UnkeyedList(name, self.read_children()?)
            }
            node_tag::UNKEYED_LIST_ITEM => {
                let name = self.read_qname()?;
                NormalizedNode::UnkeyedListItem(name, self.read_children()?)
            }
            node_tag::MAP => {
                let name = self.read_qname()?;
                NormalizedNode::Map(name, self.read_children()?)
            }
            node_tag::ORDERED_MAP => {
                let name = self.read_qname()?;
                NormalizedNode::OrderedMap(name, self.read_children()?)
            }
            node_tag::CHOICE => {
                let name = self.read_qname()?;
                NormalizedNode::Choice(name, self.read_children()?)
            }
            node_tag::MAP_ENTRY => {
                let name = self.read_qname()?;
                let keys = self.read_predicates()?;
                NormalizedNode::MapEntry(name, keys, self.read_children()?)
            }
            node_tag::AUGMENTATION => {
                let names = self.read_qname_set()?;
                NormalizedNode::Augmentation(names, self.read_children()?)
            }
            unknown => return Err(CodecError::UnknownNodeType(unknown)),
        };
        Ok(node)
    }

    fn read_children(&mut self) -> Result<Vec<NormalizedNode>, CodecError> {
        if self.depth >= MAX_NODE_DEPTH {
            return Err(CodecError::InvalidTree(format!(
                "Nodes nested deeper than {}",
                MAX_NODE_DEPTH
            )));
        }
        self.depth += 1;
        let children = self.read_child_nodes();
        self.depth -= 1;
        children
    }

    fn read_child_nodes(&mut self) -> Result<Vec<NormalizedNode>, CodecError> {
        let mut children = Vec::new();
        loop {
            let tag = self.source.read_u8()?;
            if tag == node_tag::END {
                return Ok(children);
            }
            children.push(self.read_node_body(tag)?);
        }
    }

    fn read_predicates(&mut self) -> Result<BTreeMap<QName, Value>, CodecError> {
        let count = self.source.read_u32::<BigEndian>()?;
        let mut keys = BTreeMap::new();
        for _ in 0..count {
            let key = self.read_qname()?;
            let value = self.read_value_body()?;
            keys.insert(key, value);
        }
        Ok(keys)
    }

    fn read_qname_set(&mut self) -> Result<BTreeSet<QName>, CodecError> {
        let count = self.source.read_u32::<BigEndian>()?;
        let mut names = BTreeSet::new();
        for _ in 0..count {
            names.insert(self.read_qname()?);
        }
        Ok(names)
    }

    fn read_path_body(&mut self) -> Result<NodePath, CodecError> {
        let count = self.source.read_u32::<BigEndian>()?;
        let mut arguments = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let argument = match self.source.read_u8()? {
                path_tag::NODE => PathArgument::Node(self.read_qname()?),
                path_tag::NODE_WITH_PREDICATES => {
                    let name = self.read_qname()?;
                    PathArgument::NodeWithPredicates(name, self.read_predicates()?)
                }
                path_tag::NODE_WITH_VALUE => {
                    let name = self.read_qname()?;
                    PathArgument::NodeWithValue(name, self.read_value_body()?)
                }
                path_tag::AUGMENTATION => PathArgument::Augmentation(self.read_qname_set()?),
                unknown => return Err(CodecError::UnknownPathArgument(unknown)),
            };
            arguments.push(argument);
        }
        Ok(NodePath::new(arguments))
    }

    fn read_value_body(&mut self) -> Result<Value, CodecError> {
        let value = match self.source.read_u8()? {
            value_tag::BOOL => Value::Bool(self.source.read_u8()? != 0),
            value_tag::INT8 => Value::Int8(self.source.read_i8()?),
            value_tag::INT16 => Value::Int16(self.source.read_i16::<BigEndian>()?),
            value_tag::INT32 => Value::Int32(self.source.read_i32::<BigEndian>()?),
            value_tag::INT64 => Value::Int64(self.source.read_i64::<BigEndian>()?),
            value_tag::STRING => Value::String(self.read_plain_string()?),
            value_tag::BINARY => Value::Binary(self.read_bytes()?),
            value_tag::BITS => {
                let count = self.source.read_u32::<BigEndian>()?;
                let mut bits = BTreeSet::new();
                for _ in 0..count {
                    let bit = self.read_coded_string()?;
                    bits.insert(bit.to_string());
                }
                Value::Bits(bits)
            }
            value_tag::QNAME => Value::QName(self.read_qname()?),
            value_tag::DECIMAL => Value::Decimal(self.read_plain_string()?),
            value_tag::BIG_INTEGER => Value::BigInteger(self.read_plain_string()?),
            value_tag::IDENTIFIER => Value::Identifier(self.read_path_body()?),
            value_tag::EMPTY => Value::Empty,
            unknown => return Err(CodecError::UnknownValueType(unknown)),
        };
        Ok(value)
    }

    fn read_qname(&mut self) -> Result<QName, CodecError> {
        let namespace = self.read_coded_string()?;
        let revision = self.read_optional_coded_string()?;
        let local_name = self.read_coded_string()?;
        Ok(QName::from_parts(namespace, revision, local_name))
    }

    fn read_coded_string(&mut self) -> Result<Arc<str>, CodecError> {
        match self.read_optional_coded_string()? {
            Some(s) => Ok(s),
            None => Err(CodecError::InvalidTree("Null string where a value is required".into())),
        }
    }

    fn read_optional_coded_string(&mut self) -> Result<Option<Arc<str>>, CodecError> {
        match self.source.read_u8()? {
            string_tag::NULL => Ok(None),
            string_tag::INLINE => {
                let s: Arc<str> = Arc::from(self.read_plain_string()?);
                self.strings.push(s.clone());
                Ok(Some(s))
            }
            string_tag::CODE => {
                let code = self.source.read_u32::<BigEndian>()?;
                match self.strings.get(code as usize) {
                    Some(s) => Ok(Some(s.clone())),
                    None => Err(CodecError::InvalidStringCode(code)),
                }
            }
            unknown => Err(CodecError::UnknownValueType(unknown)),
        }
    }

    fn read_plain_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_bytes()?;
        Ok(String::from_utf8(bytes)?)
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.source.read_u32::<BigEndian>()? as u64;
        let mut bytes = Vec::new();
        let read = (&mut self.source).take(len).read_to_end(&mut bytes)?;
        if (read as u64) < len {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Truncated length-prefixed field",
            )));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qname(local: &str) -> QName {
        QName::with_revision("urn:opendaylight:inventory", "2013-08-19", local)
    }

    fn keyed(id: &str) -> BTreeMap<QName, Value> {
        let mut keys = BTreeMap::new();
        keys.insert(qname("id"), Value::from(id));
        keys
    }

    fn sample_tree() -> NormalizedNode {
        let mut bits = BTreeSet::new();
        bits.insert("up".to_string());
        bits.insert("enabled".to_string());

        let mut augmented = BTreeSet::new();
        augmented.insert(QName::new("urn:opendaylight:flow", "flow-count"));

        let link_path = NodePath::new(vec![
            PathArgument::Node(qname("nodes")),
            PathArgument::NodeWithPredicates(qname("node"), keyed("node-2")),
        ]);

        NormalizedNode::container(
            qname("nodes"),
            vec![
                NormalizedNode::map(
                    qname("node"),
                    vec![
                        NormalizedNode::map_entry(
                            qname("node"),
                            keyed("node-1"),
                            vec![
                                NormalizedNode::leaf(qname("port-count"), Value::Int16(48)),
                                NormalizedNode::leaf(qname("flags"), Value::Bits(bits)),
                                NormalizedNode::leaf(qname("peer"), Value::Identifier(link_path)),
                                NormalizedNode::Augmentation(
                                    augmented,
                                    vec![NormalizedNode::leaf(
                                        QName::new("urn:opendaylight:flow", "flow-count"),
                                        Value::Int64(-7),
                                    )],
                                ),
                            ],
                        ),
                        NormalizedNode::map_entry(qname("node"), keyed("node-2"), vec![]),
                    ],
                ),
                NormalizedNode::LeafSet(
                    qname("tags"),
                    vec![
                        NormalizedNode::LeafSetEntry(qname("tags"), Value::from("edge")),
                        NormalizedNode::LeafSetEntry(qname("tags"), Value::from("core")),
                    ],
                ),
                NormalizedNode::UnkeyedList(
                    qname("history"),
                    vec![
                        NormalizedNode::UnkeyedListItem(
                            qname("history"),
                            vec![NormalizedNode::leaf(qname("event"), Value::Binary(vec![0, 1, 255]))],
                        ),
                        NormalizedNode::UnkeyedListItem(
                            qname("history"),
                            vec![NormalizedNode::leaf(qname("event"), Value::Empty)],
                        ),
                    ],
                ),
                NormalizedNode::Choice(
                    qname("mode"),
                    vec![NormalizedNode::leaf(qname("rate"), Value::Decimal("12.500".into()))],
                ),
                NormalizedNode::OrderedMap(qname("ordered"), vec![]),
                NormalizedNode::leaf(qname("owner"), Value::QName(QName::new("urn:x", "y"))),
                NormalizedNode::leaf(qname("big"), Value::BigInteger("123456789012345678901234567890".into())),
                NormalizedNode::AnyXml(qname("raw"), "<a>b</a>".into()),
            ],
        )
    }

    fn encode(node: &NormalizedNode) -> Vec<u8> {
        let mut writer = NodeStreamWriter::new(Vec::new());
        writer.write_node(node).unwrap();
        writer.into_inner()
    }

    #[test]
    fn tree_survives_encode_and_decode() {
        let tree = sample_tree();
        assert!(tree.validate().is_ok());

        let bytes = encode(&tree);
        assert_eq!(bytes[0], STREAM_VERSION);

        let mut reader = NodeStreamReader::new(&bytes[..]);
        let decoded = reader.read_node().unwrap();
        assert_eq!(decoded, tree);
    }

    #[test]
    fn repeated_strings_are_written_once() {
        let tree = sample_tree();
        let bytes = encode(&tree);

        let namespace = b"urn:opendaylight:inventory";
        let occurrences = bytes.windows(namespace.len()).filter(|w| w == namespace).count();
        assert_eq!(occurrences, 1);
    }

    #[test]
    fn several_items_share_one_stream() {
        let path = NodePath::new(vec![
            PathArgument::Node(qname("nodes")),
            PathArgument::NodeWithValue(qname("tags"), Value::from("edge")),
        ]);
        let leaf = NormalizedNode::leaf(qname("nodes"), Value::Int32(3));

        let mut writer = NodeStreamWriter::new(Vec::new());
        writer.write_path(&path).unwrap();
        writer.write_node(&leaf).unwrap();
        writer.write_value(&Value::Bool(true)).unwrap();
        let bytes = writer.into_inner();

        let mut reader = NodeStreamReader::new(&bytes[..]);
        assert_eq!(reader.read_path().unwrap(), path);
        assert_eq!(reader.read_node().unwrap(), leaf);
        assert_eq!(reader.read_value().unwrap(), Value::Bool(true));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode(&NormalizedNode::leaf(qname("a"), 1i64));
        bytes[0] = 9;
        match NodeStreamReader::new(&bytes[..]).read_node() {
            Err(CodecError::UnsupportedVersion(9)) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_node_tag() {
        let bytes = vec![STREAM_VERSION, 42];
        match NodeStreamReader::new(&bytes[..]).read_node() {
            Err(CodecError::UnknownNodeType(42)) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn rejects_undefined_string_code() {
        // LEAF, then a namespace referencing code 5 that was never defined
        let bytes = vec![STREAM_VERSION, 1, 2, 0, 0, 0, 5];
        match NodeStreamReader::new(&bytes[..]).read_node() {
            Err(CodecError::InvalidStringCode(5)) => {}
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn truncated_stream_is_an_error() {
        let bytes = encode(&sample_tree());
        let truncated = &bytes[..bytes.len() / 2];
        assert!(NodeStreamReader::new(truncated).read_node().is_err());
    }

    #[test]
    fn rejects_nesting_beyond_limit() {
        // CONTAINER urn:a/c, then the same container referenced by string codes, over and over
        let mut bytes = vec![STREAM_VERSION, node_tag::CONTAINER, 1, 0, 0, 0, 5];
        bytes.extend_from_slice(b"urn:a");
        bytes.extend_from_slice(&[0, 1, 0, 0, 0, 1, b'c']);
        for _ in 0..200_000 {
            bytes.extend_from_slice(&[node_tag::CONTAINER, 2, 0, 0, 0, 0, 0, 2, 0, 0, 0, 1]);
        }
        match NodeStreamReader::new(&bytes[..]).read_node() {
            Err(CodecError::InvalidTree(_)) => {}
            other => panic!("Unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn nesting_at_limit_is_accepted() {
        let mut node = NormalizedNode::leaf(qname("leaf"), 1i64);
        for _ in 0..MAX_NODE_DEPTH {
            node = NormalizedNode::Container(qname("c"), vec![node]);
        }
        let bytes = encode(&node);
        assert_eq!(NodeStreamReader::new(&bytes[..]).read_node().unwrap(), node);
    }
}
