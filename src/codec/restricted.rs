use crate::codec::node::Value;
use crate::codec::CodecError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

const ENVELOPE_VERSION: u8 = 1;

/// Decoder for the body of an allow-listed type.
pub type DecodeFn<T> = fn(&[u8]) -> Result<T, CodecError>;

/// TypeResolver maps a type name to the decoder allowed to read it. Implementations must only
/// return decoders for types they explicitly trust.
pub trait TypeResolver<T>: Send + Sync {
    fn name(&self) -> &str;

    fn resolve(&self, type_name: &str) -> Result<DecodeFn<T>, ResolveError>;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Resolver {resolver} does not allow type {type_name}")]
pub struct ResolveError {
    pub resolver: String,
    pub type_name: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Type {type_name} not found ({} resolvers declined)", .suppressed.len())]
pub struct TypeNotFound {
    pub type_name: String,
    /// One entry per delegate, in the order they were consulted.
    pub suppressed: Vec<ResolveError>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PrimitiveType {
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    String,
    Bytes,
}

impl PrimitiveType {
    pub fn from_name(type_name: &str) -> Option<Self> {
        match type_name {
            "bool" => Some(PrimitiveType::Bool),
            "i8" => Some(PrimitiveType::Int8),
            "i16" => Some(PrimitiveType::Int16),
            "i32" => Some(PrimitiveType::Int32),
            "i64" => Some(PrimitiveType::Int64),
            "string" => Some(PrimitiveType::String),
            "bytes" => Some(PrimitiveType::Bytes),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PrimitiveType::Bool => "bool",
            PrimitiveType::Int8 => "i8",
            PrimitiveType::Int16 => "i16",
            PrimitiveType::Int32 => "i32",
            PrimitiveType::Int64 => "i64",
            PrimitiveType::String => "string",
            PrimitiveType::Bytes => "bytes",
        }
    }

    fn of(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(_) => Some(PrimitiveType::Bool),
            Value::Int8(_) => Some(PrimitiveType::Int8),
            Value::Int16(_) => Some(PrimitiveType::Int16),
            Value::Int32(_) => Some(PrimitiveType::Int32),
            Value::Int64(_) => Some(PrimitiveType::Int64),
            Value::String(_) => Some(PrimitiveType::String),
            Value::Binary(_) => Some(PrimitiveType::Bytes),
            _ => None,
        }
    }

    fn encode(value: &Value) -> Result<Vec<u8>, CodecError> {
        let mut body = Vec::new();
        match value {
            Value::Bool(v) => body.write_u8(*v as u8)?,
            Value::Int8(v) => body.write_i8(*v)?,
            Value::Int16(v) => body.write_i16::<BigEndian>(*v)?,
            Value::Int32(v) => body.write_i32::<BigEndian>(*v)?,
            Value::Int64(v) => body.write_i64::<BigEndian>(*v)?,
            Value::String(v) => body.extend_from_slice(v.as_bytes()),
            Value::Binary(v) => body.extend_from_slice(v),
            other => return Err(CodecError::InvalidTree(format!("{:?} is not a primitive value", other))),
        }
        Ok(body)
    }

    fn decode(&self, mut body: &[u8]) -> Result<Value, CodecError> {
        let value = match self {
            PrimitiveType::Bool => Value::Bool(body.read_u8()? != 0),
            PrimitiveType::Int8 => Value::Int8(body.read_i8()?),
            PrimitiveType::Int16 => Value::Int16(body.read_i16::<BigEndian>()?),
            PrimitiveType::Int32 => Value::Int32(body.read_i32::<BigEndian>()?),
            PrimitiveType::Int64 => Value::Int64(body.read_i64::<BigEndian>()?),
            PrimitiveType::String => Value::String(String::from_utf8(body.to_vec())?),
            PrimitiveType::Bytes => Value::Binary(body.to_vec()),
        };
        Ok(value)
    }
}

pub enum Resolved<T> {
    Primitive(PrimitiveType),
    Type(DecodeFn<T>),
}

/// RestrictedTypeResolver only resolves primitive names and names accepted by one of its
/// delegates. There is no fallback.
pub struct RestrictedTypeResolver<T> {
    delegates: Vec<Arc<dyn TypeResolver<T>>>,
}

impl<T> RestrictedTypeResolver<T> {
    pub fn new(delegates: Vec<Arc<dyn TypeResolver<T>>>) -> Self {
        RestrictedTypeResolver { delegates }
    }

    pub fn resolve(&self, type_name: &str) -> Result<Resolved<T>, TypeNotFound> {
        if let Some(primitive) = PrimitiveType::from_name(type_name) {
            return Ok(Resolved::Primitive(primitive));
        }

        let mut suppressed = Vec::with_capacity(self.delegates.len());
        for delegate in self.delegates.iter() {
            match delegate.resolve(type_name) {
                Ok(decode) => return Ok(Resolved::Type(decode)),
                Err(e) => suppressed.push(e),
            }
        }

        Err(TypeNotFound {
            type_name: type_name.to_string(),
            suppressed,
        })
    }
}

/// AllowListResolver accepts exactly the type names it was built with.
pub struct AllowListResolver<T> {
    name: String,
    allowed: HashMap<String, DecodeFn<T>>,
}

impl<T> AllowListResolver<T> {
    pub fn new(name: impl Into<String>) -> Self {
        AllowListResolver {
            name: name.into(),
            allowed: HashMap::new(),
        }
    }

    pub fn allow(mut self, type_name: impl Into<String>, decode: DecodeFn<T>) -> Self {
        self.allowed.insert(type_name.into(), decode);
        self
    }
}

impl<T> TypeResolver<T> for AllowListResolver<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, type_name: &str) -> Result<DecodeFn<T>, ResolveError> {
        self.allowed.get(type_name).copied().ok_or_else(|| ResolveError {
            resolver: self.name.clone(),
            type_name: type_name.to_string(),
        })
    }
}

pub enum DecodedObject<T> {
    Primitive(Value),
    Typed { type_name: String, value: T },
}

impl<T: fmt::Debug> fmt::Debug for DecodedObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodedObject::Primitive(value) => write!(f, "Primitive({:?})", value),
            DecodedObject::Typed { type_name, value } => write!(f, "Typed({}, {:?})", type_name, value),
        }
    }
}

/// RestrictedObjectWriter writes typed envelopes:
///
/// ```text
/// +---------+----------+-----------+----------+------+
/// | version | name len | type name | body len | body |
/// |  u8     |  u16     |  utf8     |  u32     |      |
/// +---------+----------+-----------+----------+------+
/// ```
pub struct RestrictedObjectWriter<W: Write> {
    sink: W,
}

impl<W: Write> RestrictedObjectWriter<W> {
    pub fn new(sink: W) -> Self {
        RestrictedObjectWriter { sink }
    }

    pub fn write_primitive(&mut self, value: &Value) -> Result<(), CodecError> {
        let primitive = PrimitiveType::of(value)
            .ok_or_else(|| CodecError::InvalidTree(format!("{:?} is not a primitive value", value)))?;
        let body = PrimitiveType::encode(value)?;
        self.write_typed(primitive.name(), &body)
    }

    pub fn write_typed(&mut self, type_name: &str, body: &[u8]) -> Result<(), CodecError> {
        self.sink.write_u8(ENVELOPE_VERSION)?;
        self.sink.write_u16::<BigEndian>(type_name.len() as u16)?;
        self.sink.write_all(type_name.as_bytes())?;
        self.sink.write_u32::<BigEndian>(body.len() as u32)?;
        self.sink.write_all(body)?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// RestrictedObjectReader decodes envelopes, refusing any type its resolver does not allow.
pub struct RestrictedObjectReader<T> {
    resolver: Arc<RestrictedTypeResolver<T>>,
}

impl<T> Clone for RestrictedObjectReader<T> {
    fn clone(&self) -> Self {
        RestrictedObjectReader {
            resolver: self.resolver.clone(),
        }
    }
}

impl<T> RestrictedObjectReader<T> {
    pub fn new(resolver: Arc<RestrictedTypeResolver<T>>) -> Self {
        RestrictedObjectReader { resolver }
    }

    pub fn read_object<R: Read>(&self, source: &mut R) -> Result<DecodedObject<T>, CodecError> {
        let version = source.read_u8()?;
        if version != ENVELOPE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }

        let name_len = source.read_u16::<BigEndian>()? as usize;
        let mut name = vec![0u8; name_len];
        source.read_exact(&mut name)?;
        let type_name = String::from_utf8(name)?;

        // Resolve before reading the body so untrusted payloads are never buffered.
        let resolved = self.resolver.resolve(&type_name)?;

        let body_len = source.read_u32::<BigEndian>()? as u64;
        let mut body = Vec::new();
        source.take(body_len).read_to_end(&mut body)?;
        if (body.len() as u64) < body_len {
            return Err(CodecError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "Truncated envelope body",
            )));
        }

        match resolved {
            Resolved::Primitive(primitive) => Ok(DecodedObject::Primitive(primitive.decode(&body)?)),
            Resolved::Type(decode) => Ok(DecodedObject::Typed {
                type_name,
                value: decode(&body)?,
            }),
        }
    }

    pub fn read_from_slice(&self, mut bytes: &[u8]) -> Result<DecodedObject<T>, CodecError> {
        self.read_object(&mut bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, PartialEq)]
    struct Greeting(String);

    fn decode_greeting(body: &[u8]) -> Result<Greeting, CodecError> {
        Ok(Greeting(String::from_utf8(body.to_vec())?))
    }

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl TypeResolver<Greeting> for CountingResolver {
        fn name(&self) -> &str {
            "counting"
        }

        fn resolve(&self, type_name: &str) -> Result<DecodeFn<Greeting>, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ResolveError {
                resolver: "counting".into(),
                type_name: type_name.into(),
            })
        }
    }

    #[test]
    fn unknown_type_reports_every_delegate() {
        let resolver: RestrictedTypeResolver<Greeting> = RestrictedTypeResolver::new(vec![
            Arc::new(AllowListResolver::new("first").allow("greeting", decode_greeting))
                as Arc<dyn TypeResolver<Greeting>>,
            Arc::new(AllowListResolver::new("second")),
        ]);

        match resolver.resolve("java.lang.Runtime") {
            Err(not_found) => {
                assert_eq!(not_found.type_name, "java.lang.Runtime");
                let resolvers: Vec<&str> = not_found.suppressed.iter().map(|e| e.resolver.as_str()).collect();
                assert_eq!(resolvers, vec!["first", "second"]);
            }
            Ok(_) => panic!("Unexpected resolution"),
        }
    }

    #[test]
    fn primitives_never_consult_delegates() {
        let counting = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let resolver = RestrictedTypeResolver::new(vec![counting.clone() as Arc<dyn TypeResolver<Greeting>>]);

        for name in &["bool", "i8", "i16", "i32", "i64", "string", "bytes"] {
            assert!(matches!(resolver.resolve(name), Ok(Resolved::Primitive(_))));
        }
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);

        assert!(resolver.resolve("greeting").is_err());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reader_decodes_allowed_envelopes_only() {
        let resolver = Arc::new(RestrictedTypeResolver::new(vec![Arc::new(
            AllowListResolver::new("app").allow("greeting", decode_greeting),
        ) as Arc<dyn TypeResolver<Greeting>>]));
        let reader = RestrictedObjectReader::new(resolver);

        let mut writer = RestrictedObjectWriter::new(Vec::new());
        writer.write_typed("greeting", b"hello").unwrap();
        writer.write_primitive(&Value::Int64(-42)).unwrap();
        writer.write_typed("evil", b"payload").unwrap();
        let bytes = writer.into_inner();
        let mut source = &bytes[..];

        match reader.read_object(&mut source).unwrap() {
            DecodedObject::Typed { type_name, value } => {
                assert_eq!(type_name, "greeting");
                assert_eq!(value, Greeting("hello".into()));
            }
            other => panic!("Unexpected object {:?}", other),
        }
        match reader.read_object(&mut source).unwrap() {
            DecodedObject::Primitive(value) => assert_eq!(value, Value::Int64(-42)),
            other => panic!("Unexpected object {:?}", other),
        }
        match reader.read_object(&mut source) {
            Err(CodecError::TypeNotFound(e)) => assert_eq!(e.suppressed.len(), 1),
            other => panic!("Unexpected result {:?}", other),
        }
    }

    #[test]
    fn non_primitive_values_are_not_written_as_primitives() {
        let mut writer = RestrictedObjectWriter::new(Vec::new());
        assert!(writer.write_primitive(&Value::Empty).is_err());
        assert!(writer.into_inner().is_empty());
    }
}
