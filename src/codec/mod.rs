//! Data-tree model and its binary and textual encodings.
mod error;
mod node;
mod path;
mod restricted;
mod stream;

pub use error::CodecError;
pub use node::NodePath;
pub use node::NormalizedNode;
pub use node::PathArgument;
pub use node::QName;
pub use node::Value;
pub use path::PathCodec;
pub use path::QNameCache;
pub use restricted::AllowListResolver;
pub use restricted::DecodeFn;
pub use restricted::DecodedObject;
pub use restricted::PrimitiveType;
pub use restricted::ResolveError;
pub use restricted::Resolved;
pub use restricted::RestrictedObjectReader;
pub use restricted::RestrictedObjectWriter;
pub use restricted::RestrictedTypeResolver;
pub use restricted::TypeNotFound;
pub use restricted::TypeResolver;
pub use stream::NodeStreamReader;
pub use stream::NodeStreamWriter;
pub use stream::STREAM_VERSION;
