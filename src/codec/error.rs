use std::io;

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("IO error")]
    Io(#[from] io::Error),

    #[error("Unsupported stream version {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown node type tag {0}")]
    UnknownNodeType(u8),

    #[error("Unknown value type tag {0}")]
    UnknownValueType(u8),

    #[error("Unknown path argument tag {0}")]
    UnknownPathArgument(u8),

    #[error("String code {0} was never defined in this stream")]
    InvalidStringCode(u32),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("Malformed path '{input}': {reason}")]
    MalformedPath { input: String, reason: String },

    #[error("Invalid tree: {0}")]
    InvalidTree(String),

    #[error(transparent)]
    TypeNotFound(#[from] crate::codec::TypeNotFound),
}
