use thiserror::Error;

#[derive(Debug, Error)]
pub enum MphError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("key too short for {bits}-bit shard prefix")]
    KeyTooShort { bits: u32 },
    #[error("duplicate key detected during build")]
    DuplicateKey,
    #[error("could not place all buckets within the seed budget")]
    Unbuildable,
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("serialization error: {0}")]
    Serde(#[from] Box<bincode::ErrorKind>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
