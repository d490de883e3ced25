//! Error types for the trace pipeline.
//!
//! Local, recoverable conditions (a malformed metadata sidecar, a sidecar
//! whose payload file is gone) are handled at the loader boundary and never
//! surface here. Everything else is reported to the direct caller through
//! [`Error`].

use std::path::PathBuf;

use thiserror::Error;

use crate::checker::CheckFailure;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// An event or transaction attribute was read before it was set.
    #[error("attribute not found: {name}")]
    AttributeNotFound { name: String },

    /// A metadata sidecar declared an empty topic name. This aborts loader
    /// construction; it is not skippable like a malformed sidecar.
    #[error("empty topic name in metadata sidecar {path}")]
    InvalidTopicName { path: PathBuf },

    /// The loader has no metadata record for the requested topic.
    #[error("unknown topic: {topic}")]
    UnknownTopic { topic: String },

    /// Streams are only exposed for transaction-bearing topics.
    #[error("topic {topic} holds flat events and cannot be streamed")]
    NotTransactionTopic { topic: String },

    /// A transaction or group with no content reached a serializer buffer.
    #[error("refusing to persist an empty record for topic {topic}")]
    EmptyRecord { topic: String },

    /// A record arrived after `finalize()`.
    #[error("serializer is finalized and accepts no further records")]
    Finalized,

    /// A topic received a record of a different kind than it already holds.
    #[error("topic {topic} already carries {existing} records")]
    KindConflict {
        topic: String,
        existing: &'static str,
    },

    /// A record introduced an attribute after the topic's schema was locked
    /// by the first physical write, or used a reserved column name.
    #[error("attribute {attr:?} does not fit the schema locked for topic {topic}")]
    SchemaMismatch { topic: String, attr: String },

    /// Only the local filesystem backend is wired in.
    #[error("unsupported storage location: {location}")]
    UnsupportedStorage { location: String },

    /// Underlying storage write failed; the topic's sidecar was not written.
    #[error("serialization failed for topic {topic}: {message}")]
    Serialization { topic: String, message: String },

    /// A checker assertion did not hold while running in immediate-raise
    /// mode.
    #[error("check failed: {0}")]
    CheckFailed(CheckFailure),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn serialization(topic: &str, err: impl std::fmt::Display) -> Self {
        Error::Serialization {
            topic: topic.to_string(),
            message: err.to_string(),
        }
    }
}
