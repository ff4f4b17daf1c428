//! Error types for the scheduled mailer.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No transport configured for default domain {0}")]
    MissingDefaultTransport(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Job {idem_key} already exists")]
    Conflict { idem_key: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Corrupt row {idem_key}: {source}")]
    Codec {
        idem_key: String,
        #[source]
        source: CodecError,
    },
}

/// Attachment blob framing errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input: needed {needed} bytes at offset {offset}, {remaining} remaining")]
    Truncated {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("Unknown attachment field tag: {0}")]
    UnknownTag(u8),

    #[error("Decompression failed: {0}")]
    Compression(String),

    #[error("{0} unexpected bytes after compressed attachment")]
    TrailingBytes(usize),

    #[error("Attachment field {field} is not valid UTF-8")]
    InvalidUtf8 { field: &'static str },

    #[error("Invalid base64 attachment: {0}")]
    Base64(String),

    #[error("Attachment field exceeds 4 GiB: {0} bytes")]
    TooLarge(usize),
}

/// Delivery errors raised by a transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport {name} failed to send: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Transport {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Cannot build message for {name}: {reason}")]
    InvalidMessage { name: String, reason: String },
}

/// Submission rejected at the ingestion boundary.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("Must provide either html_body or text_body")]
    MissingBody,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid send_at: {0}")]
    InvalidSendAt(f64),

    #[error("Malformed request body: {0}")]
    MalformedBody(String),
}

/// Request signature failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing timestamp")]
    MissingTimestamp,

    #[error("Invalid timestamp")]
    InvalidTimestamp,

    #[error("Invalid auth token")]
    InvalidToken,
}

/// Result type alias for the mailer.
pub type Result<T> = std::result::Result<T, Error>;
