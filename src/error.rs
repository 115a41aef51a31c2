/*!
 * Error Taxonomy
 *
 * Every failure the engine can produce falls into one of these types.
 * Protocol faults end a connection, command faults become `-ERR` replies,
 * type mismatches never touch stored data, and persistence faults are
 * either fatal at startup or surfaced to the caller of a live mutation.
 */

use thiserror::Error;

/// A malformed frame on the wire or in the log
///
/// Fatal to the connection (or to startup, when found while replaying).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected CRLF terminator")]
    BadTerminator,

    #[error("invalid integer '{0}'")]
    InvalidInteger(String),

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("bulk length {0} exceeds limit")]
    BulkTooLarge(i64),

    #[error("arrays nested deeper than {0} levels")]
    TooDeep(usize),

    #[error("unknown type byte 0x{0:02x}")]
    UnknownType(u8),

    #[error("truncated frame")]
    Truncated,
}

/// A rejected command; the connection stays open
///
/// The `Display` text is exactly what goes into the `-ERR` reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("ERR unknown command '{0}'")]
    Unknown(String),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR invalid command format: expected a non-empty array of bulk strings")]
    MalformedFrame,
}

/// Operation applied to a key holding the other kind of value
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
pub struct WrongType;

/// Failures of the append-only log
#[derive(Debug, Error)]
pub enum AofError {
    #[error("aof I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("aof corrupted at byte {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: ProtocolError,
    },

    #[error("aof truncated: {trailing} trailing bytes at byte {offset} do not form a record")]
    Truncated { offset: u64, trailing: usize },

    #[error("aof record #{index} is not an array of bulk strings")]
    InvalidRecord { index: u64 },

    #[error("aof record #{index} rejected during replay: {reason}")]
    Rejected { index: u64, reason: String },
}

/// Failure of a live command after validation passed
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The in-memory mutation already happened but could not be made durable
    #[error("persistence failure: {0}")]
    Persistence(#[from] AofError),
}
