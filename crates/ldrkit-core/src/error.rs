//! Error types for the ldrkit-core library.
//!
//! Every failure maps onto one of a small set of [`ErrorKind`]s so that
//! front-ends can tell "try the next candidate" apart from "stop here".
//! Non-fatal conditions are not errors at all; see [`Warning`].

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for ldrkit operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A signature or table is absent from the input
    NotFound,
    /// The input is not in the expected format
    FormatInvalid,
    /// A computed location falls outside the buffer
    BoundsViolation,
    /// A file could not be opened, read or written
    Io,
}

/// Comprehensive error type for all ldrkit operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to create output directory
    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreate {
        /// Path to the directory that failed to create
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to read from an input stream
    #[error("failed to read input: {0}")]
    Read(#[from] std::io::Error),

    /// Path traversal attempt detected (security error)
    #[error("path traversal detected: '{path}' would escape the unpack directory")]
    PathTraversal {
        /// The suspicious path
        path: PathBuf,
    },

    /// A named signature does not occur in the buffer
    #[error("signature '{name}' not found")]
    SignatureNotFound {
        /// Name of the signature that was searched for
        name: String,
    },

    /// The partition table head magic does not occur in the input
    #[error("partition table not found")]
    TableNotFound,

    /// Magic constant at the start of a record does not match
    #[error("bad {what} magic: expected {expected}, found {found}")]
    BadMagic {
        /// Which record was being decoded
        what: &'static str,
        /// Expected value, rendered for display
        expected: String,
        /// Actual value, rendered for display
        found: String,
    },

    /// Input ended before a fixed-size record was complete
    #[error("{what} too short: need {needed} bytes, have {available}")]
    Truncated {
        /// Which record was being decoded
        what: &'static str,
        /// Bytes required
        needed: usize,
        /// Bytes supplied
        available: usize,
    },

    /// Malformed line in a text format
    #[error("line {line}: {details}")]
    InvalidLine {
        /// 1-based line number
        line: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// Unrecognized key in a text format
    #[error("line {line}: unknown key '{key}'")]
    UnknownKey {
        /// 1-based line number
        line: usize,
        /// The offending key
        key: String,
    },

    /// A text value does not fit its fixed-width field
    #[error("'{value}' is too long: at most {max} bytes allowed")]
    TooLong {
        /// The offending value
        value: String,
        /// Maximum length in bytes
        max: usize,
    },

    /// A bounded sequence would grow beyond its fixed capacity
    #[error("too many {what}: at most {max} allowed")]
    CapacityExceeded {
        /// What was being added
        what: &'static str,
        /// Fixed capacity
        max: usize,
    },

    /// The patch table could not be parsed or is inconsistent
    #[error("invalid patch table: {0}")]
    PatchTable(String),

    /// A patch would write outside the buffer
    #[error(
        "patch '{name}' at {location:#x} (+{len} bytes) falls outside the {buffer_len:#x}-byte buffer"
    )]
    PatchOutOfBounds {
        /// Name of the signature whose patch was being applied
        name: String,
        /// Computed patch location (may be negative)
        location: i64,
        /// Payload length
        len: usize,
        /// Buffer length
        buffer_len: usize,
    },

    /// A value does not fit the 32-bit field it must be stored in
    #[error("{what} of {value:#x} does not fit in a 32-bit field")]
    FieldOverflow {
        /// Which field overflowed
        what: &'static str,
        /// The offending value
        value: u64,
    },
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new directory creation error
    pub fn directory_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreate {
            path: path.into(),
            source,
        }
    }

    /// Creates a new path traversal error
    pub fn path_traversal(path: impl Into<PathBuf>) -> Self {
        Self::PathTraversal { path: path.into() }
    }

    /// Creates a new signature-not-found error
    pub fn signature_not_found(name: impl Into<String>) -> Self {
        Self::SignatureNotFound { name: name.into() }
    }

    /// Creates a new malformed-line error
    pub fn invalid_line(line: usize, details: impl Into<String>) -> Self {
        Self::InvalidLine {
            line,
            details: details.into(),
        }
    }

    /// Creates a new unknown-key error
    pub fn unknown_key(line: usize, key: impl Into<String>) -> Self {
        Self::UnknownKey {
            line,
            key: key.into(),
        }
    }

    /// Creates a new patch table error
    pub fn patch_table(msg: impl Into<String>) -> Self {
        Self::PatchTable(msg.into())
    }

    /// Returns the coarse kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::FileRead { .. }
            | Self::FileWrite { .. }
            | Self::DirectoryCreate { .. }
            | Self::Read(_) => ErrorKind::Io,
            Self::SignatureNotFound { .. } | Self::TableNotFound => ErrorKind::NotFound,
            Self::PatchOutOfBounds { .. } | Self::FieldOverflow { .. } => {
                ErrorKind::BoundsViolation
            }
            Self::PathTraversal { .. }
            | Self::BadMagic { .. }
            | Self::Truncated { .. }
            | Self::InvalidLine { .. }
            | Self::UnknownKey { .. }
            | Self::TooLong { .. }
            | Self::CapacityExceeded { .. }
            | Self::PatchTable(_) => ErrorKind::FormatInvalid,
        }
    }

    /// Returns true if the caller may move on to the next candidate
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// A non-fatal condition surfaced next to a successful result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// A block's declared size disagreed with its payload; the payload length won
    SizeMismatch {
        /// Position of the block in the caller's list
        index: usize,
        /// Size the caller declared
        declared: u32,
        /// Size actually stored
        actual: u32,
    },
    /// A container slot extends past the end of the buffer; extraction stopped there
    BlockTruncated {
        /// Descriptor slot
        slot: usize,
        /// Declared file offset
        offset: u32,
        /// Declared size
        size: u32,
        /// Length of the buffer being decoded
        buffer_len: usize,
    },
    /// A partition table was decoded although its head magic is wrong
    HeadMagicMismatch,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SizeMismatch {
                index,
                declared,
                actual,
            } => write!(
                f,
                "block {index} size mismatch (declared {declared}, actual {actual})"
            ),
            Self::BlockTruncated {
                slot,
                offset,
                size,
                buffer_len,
            } => write!(
                f,
                "block {slot} extends beyond end of input (offset={offset:#x}, size={size:#x}, input size={buffer_len:#x})"
            ),
            Self::HeadMagicMismatch => f.write_str("partition table head magic does not match"),
        }
    }
}
