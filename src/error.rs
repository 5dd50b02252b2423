//! Summary: Error types for the ember database engine.
//! Copyright (c) YOAB. All rights reserved.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Result type alias for ember operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for ember database operations.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The database file could not be opened or created.
    FileOpen {
        path: PathBuf,
        source: io::Error,
    },
    /// The exclusive file lock could not be acquired (another process
    /// has the database open).
    FileLock {
        path: PathBuf,
        source: io::Error,
    },
    /// Reading file metadata failed.
    FileMetadata {
        path: PathBuf,
        source: io::Error,
    },
    /// A read from the database file failed.
    FileRead {
        offset: u64,
        len: usize,
        context: &'static str,
        source: io::Error,
    },
    /// A write to the database file failed.
    FileWrite {
        offset: u64,
        len: usize,
        context: &'static str,
        source: io::Error,
    },
    /// An fsync/fdatasync failed.
    FileSync {
        context: &'static str,
        source: io::Error,
    },
    /// Creating or growing a memory map failed.
    Mmap {
        offset: u64,
        len: usize,
        source: io::Error,
    },
    /// The database file is corrupted or inconsistent.
    Corrupted {
        context: &'static str,
        details: String,
    },
    /// The transaction read a key range that a concurrently committed
    /// transaction wrote into.
    Conflict,
    /// A previous commit failed after the point of no return; the store
    /// serves reads but rejects further writes until reopened.
    StoreFailed,
    /// A key or value exceeds the configured maximum size.
    InputTooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FileOpen { path, source } => {
                write!(f, "failed to open database file '{}': {source}", path.display())
            }
            Error::FileLock { path, source } => {
                write!(f, "failed to lock database file '{}': {source}", path.display())
            }
            Error::FileMetadata { path, source } => {
                write!(f, "failed to stat database file '{}': {source}", path.display())
            }
            Error::FileRead { offset, len, context, source } => {
                write!(f, "read of {len} bytes at offset {offset} failed ({context}): {source}")
            }
            Error::FileWrite { offset, len, context, source } => {
                write!(f, "write of {len} bytes at offset {offset} failed ({context}): {source}")
            }
            Error::FileSync { context, source } => {
                write!(f, "sync failed ({context}): {source}")
            }
            Error::Mmap { offset, len, source } => {
                write!(f, "mmap of {len} bytes at offset {offset} failed: {source}")
            }
            Error::Corrupted { context, details } => {
                write!(f, "database corrupted ({context}): {details}")
            }
            Error::Conflict => write!(f, "transaction conflict: a read range was written concurrently"),
            Error::StoreFailed => {
                write!(f, "store is read-only after a failed commit; reopen to recover")
            }
            Error::InputTooLarge { what, len, max } => {
                write!(f, "{what} of {len} bytes exceeds the maximum of {max}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::FileOpen { source, .. }
            | Error::FileLock { source, .. }
            | Error::FileMetadata { source, .. }
            | Error::FileRead { source, .. }
            | Error::FileWrite { source, .. }
            | Error::FileSync { source, .. }
            | Error::Mmap { source, .. } => Some(source),
            _ => None,
        }
    }
}
