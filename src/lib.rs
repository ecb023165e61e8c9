//! Rust driver for the lbug graph engine.
//!
//! Query results live in memory owned by the engine. This crate hands them out through
//! [`QueryResult`] / [`Cursor`] / [`RowView`], and guarantees the engine's buffer is never released
//! while a read is touching it:
//!
//! - every read runs inside a [`BorrowGuard`], which bumps an atomic borrow counter on the owning
//!   [`ResourceHandle`];
//! - closing a result (explicitly, or by dropping the last reference) only *requests* release; the
//!   buffer is freed by whichever side observes the counter reach zero afterwards;
//! - every view holds an `Arc` to its handle, so a live view always keeps the buffer reachable.
//!
//! ```no_run
//! use lbug::{Connection, Database, SystemConfig};
//!
//! # fn main() -> lbug::Result<()> {
//! let db = Database::open(None, SystemConfig::default())?;
//! let conn = Connection::open(&db)?;
//! let result = conn.query("MATCH (n:Node) RETURN n.id, n.name")?;
//! for row in result.cursor()? {
//!     let row = row?;
//!     println!("{} {}", row.get_value(0)?, row.get_value(1)?);
//! }
//! # Ok(())
//! # }
//! ```

mod api;
mod backend;
mod connection;
mod cursor;
mod handle;
pub mod memory;
mod native;
mod reclaim;
mod row;
pub mod runtime;
mod sys;
mod value;

use std::{fmt, path::PathBuf};

pub use backend::{Backend, CellRef, Execution};
pub use connection::{Connection, QueryResult};
pub use cursor::Cursor;
pub use handle::{BorrowGuard, HandleState, ReleaseOutcome, ResourceHandle};
pub use memory::{MemoryBackend, Table};
pub use native::{Database, NativeBackend, NativeBuffer, NativeRow, SystemConfig};
pub use reclaim::{ReclaimCoordinator, ReclaimMode, ReclaimStats};
pub use row::{RowView, ValueView};
pub use runtime::{runtime, Runtime};
pub use value::{convert, Value};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the driver.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The result was closed; treat it as finished.
    #[error("query result has been released")]
    Released,
    /// The result is being closed; no new reads are granted.
    #[error("query result is closing")]
    Closing,
    /// The engine failed mid-scan. The cursor that saw this is exhausted.
    #[error("iteration failed at row {row}: {source}")]
    Iteration {
        row: u64,
        #[source]
        source: EngineError,
    },
    /// API misuse, e.g. reading a row before advancing.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("column index {index} out of range for {count} columns")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("no column named '{0}'")]
    UnknownColumn(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// An error reported by the engine, or by the driver on the engine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub code: i32,
    pub message: String,
}

impl EngineError {
    /// Generic failure reported by the driver.
    pub const FAILED: i32 = -1;
    /// Text coming out of the engine was not valid UTF-8.
    pub const UTF8: i32 = -2;
    /// Input handed to the engine contained an interior NUL.
    pub const NUL: i32 = -3;
    /// The row was read after a later fetch replaced it in engine memory.
    pub const STALE_ROW: i32 = -4;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "lbug error (code {})", self.code)
        } else {
            write!(f, "lbug error (code {}): {}", self.code, self.message)
        }
    }
}

impl std::error::Error for EngineError {}

/// Failure to bring up the native runtime. Cached by [`runtime()`], hence `Clone`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to load lbug runtime '{}': {message}", path.display())]
    Load { path: PathBuf, message: String },
    #[error("failed to resolve lbug ABI symbols from '{}': {message}", path.display())]
    Symbols { path: PathBuf, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_display() {
        let e = EngineError::new(3, "boom");
        assert_eq!(e.to_string(), "lbug error (code 3): boom");
        assert_eq!(EngineError::new(1, "").to_string(), "lbug error (code 1)");
    }

    #[test]
    fn iteration_error_keeps_source() {
        use std::error::Error as _;
        let e = Error::Iteration {
            row: 4,
            source: EngineError::new(1, "scan aborted"),
        };
        assert!(e.to_string().contains("row 4"));
        assert!(e.source().unwrap().to_string().contains("scan aborted"));
    }
}
