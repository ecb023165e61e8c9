//! The boundary between the lifetime core and a query engine.
//!
//! A [`Backend`] produces native buffers, walks their rows and hands out borrowed cells. The core
//! only ever calls [`Backend::fetch_next_row`] and [`Backend::read_cell`] while a
//! [`BorrowGuard`](crate::BorrowGuard) is held, and calls [`Backend::dispose`] exactly once per
//! buffer, after the owning handle has reached `Closed`.

use std::borrow::Cow;

use crate::EngineError;

/// What a successful query execution hands to the core.
pub struct Execution<Buf> {
    /// Native memory backing the result.
    pub buffer: Buf,
    /// Column names, in column order.
    pub columns: Vec<String>,
}

/// A column value read out of a native buffer.
///
/// `'b` is the lifetime of the guard-scoped buffer borrow; nothing with this lifetime can outlive
/// the read that produced it. Bytes are borrowed when the engine exposes them in place and owned
/// when it can only hand out copies.
#[derive(Debug, Clone, PartialEq)]
pub enum CellRef<'b> {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(Cow<'b, [u8]>),
    List(Vec<CellRef<'b>>),
    Struct(Vec<(Cow<'b, [u8]>, CellRef<'b>)>),
}

impl<'b> CellRef<'b> {
    pub fn as_str_utf8(&self) -> Option<std::result::Result<&str, std::str::Utf8Error>> {
        match self {
            CellRef::Text(b) => Some(std::str::from_utf8(b)),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellRef::Null)
    }
}

/// A query engine whose results live in memory the engine owns.
///
/// Implementations must tolerate `read_cell` being called from many threads at once against the
/// same buffer; `fetch_next_row` is only ever called by the single cursor of a buffer.
pub trait Backend: Send + Sync + 'static {
    /// The native memory block for one execution.
    type Buffer: Send + Sync + 'static;
    /// A row token. Reading through a stale token must fail with an [`EngineError`], never touch
    /// freed or reused engine memory.
    type Row: Clone + Send + Sync + 'static;

    /// Run `query` and return its result buffer plus column schema.
    fn execute(&self, query: &str) -> Result<Execution<Self::Buffer>, EngineError>;

    /// Advance the engine-side iterator of `buffer`.
    ///
    /// # Safety
    ///
    /// `buffer` must not have been disposed. The core guarantees this by holding a borrow guard.
    unsafe fn fetch_next_row(
        &self,
        buffer: &Self::Buffer,
    ) -> Result<Option<Self::Row>, EngineError>;

    /// Borrow the raw value of `column` in `row`.
    ///
    /// # Safety
    ///
    /// `buffer` must not have been disposed and `row` must have been produced from it.
    unsafe fn read_cell<'b>(
        &'b self,
        buffer: &'b Self::Buffer,
        row: &'b Self::Row,
        column: usize,
    ) -> Result<CellRef<'b>, EngineError>;

    /// Release the native memory. Called exactly once per buffer.
    fn dispose(&self, buffer: Self::Buffer);
}
