use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{backend::Backend, handle::ResourceHandle, row::RowView, Error, Result};

enum Position<R> {
    Ready,
    HasRow { index: u64, row: R },
    Exhausted,
}

/// Forward-only walk over the rows of one result.
///
/// `Ready -> HasRow(0) -> HasRow(1) -> ... -> Exhausted`. Once exhausted, by reaching the end, by
/// an engine error, or because the result was closed, the cursor never contacts the engine again.
///
/// `advance` takes `&mut self`, so one cursor has one driver at a time. Cursors over different
/// results share nothing.
pub struct Cursor<B: Backend> {
    handle: Arc<ResourceHandle<B>>,
    position: Position<B::Row>,
    fetched: u64,
}

impl<B: Backend> Cursor<B> {
    pub(crate) fn new(handle: Arc<ResourceHandle<B>>) -> Self {
        Self {
            handle,
            position: Position::Ready,
            fetched: 0,
        }
    }

    /// Move to the next row. Returns `Ok(false)` at the end of the result.
    ///
    /// # Errors
    ///
    /// - [`Error::Iteration`] if the engine fails; the cursor is exhausted afterwards.
    /// - [`Error::Closing`] / [`Error::Released`] if the result was closed; the cursor is
    ///   exhausted afterwards.
    pub fn advance(&mut self) -> Result<bool> {
        if let Position::Exhausted = self.position {
            return Ok(false);
        }

        let fetched = {
            let guard = match self.handle.acquire() {
                Ok(g) => g,
                Err(e) => {
                    self.position = Position::Exhausted;
                    return Err(e);
                }
            };
            unsafe { guard.backend().fetch_next_row(guard.buffer()) }
        };

        match fetched {
            Ok(Some(row)) => {
                self.position = Position::HasRow {
                    index: self.fetched,
                    row,
                };
                self.fetched += 1;
                Ok(true)
            }
            Ok(None) => {
                debug!(handle = self.handle.id(), rows = self.fetched, "cursor exhausted");
                self.position = Position::Exhausted;
                Ok(false)
            }
            Err(source) => {
                self.position = Position::Exhausted;
                Err(Error::Iteration {
                    row: self.fetched,
                    source,
                })
            }
        }
    }

    /// The row the cursor is on.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before the first successful [`advance`](Self::advance) and after
    /// the cursor is exhausted.
    pub fn current_row(&self) -> Result<RowView<B>> {
        match &self.position {
            Position::HasRow { index, row } => {
                Ok(RowView::new(self.handle.clone(), row.clone(), *index))
            }
            Position::Ready => Err(Error::InvalidState("cursor has not been advanced")),
            Position::Exhausted => Err(Error::InvalidState("cursor is exhausted")),
        }
    }

    /// Index of the current row, if any.
    pub fn position(&self) -> Option<u64> {
        match self.position {
            Position::HasRow { index, .. } => Some(index),
            _ => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.position, Position::Exhausted)
    }

    /// Rows produced so far.
    pub fn rows_fetched(&self) -> u64 {
        self.fetched
    }

    pub fn column_names(&self) -> &[String] {
        self.handle.column_names()
    }
}

impl<B: Backend> Iterator for Cursor<B> {
    type Item = Result<RowView<B>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(true) => Some(self.current_row()),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl<B: Backend> std::iter::FusedIterator for Cursor<B> {}

impl<B: Backend> fmt::Debug for Cursor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("handle", &self.handle.id())
            .field("position", &self.position())
            .field("exhausted", &self.is_exhausted())
            .field("fetched", &self.fetched)
            .finish()
    }
}
