use std::{fmt, sync::Arc};

use crate::{
    backend::{Backend, CellRef},
    handle::ResourceHandle,
    value::{convert, Value},
    Error, Result,
};

/// One row of a query result.
///
/// Holds its own `Arc` to the result handle, so the buffer stays allocated for as long as the
/// view exists. Every read is a separate borrow: if the result is closed in between, the next
/// read fails with [`Error::Closing`] or [`Error::Released`] instead of touching freed memory.
pub struct RowView<B: Backend> {
    handle: Arc<ResourceHandle<B>>,
    row: B::Row,
    index: u64,
}

impl<B: Backend> Clone for RowView<B> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            row: self.row.clone(),
            index: self.index,
        }
    }
}

impl<B: Backend> RowView<B> {
    pub(crate) fn new(handle: Arc<ResourceHandle<B>>, row: B::Row, index: u64) -> Self {
        Self { handle, row, index }
    }

    /// 0-based position of this row in the result.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn column_count(&self) -> usize {
        self.handle.column_count()
    }

    pub fn column_names(&self) -> &[String] {
        self.handle.column_names()
    }

    fn check_column(&self, column: usize) -> Result<()> {
        let count = self.handle.column_count();
        if column >= count {
            return Err(Error::IndexOutOfRange {
                index: column,
                count,
            });
        }
        Ok(())
    }

    /// Run `f` on the raw cell while the borrow is held.
    fn read<T, F>(&self, column: usize, f: F) -> Result<T>
    where
        F: for<'b> FnOnce(CellRef<'b>) -> Result<T>,
    {
        let guard = self.handle.acquire()?;
        let cell = unsafe { guard.backend().read_cell(guard.buffer(), &self.row, column) }?;
        f(cell)
    }

    /// Read and convert the value in `column`.
    pub fn get_value(&self, column: usize) -> Result<Value> {
        self.check_column(column)?;
        self.read(column, |cell| Ok(convert(&cell)?))
    }

    /// Read and convert every column, under a single borrow.
    pub fn values(&self) -> Result<Vec<Value>> {
        let guard = self.handle.acquire()?;
        let backend = guard.backend();
        (0..self.handle.column_count())
            .map(|column| -> Result<Value> {
                let cell = unsafe { backend.read_cell(guard.buffer(), &self.row, column) }?;
                Ok(convert(&cell)?)
            })
            .collect()
    }

    /// A lazy accessor for one column.
    pub fn value(&self, column: usize) -> Result<ValueView<'_, B>> {
        self.check_column(column)?;
        Ok(ValueView { row: self, column })
    }

    /// Look a column up by name.
    pub fn get_by_name(&self, name: &str) -> Result<Value> {
        let column = self
            .column_names()
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| Error::UnknownColumn(name.to_owned()))?;
        self.get_value(column)
    }
}

impl<B: Backend> fmt::Debug for RowView<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowView")
            .field("handle", &self.handle.id())
            .field("index", &self.index)
            .finish()
    }
}

/// One column of a [`RowView`], read on demand.
pub struct ValueView<'r, B: Backend> {
    row: &'r RowView<B>,
    column: usize,
}

impl<B: Backend> ValueView<'_, B> {
    pub fn column(&self) -> usize {
        self.column
    }

    pub fn name(&self) -> &str {
        &self.row.column_names()[self.column]
    }

    /// Read and convert the value.
    pub fn get(&self) -> Result<Value> {
        self.row.read(self.column, |cell| Ok(convert(&cell)?))
    }

    pub fn is_null(&self) -> Result<bool> {
        self.row.read(self.column, |cell| Ok(cell.is_null()))
    }

    /// Inspect the raw cell without converting it.
    ///
    /// The cell borrows the native buffer and cannot escape `f`; the borrow ends when `f`
    /// returns.
    pub fn with_raw<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'b> FnOnce(&CellRef<'b>) -> T,
    {
        self.row.read(self.column, |cell| Ok(f(&cell)))
    }
}
