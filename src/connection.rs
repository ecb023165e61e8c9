use std::{fmt, sync::Arc};

use crate::{
    backend::Backend,
    cursor::Cursor,
    handle::{HandleState, ReleaseOutcome, ResourceHandle},
    native::NativeBackend,
    reclaim::{ReclaimCoordinator, ReclaimMode},
    row::RowView,
    Error, Result,
};

/// Executes queries against a [`Backend`] and hands out borrow-tracked results.
///
/// Cheap to clone; clones share the backend and the reclamation coordinator. Safe to use from
/// many threads at once.
pub struct Connection<B: Backend = NativeBackend> {
    coordinator: Arc<ReclaimCoordinator<B>>,
}

impl<B: Backend> Clone for Connection<B> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<B: Backend> Connection<B> {
    pub fn with_backend(backend: B) -> Self {
        Self::with_reclaim_mode(backend, ReclaimMode::default())
    }

    pub fn with_reclaim_mode(backend: B, mode: ReclaimMode) -> Self {
        Self {
            coordinator: ReclaimCoordinator::new(backend, mode),
        }
    }

    pub fn backend(&self) -> &B {
        self.coordinator.backend()
    }

    pub fn reclaimer(&self) -> &Arc<ReclaimCoordinator<B>> {
        &self.coordinator
    }

    /// Execute `query`.
    ///
    /// # Errors
    ///
    /// [`Error::Engine`] if the engine rejects or fails the query.
    pub fn query(&self, query: &str) -> Result<QueryResult<B>> {
        let execution = self.backend().execute(query)?;
        Ok(QueryResult {
            handle: ResourceHandle::new(execution, self.coordinator.clone()),
        })
    }

    /// Execute `query` and walk it to the end, discarding rows.
    pub fn run(&self, query: &str) -> Result<()> {
        let result = self.query(query)?;
        let mut cursor = result.cursor()?;
        while cursor.advance()? {}
        result.close();
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("reclaimer", &self.coordinator)
            .finish()
    }
}

/// The result of one query.
///
/// Dropping it without [`close`](Self::close) is fine: the buffer is released once the result
/// and every cursor and row derived from it are gone. `close` releases it as soon as reads that
/// are already in flight finish, even if cursors or rows are still around.
pub struct QueryResult<B: Backend = NativeBackend> {
    handle: Arc<ResourceHandle<B>>,
}

impl<B: Backend> QueryResult<B> {
    pub fn column_names(&self) -> &[String] {
        self.handle.column_names()
    }

    pub fn column_count(&self) -> usize {
        self.handle.column_count()
    }

    pub fn state(&self) -> HandleState {
        self.handle.state()
    }

    pub fn is_closed(&self) -> bool {
        self.handle.state() != HandleState::Open
    }

    pub fn handle(&self) -> &Arc<ResourceHandle<B>> {
        &self.handle
    }

    /// The cursor over this result. Each result has exactly one.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] if the cursor was already taken.
    pub fn cursor(&self) -> Result<Cursor<B>> {
        if !self.handle.claim_cursor() {
            return Err(Error::InvalidState("result already has a cursor"));
        }
        Ok(Cursor::new(self.handle.clone()))
    }

    /// Release the result. Idempotent; later calls return
    /// [`ReleaseOutcome::AlreadyRequested`].
    pub fn close(&self) -> ReleaseOutcome {
        self.handle.request_release()
    }

    /// Drive this result's cursor to the end, calling `on_row` for every row.
    pub fn for_each_row<F>(&self, mut on_row: F) -> Result<()>
    where
        F: FnMut(&RowView<B>) -> Result<()>,
    {
        for row in self.cursor()? {
            on_row(&row?)?;
        }
        Ok(())
    }

    pub fn collect<T, F>(&self, mut map: F) -> Result<Vec<T>>
    where
        F: FnMut(&RowView<B>) -> Result<T>,
    {
        let mut out = Vec::new();
        self.for_each_row(|row| {
            out.push(map(row)?);
            Ok(())
        })?;
        Ok(out)
    }
}

impl<B: Backend> fmt::Debug for QueryResult<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("handle", &self.handle)
            .finish()
    }
}
