//! An in-process [`Backend`] serving canned tables.
//!
//! Each executed query gets its own buffer. The backend watches its buffers the way a native
//! engine's memory would be at risk: every read registers itself on a per-buffer counter that
//! outlives the buffer, and `dispose` records a *violation* if that counter is not zero. A correct
//! lifetime protocol keeps `violations` at zero under any interleaving.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::warn;

use crate::{
    backend::{Backend, CellRef, Execution},
    EngineError, Value,
};

/// Rows and column names returned for one registered query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row. Missing trailing columns are filled with `Null`, extra values are dropped.
    pub fn with_row<I>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = Value>,
    {
        self.push_row(values);
        self
    }

    pub fn push_row<I>(&mut self, values: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let mut row: Vec<Value> = values.into_iter().take(self.columns.len()).collect();
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }
}

/// Counters shared by a [`MemoryBackend`] and every buffer it produced.
#[derive(Debug, Default)]
pub struct MemoryCounters {
    executions: AtomicU64,
    fetch_calls: AtomicU64,
    cell_reads: AtomicU64,
    disposals: AtomicU64,
    violations: AtomicU64,
    live_buffers: AtomicUsize,
}

/// Snapshot of [`MemoryCounters`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub executions: u64,
    pub fetch_calls: u64,
    pub cell_reads: u64,
    pub disposals: u64,
    pub violations: u64,
    pub live_buffers: usize,
}

impl MemoryCounters {
    pub fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            executions: self.executions.load(Ordering::Acquire),
            fetch_calls: self.fetch_calls.load(Ordering::Acquire),
            cell_reads: self.cell_reads.load(Ordering::Acquire),
            disposals: self.disposals.load(Ordering::Acquire),
            violations: self.violations.load(Ordering::Acquire),
            live_buffers: self.live_buffers.load(Ordering::Acquire),
        }
    }

    fn violation(&self, what: &str) {
        self.violations.fetch_add(1, Ordering::AcqRel);
        warn!(what, "memory backend detected a lifetime violation");
    }
}

/// Reads in flight on one buffer. Shared with every [`ReadScope`], so it stays valid even if the
/// buffer is disposed under a read.
type InFlight = Arc<AtomicUsize>;

/// Result memory of one execution.
#[derive(Debug)]
pub struct MemoryBuffer {
    table: Arc<Table>,
    next_row: AtomicUsize,
    fail_at_row: Option<usize>,
    in_flight: InFlight,
}

/// Marks a read in flight on a buffer for as long as it lives.
struct ReadScope {
    in_flight: InFlight,
}

impl ReadScope {
    fn enter(buffer: &MemoryBuffer) -> Self {
        buffer.in_flight.fetch_add(1, Ordering::AcqRel);
        Self {
            in_flight: buffer.in_flight.clone(),
        }
    }
}

impl Drop for ReadScope {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
struct Registered {
    table: Arc<Table>,
    fail_at_row: Option<usize>,
}

/// In-process engine keyed by exact query text.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    queries: RwLock<HashMap<String, Registered>>,
    counters: Arc<MemoryCounters>,
    read_spin: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `table` whenever `query` is executed.
    pub fn register(&self, query: impl Into<String>, table: Table) {
        self.queries.write().insert(
            query.into(),
            Registered {
                table: Arc::new(table),
                fail_at_row: None,
            },
        );
    }

    /// Like [`register`](Self::register), but fetching row `fail_at_row` (0-based) fails.
    pub fn register_failing(&self, query: impl Into<String>, table: Table, fail_at_row: usize) {
        self.queries.write().insert(
            query.into(),
            Registered {
                table: Arc::new(table),
                fail_at_row: Some(fail_at_row),
            },
        );
    }

    /// Busy-wait `iterations` spin hints inside every cell read, widening race windows.
    pub fn set_read_spin(&self, iterations: usize) {
        self.read_spin.store(iterations, Ordering::Relaxed);
    }

    pub fn counters(&self) -> Arc<MemoryCounters> {
        self.counters.clone()
    }

    pub fn stats(&self) -> MemoryStats {
        self.counters.snapshot()
    }
}

impl Backend for MemoryBackend {
    type Buffer = MemoryBuffer;
    type Row = usize;

    fn execute(&self, query: &str) -> Result<Execution<MemoryBuffer>, EngineError> {
        let reg = self
            .queries
            .read()
            .get(query)
            .cloned()
            .ok_or_else(|| EngineError::new(EngineError::FAILED, format!("unknown query: {query}")))?;
        self.counters.executions.fetch_add(1, Ordering::AcqRel);
        self.counters.live_buffers.fetch_add(1, Ordering::AcqRel);
        Ok(Execution {
            columns: reg.table.columns.clone(),
            buffer: MemoryBuffer {
                table: reg.table,
                next_row: AtomicUsize::new(0),
                fail_at_row: reg.fail_at_row,
                in_flight: InFlight::default(),
            },
        })
    }

    unsafe fn fetch_next_row(&self, buffer: &MemoryBuffer) -> Result<Option<usize>, EngineError> {
        let _scope = ReadScope::enter(buffer);
        self.counters.fetch_calls.fetch_add(1, Ordering::AcqRel);
        let i = buffer.next_row.load(Ordering::Acquire);
        if buffer.fail_at_row == Some(i) {
            return Err(EngineError::new(1, format!("scan failed at row {i}")));
        }
        if i >= buffer.table.rows.len() {
            return Ok(None);
        }
        buffer.next_row.store(i + 1, Ordering::Release);
        Ok(Some(i))
    }

    unsafe fn read_cell<'b>(
        &'b self,
        buffer: &'b MemoryBuffer,
        row: &'b usize,
        column: usize,
    ) -> Result<CellRef<'b>, EngineError> {
        let _scope = ReadScope::enter(buffer);
        self.counters.cell_reads.fetch_add(1, Ordering::AcqRel);
        for _ in 0..self.read_spin.load(Ordering::Relaxed) {
            std::hint::spin_loop();
        }
        let value = buffer
            .table
            .rows
            .get(*row)
            .and_then(|r| r.get(column))
            .ok_or_else(|| {
                EngineError::new(EngineError::FAILED, format!("no cell at ({row}, {column})"))
            })?;
        Ok(cell_of(value))
    }

    fn dispose(&self, buffer: MemoryBuffer) {
        if buffer.in_flight.load(Ordering::Acquire) != 0 {
            self.counters.violation("dispose during read");
        }
        self.counters.disposals.fetch_add(1, Ordering::AcqRel);
        self.counters.live_buffers.fetch_sub(1, Ordering::AcqRel);
    }
}

fn cell_of(value: &Value) -> CellRef<'_> {
    match value {
        Value::Null => CellRef::Null,
        Value::Bool(b) => CellRef::Bool(*b),
        Value::Integer(i) => CellRef::Integer(*i),
        Value::Float(f) => CellRef::Float(*f),
        Value::String(s) => CellRef::Text(Cow::Borrowed(s.as_bytes())),
        Value::List(items) => CellRef::List(items.iter().map(cell_of).collect()),
        Value::Struct(fields) => CellRef::Struct(
            fields
                .iter()
                .map(|(k, v)| (Cow::Borrowed(k.as_bytes()), cell_of(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_rows_are_padded_with_null() {
        let t = Table::new(["a", "b"]).with_row([Value::Integer(1)]);
        assert_eq!(t.rows()[0], vec![Value::Integer(1), Value::Null]);
    }

    #[test]
    fn unknown_query_is_an_engine_error() {
        let b = MemoryBackend::new();
        let err = b.execute("MATCH (n) RETURN n").err().unwrap();
        assert!(err.message.contains("unknown query"));
        assert_eq!(b.stats().executions, 0);
    }

    #[test]
    fn dispose_while_reading_is_flagged() {
        let b = MemoryBackend::new();
        b.register("q", Table::new(["a"]).with_row([Value::Integer(1)]));
        let exec = b.execute("q").unwrap();
        let scope = ReadScope::enter(&exec.buffer);
        b.dispose(exec.buffer);
        assert_eq!(b.stats().violations, 1);
        assert_eq!(b.stats().live_buffers, 0);
        // The scope only touches the shared counter, never the disposed buffer.
        drop(scope);
    }

    #[test]
    fn dispose_after_reads_finish_is_clean() {
        let b = MemoryBackend::new();
        b.register("q", Table::new(["a"]).with_row([Value::Integer(1)]));
        let exec = b.execute("q").unwrap();
        let in_flight = exec.buffer.in_flight.clone();
        let row = unsafe { b.fetch_next_row(&exec.buffer) }.unwrap().unwrap();
        let cell = unsafe { b.read_cell(&exec.buffer, &row, 0) }.unwrap();
        assert_eq!(cell, CellRef::Integer(1));
        assert_eq!(in_flight.load(Ordering::Acquire), 0);
        b.dispose(exec.buffer);
        assert_eq!(b.stats().violations, 0);
    }
}
