//! Borrow-tracked ownership of one native result buffer.
//!
//! A [`ResourceHandle`] packs its whole lifecycle into one `AtomicUsize`:
//!
//! ```text
//!  bit 63      bit 62     bits 0..=61
//! [CLOSING]   [CLOSED]   [active borrows]
//! ```
//!
//! - `acquire` is a CAS loop that only succeeds while neither flag is set, so the Open check and
//!   the increment are one atomic step.
//! - `request_release` sets `CLOSING` with `fetch_or`; from then on no borrow is granted.
//! - The word can only move to `CLOSING | CLOSED` from exactly `CLOSING` (zero borrows). Whoever
//!   wins that CAS, the releasing thread or the last guard to drop, takes the buffer out and hands
//!   it to the coordinator. There is no other path to the buffer's destructor.

use std::{
    cell::UnsafeCell,
    fmt,
    mem::ManuallyDrop,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use tracing::{debug, trace};

use crate::{
    backend::{Backend, Execution},
    reclaim::ReclaimCoordinator,
    Error, Result,
};

const CLOSING: usize = 1 << (usize::BITS - 1);
const CLOSED: usize = 1 << (usize::BITS - 2);
const BORROWS: usize = CLOSED - 1;

/// Lifecycle of a [`ResourceHandle`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleState {
    Open,
    /// Release requested; waiting for outstanding borrows to drain.
    Closing,
    /// Buffer freed (or queued for disposal).
    Closed,
}

/// What a call to [`ResourceHandle::request_release`] did.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// No borrows were outstanding; the buffer was handed off for disposal by this call.
    Freed,
    /// Borrows are outstanding; the last one to finish frees the buffer.
    Deferred { borrows: usize },
    /// Release had already been requested by someone else; nothing happened.
    AlreadyRequested,
}

/// Managed owner of one engine buffer.
pub struct ResourceHandle<B: Backend> {
    id: u64,
    word: AtomicUsize,
    buffer: UnsafeCell<ManuallyDrop<B::Buffer>>,
    columns: Vec<String>,
    cursor_taken: AtomicBool,
    coordinator: Arc<ReclaimCoordinator<B>>,
}

// SAFETY: shared access to `buffer` only happens through `BorrowGuard`, and `Backend::Buffer` is
// `Sync`. The single mutable access (taking the buffer out) happens after the CLOSED CAS, when no
// guard exists and none can be created.
unsafe impl<B: Backend> Sync for ResourceHandle<B> {}
unsafe impl<B: Backend> Send for ResourceHandle<B> {}

impl<B: Backend> ResourceHandle<B> {
    pub(crate) fn new(execution: Execution<B::Buffer>, coordinator: Arc<ReclaimCoordinator<B>>) -> Arc<Self> {
        let handle = Arc::new(Self {
            id: coordinator.next_id(),
            word: AtomicUsize::new(0),
            buffer: UnsafeCell::new(ManuallyDrop::new(execution.buffer)),
            columns: execution.columns,
            cursor_taken: AtomicBool::new(false),
            coordinator,
        });
        handle.coordinator.track(&handle);
        handle
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn state(&self) -> HandleState {
        let w = self.word.load(Ordering::Acquire);
        if w & CLOSED != 0 {
            HandleState::Closed
        } else if w & CLOSING != 0 {
            HandleState::Closing
        } else {
            HandleState::Open
        }
    }

    /// Number of reads currently in flight.
    pub fn active_borrows(&self) -> usize {
        self.word.load(Ordering::Acquire) & BORROWS
    }

    /// Whether release has been requested (monotonic).
    pub fn release_requested(&self) -> bool {
        self.word.load(Ordering::Acquire) & CLOSING != 0
    }

    /// Start a read. Fails with [`Error::Closing`] once release has been requested and with
    /// [`Error::Released`] once the buffer is gone.
    pub fn acquire(&self) -> Result<BorrowGuard<'_, B>> {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            if cur & CLOSED != 0 {
                trace!(handle = self.id, "borrow refused: released");
                return Err(Error::Released);
            }
            if cur & CLOSING != 0 {
                trace!(handle = self.id, "borrow refused: closing");
                return Err(Error::Closing);
            }
            if cur & BORROWS == BORROWS {
                // Same policy as `Arc` on refcount overflow.
                std::process::abort();
            }
            match self.word.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(BorrowGuard { handle: self }),
                Err(actual) => cur = actual,
            }
        }
    }

    fn release_borrow(&self) {
        let prev = self.word.fetch_sub(1, Ordering::Release);
        debug_assert!(prev & BORROWS > 0, "borrow released twice");
        if prev == CLOSING | 1 {
            trace!(handle = self.id, "last borrow finished after release request");
            self.finish_close();
        }
    }

    /// Ask for the buffer to be freed. Never blocks.
    ///
    /// New borrows are refused from this point on. If none are outstanding the buffer is handed
    /// to the coordinator now; otherwise the last outstanding guard does it when it drops.
    pub fn request_release(&self) -> ReleaseOutcome {
        let prev = self.word.fetch_or(CLOSING, Ordering::AcqRel);
        if prev & CLOSING != 0 {
            return ReleaseOutcome::AlreadyRequested;
        }
        self.coordinator.note_release();
        let borrows = prev & BORROWS;
        if borrows == 0 {
            debug!(handle = self.id, "release requested, freeing now");
            self.finish_close();
            ReleaseOutcome::Freed
        } else {
            debug!(handle = self.id, borrows, "release requested, deferring free");
            ReleaseOutcome::Deferred { borrows }
        }
    }

    /// Closing -> Closed. Returns whether this call won the transition.
    fn finish_close(&self) -> bool {
        if self
            .word
            .compare_exchange(CLOSING, CLOSING | CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: winning the CAS above happens exactly once per handle, with zero borrows and
        // no way to grant new ones, so nothing else can observe the buffer from here on.
        let buffer = unsafe { ManuallyDrop::take(&mut *self.buffer.get()) };
        self.coordinator.dispose(self.id, buffer);
        true
    }

    pub(crate) fn claim_cursor(&self) -> bool {
        !self.cursor_taken.swap(true, Ordering::AcqRel)
    }
}

impl<B: Backend> Drop for ResourceHandle<B> {
    fn drop(&mut self) {
        // Reclamation goes through the same protocol as an explicit close. With `&mut self` no
        // guard can exist, so this either frees now or observes an earlier close.
        if self.request_release() != ReleaseOutcome::AlreadyRequested {
            trace!(handle = self.id, "reclaimed on drop");
        }
    }
}

impl<B: Backend> fmt::Debug for ResourceHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active_borrows", &self.active_borrows())
            .field("columns", &self.columns)
            .finish()
    }
}

/// Proof that a read is in flight. The buffer cannot be freed while one exists.
///
/// Dropping the guard (including during unwinding) releases the borrow exactly once.
#[must_use = "the borrow is released as soon as the guard is dropped"]
pub struct BorrowGuard<'h, B: Backend> {
    handle: &'h ResourceHandle<B>,
}

impl<'h, B: Backend> BorrowGuard<'h, B> {
    /// The native buffer. Only reachable through a live guard.
    pub fn buffer(&self) -> &B::Buffer {
        // SAFETY: the guard holds a borrow, so the handle cannot reach CLOSED and the buffer is
        // still in place.
        unsafe { &*self.handle.buffer.get() }
    }

    pub fn backend(&self) -> &B {
        self.handle.coordinator.backend()
    }

    pub fn handle(&self) -> &'h ResourceHandle<B> {
        self.handle
    }
}

impl<B: Backend> Drop for BorrowGuard<'_, B> {
    fn drop(&mut self) {
        self.handle.release_borrow();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, Table};
    use crate::reclaim::ReclaimMode;
    use crate::Value;

    fn handle() -> (Arc<ReclaimCoordinator<MemoryBackend>>, Arc<ResourceHandle<MemoryBackend>>) {
        let backend = MemoryBackend::new();
        backend.register("q", Table::new(["a"]).with_row([Value::Integer(1)]));
        let coordinator = ReclaimCoordinator::new(backend, ReclaimMode::Inline);
        let exec = coordinator.backend().execute("q").unwrap();
        let h = ResourceHandle::new(exec, coordinator.clone());
        (coordinator, h)
    }

    #[test]
    fn release_without_borrows_frees_immediately() {
        let (c, h) = handle();
        assert_eq!(h.state(), HandleState::Open);
        assert_eq!(h.request_release(), ReleaseOutcome::Freed);
        assert_eq!(h.state(), HandleState::Closed);
        assert_eq!(c.backend().stats().disposals, 1);
    }

    #[test]
    fn release_while_borrowed_waits_for_guard() {
        let (c, h) = handle();
        let guard = h.acquire().unwrap();
        assert_eq!(h.request_release(), ReleaseOutcome::Deferred { borrows: 1 });
        assert_eq!(h.state(), HandleState::Closing);
        assert_eq!(c.backend().stats().disposals, 0);
        assert!(matches!(h.acquire(), Err(Error::Closing)));

        drop(guard);
        assert_eq!(h.state(), HandleState::Closed);
        assert_eq!(c.backend().stats().disposals, 1);
        assert!(matches!(h.acquire(), Err(Error::Released)));
    }

    #[test]
    fn second_release_is_a_no_op() {
        let (c, h) = handle();
        h.request_release();
        assert_eq!(h.request_release(), ReleaseOutcome::AlreadyRequested);
        drop(h);
        assert_eq!(c.backend().stats().disposals, 1);
        assert_eq!(c.backend().stats().violations, 0);
    }

    #[test]
    fn drop_reclaims_open_handle() {
        let (c, h) = handle();
        drop(h);
        assert_eq!(c.backend().stats().disposals, 1);
    }

    #[test]
    fn guard_released_on_unwind() {
        let (c, h) = handle();
        let h2 = h.clone();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _g = h2.acquire().unwrap();
            panic!("reader blew up");
        }));
        assert!(res.is_err());
        assert_eq!(h.active_borrows(), 0);
        assert_eq!(h.request_release(), ReleaseOutcome::Freed);
        assert_eq!(c.backend().stats().disposals, 1);
    }

    #[test]
    fn nested_borrows_count_up_and_down() {
        let (_c, h) = handle();
        let g1 = h.acquire().unwrap();
        let g2 = h.acquire().unwrap();
        assert_eq!(h.active_borrows(), 2);
        drop(g1);
        assert_eq!(h.request_release(), ReleaseOutcome::Deferred { borrows: 1 });
        assert_eq!(g2.handle().state(), HandleState::Closing);
        drop(g2);
        assert_eq!(h.state(), HandleState::Closed);
    }
}
