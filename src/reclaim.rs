//! Where freed buffers go.
//!
//! The coordinator is the only place `Backend::dispose` is called from. Handles reach it in two
//! ways, both through [`ResourceHandle::request_release`]: an explicit close, or the drop of the
//! last `Arc` to the handle (the Rust analogue of a finalizer). It never frees a buffer on its own
//! initiative; it only disposes buffers whose handle already won the `Closed` transition.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    thread::JoinHandle,
};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::{backend::Backend, handle::ResourceHandle, ReleaseOutcome};

/// Who runs `Backend::dispose` once a handle has closed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ReclaimMode {
    /// The thread that closes the handle disposes the buffer immediately.
    #[default]
    Inline,
    /// Closed buffers are queued until [`ReclaimCoordinator::collect`] runs.
    Deferred,
    /// Closed buffers are queued and disposed by a dedicated reaper thread.
    Background,
}

/// Point-in-time counters of a [`ReclaimCoordinator`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ReclaimStats {
    /// Handles whose release has been requested.
    pub released: u64,
    /// Buffers handed to `Backend::dispose`.
    pub disposed: u64,
    /// Buffers closed but not yet disposed.
    pub pending: usize,
    /// Handles still alive.
    pub live: usize,
}

struct QueueState<Buf> {
    pending: VecDeque<(u64, Buf)>,
    stopping: bool,
}

/// Shared between the coordinator and its reaper thread.
struct DisposalQueue<B: Backend> {
    backend: Arc<B>,
    state: Mutex<QueueState<B::Buffer>>,
    wake: Condvar,
    disposed: AtomicU64,
}

impl<B: Backend> DisposalQueue<B> {
    fn dispose_now(&self, id: u64, buffer: B::Buffer) {
        self.backend.dispose(buffer);
        self.disposed.fetch_add(1, Ordering::Relaxed);
        debug!(handle = id, "disposed native buffer");
    }

    /// Dispose everything queued, without holding the lock across `dispose`.
    fn drain(&self) -> usize {
        let batch = std::mem::take(&mut self.state.lock().pending);
        let n = batch.len();
        for (id, buffer) in batch {
            self.dispose_now(id, buffer);
        }
        n
    }

    fn reap(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            while let Some((id, buffer)) = state.pending.pop_front() {
                MutexGuard::unlocked(&mut state, || self.dispose_now(id, buffer));
            }
            if state.stopping {
                break;
            }
            self.wake.wait(&mut state);
        }
        trace!("reaper stopped");
    }
}

/// Bridges handle release to buffer disposal for one connection.
pub struct ReclaimCoordinator<B: Backend> {
    mode: ReclaimMode,
    queue: Arc<DisposalQueue<B>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    live: Mutex<Vec<Weak<ResourceHandle<B>>>>,
    next_id: AtomicU64,
    released: AtomicU64,
}

impl<B: Backend> ReclaimCoordinator<B> {
    pub fn new(backend: B, mode: ReclaimMode) -> Arc<Self> {
        let queue = Arc::new(DisposalQueue {
            backend: Arc::new(backend),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                stopping: false,
            }),
            wake: Condvar::new(),
            disposed: AtomicU64::new(0),
        });

        let reaper = match mode {
            ReclaimMode::Background => {
                let q = queue.clone();
                match std::thread::Builder::new()
                    .name("lbug-reclaim".into())
                    .spawn(move || q.reap())
                {
                    Ok(h) => Some(h),
                    Err(e) => {
                        warn!(error = %e, "failed to spawn reaper thread; buffers wait for collect()");
                        None
                    }
                }
            }
            ReclaimMode::Inline | ReclaimMode::Deferred => None,
        };

        Arc::new(Self {
            mode,
            queue,
            reaper: Mutex::new(reaper),
            live: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            released: AtomicU64::new(0),
        })
    }

    pub fn backend(&self) -> &B {
        &self.queue.backend
    }

    pub fn mode(&self) -> ReclaimMode {
        self.mode
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track(&self, handle: &Arc<ResourceHandle<B>>) {
        let mut live = self.live.lock();
        if live.len() >= 64 && live.len().is_power_of_two() {
            live.retain(|w| w.strong_count() > 0);
        }
        live.push(Arc::downgrade(handle));
    }

    pub(crate) fn note_release(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    /// Take ownership of a buffer whose handle just reached `Closed`.
    pub(crate) fn dispose(&self, id: u64, buffer: B::Buffer) {
        match self.mode {
            ReclaimMode::Inline => self.queue.dispose_now(id, buffer),
            ReclaimMode::Deferred | ReclaimMode::Background => {
                self.queue.state.lock().pending.push_back((id, buffer));
                self.queue.wake.notify_one();
                trace!(handle = id, "queued native buffer for disposal");
            }
        }
    }

    /// Run a reclamation pass on the calling thread. Returns how many buffers were disposed.
    pub fn collect(&self) -> usize {
        self.queue.drain()
    }

    /// Request release of every handle still alive on this connection.
    ///
    /// Handles with reads in flight close once those reads finish. Returns how many handles this
    /// call closed or scheduled for closing.
    pub fn release_all(&self) -> usize {
        let handles: Vec<_> = {
            let mut live = self.live.lock();
            live.retain(|w| w.strong_count() > 0);
            live.iter().filter_map(Weak::upgrade).collect()
        };
        let mut n = 0;
        for h in handles {
            match h.request_release() {
                ReleaseOutcome::Freed => n += 1,
                ReleaseOutcome::Deferred { borrows } => {
                    warn!(handle = h.id(), borrows, "closing result with reads in flight");
                    n += 1;
                }
                ReleaseOutcome::AlreadyRequested => {}
            }
        }
        n
    }

    pub fn stats(&self) -> ReclaimStats {
        ReclaimStats {
            released: self.released.load(Ordering::Relaxed),
            disposed: self.queue.disposed.load(Ordering::Relaxed),
            pending: self.queue.state.lock().pending.len(),
            live: self.live.lock().iter().filter(|w| w.strong_count() > 0).count(),
        }
    }
}

impl<B: Backend> Drop for ReclaimCoordinator<B> {
    fn drop(&mut self) {
        // Every handle holds an `Arc` to us, so none are left. Stop the reaper, then dispose
        // whatever is still queued before the backend goes away.
        self.queue.state.lock().stopping = true;
        self.queue.wake.notify_all();
        if let Some(h) = self.reaper.get_mut().take() {
            if h.join().is_err() {
                warn!("reaper thread panicked");
            }
        }
        let n = self.queue.drain();
        if n > 0 {
            debug!(count = n, "disposed queued buffers at shutdown");
        }
    }
}

impl<B: Backend> fmt::Debug for ReclaimCoordinator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimCoordinator")
            .field("mode", &self.mode)
            .field("stats", &self.stats())
            .finish()
    }
}
