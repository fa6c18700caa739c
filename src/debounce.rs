//! Leading-edge debouncer with a forced-run ceiling
//!
//! The first trigger after an idle period runs the action immediately. Further
//! triggers keep pushing a quiet-period timer back; when it finally fires the
//! action runs once more. While triggers keep arriving, a ceiling timer forces
//! a run at least every `ceiling` so the result never gets too stale.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Action run by the debouncer
pub type Action = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// A pending timer. The id lets a timer that already woke up tell whether it
/// was superseded while waiting for the lock.
struct Timer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    quiet: Option<Timer>,
    ceiling: Option<Timer>,
    next_id: u64,
}

impl Timers {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

struct Inner {
    quiet: Duration,
    ceiling: Duration,
    called: AtomicBool,
    timers: Mutex<Timers>,
}

/// Rate-limits repeated triggers of an async action
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<Inner>,
}

impl Debouncer {
    /// `quiet` of zero disables debouncing, `ceiling` of zero disables forced runs
    pub fn new(quiet: Duration, ceiling: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                quiet,
                ceiling,
                called: AtomicBool::new(false),
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    /// Run `action` now if nothing ran recently, and schedule the trailing runs.
    ///
    /// Returns once the leading-edge run (if any) has completed; timer runs
    /// happen on background tasks.
    pub async fn trigger(&self, action: Action) {
        if self.inner.quiet.is_zero() {
            action().await;
            return;
        }

        if self
            .inner
            .called
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            action().await;
        }

        let mut timers = self.inner.timers.lock();

        // Only a timer that is still sleeping is stored here, so aborting it
        // never interrupts a running action.
        if let Some(previous) = timers.quiet.take() {
            previous.handle.abort();
        }
        let id = timers.next_id();
        let handle = tokio::spawn(Self::fire_quiet(
            Arc::clone(&self.inner),
            id,
            Arc::clone(&action),
        ));
        timers.quiet = Some(Timer { id, handle });

        if timers.ceiling.is_some() || self.inner.ceiling.is_zero() {
            return;
        }
        let id = timers.next_id();
        let handle = tokio::spawn(Self::fire_ceiling(Arc::clone(&self.inner), id, action));
        timers.ceiling = Some(Timer { id, handle });
    }

    async fn fire_quiet(inner: Arc<Inner>, id: u64, action: Action) {
        tokio::time::sleep(inner.quiet).await;
        {
            let mut timers = inner.timers.lock();
            if timers.quiet.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            timers.quiet = None;
        }

        debug!("debounce: quiet period elapsed");
        action().await;
        inner.called.store(false, Ordering::SeqCst);

        if let Some(ceiling) = inner.timers.lock().ceiling.take() {
            ceiling.handle.abort();
        }
    }

    async fn fire_ceiling(inner: Arc<Inner>, id: u64, action: Action) {
        tokio::time::sleep(inner.ceiling).await;
        {
            let mut timers = inner.timers.lock();
            if timers.ceiling.as_ref().map(|t| t.id) != Some(id) {
                return;
            }
            timers.ceiling = None;
        }

        debug!("debounce: ceiling reached, forcing run");
        action().await;
    }

    /// Cancel pending timers without running them
    pub fn cancel(&self) {
        let mut timers = self.inner.timers.lock();
        if let Some(timer) = timers.quiet.take() {
            timer.handle.abort();
        }
        if let Some(timer) = timers.ceiling.take() {
            timer.handle.abort();
        }
        self.inner.called.store(false, Ordering::SeqCst);
    }
}
