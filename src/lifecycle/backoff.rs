//! Restart scheduling for the session supervisor.
//!
//! Delay grows linearly with the process-lifetime attempt count and then
//! stays flat: `base + min(cap, attempts * step)`. At most one restart timer
//! is armed at a time.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub step: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn delay_for(&self, attempts: u64) -> Duration {
        let extra = self
            .step
            .checked_mul(u32::try_from(attempts).unwrap_or(u32::MAX))
            .unwrap_or(self.cap)
            .min(self.cap);
        self.base.saturating_add(extra)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5_000),
            step: Duration::from_millis(5_000),
            cap: Duration::from_millis(60_000),
        }
    }
}

/// Arms a single pending restart timer.
#[derive(Debug)]
pub struct BackoffScheduler {
    policy: BackoffPolicy,
    pending: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl BackoffScheduler {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            pending: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Arm the restart timer for `attempts` attempts made so far.
    ///
    /// Returns the chosen delay, or `None` if a timer was already pending.
    /// When the timer fires the pending flag is cleared before `restart`
    /// runs, so `restart` may schedule again.
    pub fn schedule<F, Fut>(&self, attempts: u64, restart: F) -> Option<Duration>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self
            .pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Restart already scheduled; ignoring");
            return None;
        }

        let delay = self.policy.delay_for(attempts);
        let pending = Arc::clone(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::SeqCst);
            restart().await;
        });
        *self.timer.lock() = Some(handle);
        Some(delay)
    }

    /// Disarm a pending timer. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let handle = self.timer.lock().take();
        let was_pending = self.pending.swap(false, Ordering::SeqCst);
        if was_pending {
            if let Some(handle) = handle {
                handle.abort();
            }
        }
        was_pending
    }
}
