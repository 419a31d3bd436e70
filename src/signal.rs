//! Coalescing wake-up signals for the worker tasks
//!
//! A worker sleeps on its [`Signal`] until another task raises one or more
//! reasons. Reasons raised while the worker is busy accumulate in a set and are
//! handed over together on the next [`Signal::wait`], so nothing is lost between
//! "read the reason" and "go back to sleep".

use std::fmt;
use std::marker::PhantomData;
use std::sync::Mutex;
use tokio::sync::Notify;

/// A wake-up reason that fits in a small bit set.
pub trait Reason: Copy + fmt::Debug + Send + 'static {
    /// Every variant, in reporting order.
    const ALL: &'static [Self];

    /// Distinct bit index below 32.
    fn index(self) -> u8;
}

/// Set of accumulated reasons.
pub struct Reasons<R> {
    bits: u32,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Reason> Reasons<R> {
    pub fn empty() -> Self {
        Self { bits: 0, _marker: PhantomData }
    }

    pub fn of(reason: R) -> Self {
        let mut set = Self::empty();
        set.insert(reason);
        set
    }

    pub fn insert(&mut self, reason: R) {
        self.bits |= 1 << reason.index();
    }

    pub fn contains(&self, reason: R) -> bool {
        self.bits & (1 << reason.index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn merge(&mut self, other: Reasons<R>) {
        self.bits |= other.bits;
    }

    pub fn iter(&self) -> impl Iterator<Item = R> + '_ {
        R::ALL.iter().copied().filter(|r| self.contains(*r))
    }
}

impl<R> Clone for Reasons<R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for Reasons<R> {}

impl<R: Reason> PartialEq for Reasons<R> {
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<R: Reason> fmt::Debug for Reasons<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Single-consumer, multi-producer wake-up signal.
pub struct Signal<R> {
    pending: Mutex<u32>,
    notify: Notify,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Reason> Signal<R> {
    pub fn new() -> Self {
        Self { pending: Mutex::new(0), notify: Notify::new(), _marker: PhantomData }
    }

    /// Raise `reason` and wake the consumer.
    pub fn signal(&self, reason: R) {
        {
            let mut bits = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            *bits |= 1 << reason.index();
        }
        self.notify.notify_one();
    }

    /// Take every pending reason without waiting.
    pub fn try_take(&self) -> Option<Reasons<R>> {
        let mut bits = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if *bits == 0 {
            return None;
        }
        let taken = std::mem::take(&mut *bits);
        Some(Reasons { bits: taken, _marker: PhantomData })
    }

    /// Wait until at least one reason is pending and take all of them.
    pub async fn wait(&self) -> Reasons<R> {
        loop {
            if let Some(reasons) = self.try_take() {
                return reasons;
            }
            // A notify_one without a waiter leaves a permit, so a signal raised
            // between try_take and here still completes this await.
            self.notify.notified().await;
        }
    }
}

impl<R: Reason> Default for Signal<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Reason> fmt::Debug for Signal<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = *self.pending.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Signal")
            .field("pending", &Reasons::<R> { bits, _marker: PhantomData })
            .finish()
    }
}
