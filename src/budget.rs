//! In-flight payload byte budget.
//!
//! Admission is soft: while the budget is non-negative any acquisition succeeds
//! immediately, even one that drives it negative. Once negative, new
//! acquisitions queue in FIFO order until releases bring it back to zero or
//! above.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::Error;
use crate::util::lock_unpoisoned;

#[derive(Debug)]
struct Waiter {
    id: u64,
    bytes: u64,
    wake: oneshot::Sender<()>,
}

#[derive(Debug)]
struct BudgetState {
    current_bytes: i64,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

#[derive(Debug)]
pub struct ByteBudget {
    max_bytes: u64,
    state: Mutex<BudgetState>,
}

impl ByteBudget {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(BudgetState {
                current_bytes: to_signed(max_bytes),
                waiters: VecDeque::new(),
                next_waiter_id: 0,
            }),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Signed remaining budget; negative while overdrawn.
    pub fn current_bytes(&self) -> i64 {
        lock_unpoisoned(&self.state).current_bytes
    }

    pub fn available(&self) -> u64 {
        self.current_bytes().max(0) as u64
    }

    pub fn waiting(&self) -> usize {
        lock_unpoisoned(&self.state).waiters.len()
    }

    /// Takes `bytes` from the budget, queueing while it is overdrawn.
    /// With a `timeout`, a queued acquisition gives up with
    /// [`Error::BudgetTimeout`] once it elapses.
    pub async fn acquire(&self, bytes: u64, timeout: Option<Duration>) -> Result<(), Error> {
        let receiver = {
            let mut state = lock_unpoisoned(&self.state);
            if state.current_bytes >= 0 {
                state.current_bytes = state.current_bytes.saturating_sub(to_signed(bytes));
                return Ok(());
            }
            let (wake, receiver) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            state.waiters.push_back(Waiter { id, bytes, wake });
            debug!(
                bytes,
                current_bytes = state.current_bytes,
                queued = state.waiters.len(),
                "byte budget overdrawn; queueing acquisition"
            );
            PendingAcquire {
                budget: self,
                id,
                bytes,
                receiver: Some(receiver),
                settled: false,
            }
        };
        receiver.wait(timeout).await
    }

    /// Returns `bytes` to the budget and wakes queued acquisitions in order
    /// while the budget stays non-negative.
    pub fn release(&self, bytes: u64) {
        let mut state = lock_unpoisoned(&self.state);
        state.current_bytes = state
            .current_bytes
            .saturating_add(to_signed(bytes))
            .min(to_signed(self.max_bytes));
        wake_waiters(&mut state);
    }

    /// Acquires and returns a guard that releases on drop.
    pub async fn acquire_permit(
        self: &Arc<Self>,
        bytes: u64,
        timeout: Option<Duration>,
    ) -> Result<BytePermit, Error> {
        self.acquire(bytes, timeout).await?;
        Ok(BytePermit {
            budget: Arc::clone(self),
            bytes,
        })
    }

    /// Runs `work` while holding `bytes`. The bytes come back on every exit
    /// path, including a panic inside `work` or the future being dropped.
    pub async fn with_bytes<T, F, Fut>(
        self: &Arc<Self>,
        bytes: u64,
        timeout: Option<Duration>,
        work: F,
    ) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire_permit(bytes, timeout).await?;
        Ok(work().await)
    }
}

fn wake_waiters(state: &mut BudgetState) {
    while state.current_bytes >= 0 {
        let Some(waiter) = state.waiters.pop_front() else {
            break;
        };
        // Charged on dequeue. A waiter that is going away finds itself gone
        // from the queue and hands the bytes back.
        state.current_bytes = state.current_bytes.saturating_sub(to_signed(waiter.bytes));
        let _ = waiter.wake.send(());
    }
}

fn to_signed(bytes: u64) -> i64 {
    bytes.min(i64::MAX as u64) as i64
}

/// A queued acquisition. Granting happens under the state lock, removes the
/// waiter from the queue and debits its bytes, so "not queued any more" means
/// "granted and charged".
struct PendingAcquire<'a> {
    budget: &'a ByteBudget,
    id: u64,
    bytes: u64,
    receiver: Option<oneshot::Receiver<()>>,
    settled: bool,
}

impl PendingAcquire<'_> {
    async fn wait(mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let woken = match (self.receiver.as_mut(), timeout) {
            (None, _) => true,
            (Some(receiver), Some(limit)) => tokio::time::timeout(limit, receiver).await.is_ok(),
            (Some(receiver), None) => {
                let _ = receiver.await;
                true
            }
        };
        self.settled = true;
        if woken || !self.withdraw() {
            return Ok(());
        }
        Err(Error::BudgetTimeout {
            bytes: self.bytes,
            timeout_ms: timeout.unwrap_or_default().as_millis(),
        })
    }

    /// Removes the waiter if it is still queued; returns whether it was.
    fn withdraw(&self) -> bool {
        let mut state = lock_unpoisoned(&self.budget.state);
        let before = state.waiters.len();
        state.waiters.retain(|waiter| waiter.id != self.id);
        before != state.waiters.len()
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // Dropped mid-wait: either withdraw from the queue or hand back a
        // grant nobody will observe.
        if !self.withdraw() {
            self.budget.release(self.bytes);
        }
    }
}

/// Bytes held against a [`ByteBudget`]; released when dropped.
#[derive(Debug)]
pub struct BytePermit {
    budget: Arc<ByteBudget>,
    bytes: u64,
}

impl BytePermit {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for BytePermit {
    fn drop(&mut self) {
        self.budget.release(self.bytes);
    }
}
