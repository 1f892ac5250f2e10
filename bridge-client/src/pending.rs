//! Pending calls: the correlation table plus one deadline task and one oneshot waiter per id.
//!
//! Thread-safety: the table sits behind a `std::sync::Mutex`. Registration, delivery,
//! deadline expiry and the disconnect flush all remove entries under that lock, so whichever
//! path takes an entry first is the only one that completes its waiter. The lock is never held
//! across an await.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bridge_core::{CorrelationId, CorrelationTable, OperationType, ResultVariant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::error::ClientError;

/// What a waiting caller receives.
pub type CallOutcome = Result<ResultVariant, ClientError>;

struct PendingCall {
    operation: OperationType,
    waiter: oneshot::Sender<CallOutcome>,
    deadline: AbortHandle,
}

struct Table {
    calls: CorrelationTable<PendingCall>,
    /// Set by the disconnect flush; later registrations are refused.
    closed: bool,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counts deadline tasks that have not been dropped yet (fired or aborted).
struct TimerGuard(Arc<AtomicUsize>);

impl TimerGuard {
    fn arm(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        TimerGuard(Arc::clone(counter))
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PendingCalls {
    table: Arc<Mutex<Table>>,
    live_timers: Arc<AtomicUsize>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                calls: CorrelationTable::new(),
                closed: false,
            })),
            live_timers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register `id` and arm its deadline. Must run inside a tokio runtime.
    pub fn register(
        &self,
        id: CorrelationId,
        operation: OperationType,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<CallOutcome>, ClientError> {
        let mut table = lock(&self.table);
        if table.closed {
            return Err(ClientError::NotConnected);
        }
        if table.calls.contains(id.as_str()) {
            return Err(bridge_core::RegisterError::DuplicateId(id).into());
        }
        let (tx, rx) = oneshot::channel();

        // Spawned while the lock is held: the deadline task cannot look the id up before the
        // entry exists.
        let guard = TimerGuard::arm(&self.live_timers);
        let timer_table = Arc::clone(&self.table);
        let timer_id = id.clone();
        let deadline = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(timeout).await;
            let expired = lock(&timer_table).calls.take(timer_id.as_str());
            if let Some(call) = expired {
                tracing::debug!(req = %timer_id, operation = %call.operation, "request deadline elapsed");
                let _ = call.waiter.send(Err(ClientError::Timeout {
                    operation: call.operation,
                    after: timeout,
                }));
            }
        })
        .abort_handle();

        table.calls.register(
            id,
            PendingCall {
                operation,
                waiter: tx,
                deadline,
            },
        )?;
        Ok(rx)
    }

    pub fn is_live(&self, id: &str) -> bool {
        lock(&self.table).calls.contains(id)
    }

    /// Operation a live id was registered for.
    pub fn operation_of(&self, id: &str) -> Option<OperationType> {
        lock(&self.table).calls.get(id).map(|c| c.operation)
    }

    /// Complete `id` with `outcome`. Returns false if the id is unknown or already terminal.
    pub fn resolve(&self, id: &str, outcome: CallOutcome) -> bool {
        let call = lock(&self.table).calls.take(id);
        match call {
            Some(call) => {
                call.deadline.abort();
                let _ = call.waiter.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Remove `id` without completing it (the caller reports its own error).
    /// Returns false if a delivery or the deadline got there first.
    pub fn cancel(&self, id: &str) -> bool {
        let call = lock(&self.table).calls.take(id);
        match call {
            Some(call) => {
                call.deadline.abort();
                true
            }
            None => false,
        }
    }

    /// Fail every live call with `reason`, cancel every deadline, refuse new registrations.
    /// Returns how many calls were failed.
    pub fn close_all(&self, reason: ClientError) -> usize {
        let drained = {
            let mut table = lock(&self.table);
            table.closed = true;
            table.calls.drain()
        };
        let n = drained.len();
        for (_, call) in drained {
            call.deadline.abort();
            let _ = call.waiter.send(Err(reason.clone()));
        }
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.table).calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deadline tasks still alive. Aborted tasks are counted until the runtime drops them.
    pub fn live_timers(&self) -> usize {
        self.live_timers.load(Ordering::SeqCst)
    }
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}
