//! Single-flight guard: one logical execution serves all concurrent callers.
//!
//! Wraps a one-shot asynchronous operation so that callers arriving while an
//! execution is in flight receive the same settled result instead of running
//! the operation again. The guard is an explicit state machine:
//!
//! ```text
//! reentrant:     Idle ──run──► InFlight ──settle──► Idle
//! memoize-once:  Idle ──run──► InFlight ──settle──► Settled(value)
//! ```
//!
//! A reentrant guard resets after settlement whether the execution succeeded
//! or failed; the next call made after settlement triggers a fresh
//! execution. A memoize-once guard stores the first settled result and
//! returns it to every future caller without running the operation again.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

/// Guard state. `InFlight` holds the receiver side of the channel the
/// current leader publishes its result on.
enum FlightState<R> {
    Idle,
    InFlight(watch::Receiver<Option<R>>),
    Settled(R),
}

/// Role a caller is assigned while the state lock is held.
enum Role<R> {
    Leader(watch::Sender<Option<R>>),
    Follower(watch::Receiver<Option<R>>),
    Done(R),
}

/// Coalesces concurrent invocations of a one-shot operation.
///
/// The result type must be `Clone` so one settled value can be handed to
/// every coalesced caller; for fallible operations use a `Result` whose
/// error type is `Clone`.
pub struct SingleFlight<R> {
    reentrant: bool,
    state: Mutex<FlightState<R>>,
}

impl<R: Clone> SingleFlight<R> {
    /// Create a guard that resets after each settlement.
    pub fn reentrant() -> Self {
        Self::new(true)
    }

    /// Create a guard that permanently memoizes the first settled result.
    pub fn memoize_once() -> Self {
        Self::new(false)
    }

    fn new(reentrant: bool) -> Self {
        Self {
            reentrant,
            state: Mutex::new(FlightState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FlightState<R>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `op` under the guard.
    ///
    /// Exactly one of the callers present while the state is `Idle` becomes
    /// the leader and executes `op`; everyone else awaits the leader's
    /// result. A call made from within the guarded operation itself observes
    /// the in-flight execution and receives a future for its result without
    /// re-invoking the operation.
    pub async fn run<F>(&self, op: F) -> R
    where
        F: Future<Output = R>,
    {
        let mut op = Some(op);
        loop {
            let role = {
                let mut state = self.lock();
                match &mut *state {
                    FlightState::Settled(result) => Role::Done(result.clone()),
                    FlightState::InFlight(rx) => Role::Follower(rx.clone()),
                    idle @ FlightState::Idle => {
                        let (tx, rx) = watch::channel(None);
                        *idle = FlightState::InFlight(rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Done(result) => return result,
                Role::Leader(tx) => {
                    // `op` is present: it is only consumed on this branch,
                    // and a caller is leader at most once per loop entry.
                    let Some(op) = op.take() else { unreachable!() };
                    let result = op.await;

                    // Publish the new state before waking followers so a
                    // follower that immediately re-calls observes it.
                    {
                        let mut state = self.lock();
                        *state = if self.reentrant {
                            FlightState::Idle
                        } else {
                            FlightState::Settled(result.clone())
                        };
                    }
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut rx) => {
                    loop {
                        {
                            let value = rx.borrow_and_update();
                            if let Some(result) = value.as_ref() {
                                return result.clone();
                            }
                        }
                        if rx.changed().await.is_err() {
                            // The leader vanished without settling (its
                            // future was dropped). Reset the stale state and
                            // contend for leadership again.
                            let mut state = self.lock();
                            let stale_leader = matches!(
                                &*state,
                                FlightState::InFlight(stale) if stale.has_changed().is_err()
                            );
                            if stale_leader {
                                *state = FlightState::Idle;
                            }
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let guard = Arc::new(SingleFlight::reentrant());
        let counter = Arc::new(AtomicU32::new(0));

        let op = |counter: Arc<AtomicU32>| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            counter.fetch_add(1, Ordering::SeqCst) + 1
        };

        let (a, b) = tokio::join!(
            guard.run(op(counter.clone())),
            guard.run(op(counter.clone()))
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_reentrant_resets_after_settlement() {
        let guard = SingleFlight::reentrant();
        let counter = AtomicU32::new(0);

        let first = guard.run(async { counter.fetch_add(1, Ordering::SeqCst) + 1 }).await;
        let second = guard.run(async { counter.fetch_add(1, Ordering::SeqCst) + 1 }).await;

        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memoize_once_returns_first_result() {
        let guard = SingleFlight::memoize_once();
        let counter = AtomicU32::new(0);

        let first = guard.run(async { counter.fetch_add(1, Ordering::SeqCst) + 1 }).await;
        let second = guard.run(async { counter.fetch_add(1, Ordering::SeqCst) + 1 }).await;

        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_shared_and_reentrant_retries() {
        let guard = Arc::new(SingleFlight::<Result<u32, String>>::reentrant());
        let attempts = Arc::new(AtomicU32::new(0));

        let failing = |attempts: Arc<AtomicU32>| async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<u32, _>("boom".to_string())
        };

        let (a, b) = tokio::join!(
            guard.run(failing(attempts.clone())),
            guard.run(failing(attempts.clone()))
        );
        assert_eq!(a, Err("boom".to_string()));
        assert_eq!(b, Err("boom".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Failure also resets a reentrant guard.
        let ok = guard.run(async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));
    }

    #[tokio::test]
    async fn test_memoize_once_keeps_failure() {
        let guard = SingleFlight::<Result<u32, String>>::memoize_once();

        let first = guard.run(async { Err::<u32, _>("boom".to_string()) }).await;
        let second = guard.run(async { Ok(1) }).await;

        assert_eq!(first, Err("boom".to_string()));
        assert_eq!(second, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_follower_recovers_from_dropped_leader() {
        let guard = Arc::new(SingleFlight::reentrant());

        // Leader that never completes; dropped via abort.
        let stuck = {
            let guard = guard.clone();
            tokio::spawn(async move {
                guard
                    .run(async {
                        std::future::pending::<()>().await;
                        0u32
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        stuck.abort();
        let _ = stuck.await;

        // A later caller must still be able to execute.
        let value = guard.run(async { 42u32 }).await;
        assert_eq!(value, 42);
    }
}
