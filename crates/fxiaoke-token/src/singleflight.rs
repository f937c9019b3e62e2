//! Per-key request coalescing
//!
//! Concurrent `run` calls for the same key share one execution: the first
//! caller's closure runs, everyone else waits on the same cell and receives a
//! clone of its output. If the running caller is dropped before finishing,
//! one of the waiters runs its own closure instead.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

pub struct SingleFlight<T> {
    flights: Mutex<HashMap<String, Arc<OnceCell<T>>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` for `key`, or join the execution already in flight.
    ///
    /// The caller whose closure ran unregisters the cell before the result is
    /// published, so a caller arriving after completion always starts a
    /// fresh flight instead of reading a finished one.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let registered = &cell;
        let value = cell
            .get_or_init(move || async move {
                let value = f().await;
                self.unregister(key, registered).await;
                value
            })
            .await
            .clone();
        value
    }

    async fn unregister(&self, key: &str, cell: &Arc<OnceCell<T>>) {
        let mut flights = self.flights.lock().await;
        if flights
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, cell))
        {
            flights.remove(key);
        }
    }

    /// Keys with a flight registered (running or abandoned).
    pub async fn in_flight(&self) -> usize {
        self.flights.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let flights = Arc::new(SingleFlight::<u32>::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let flights = flights.clone();
            let runs = runs.clone();
            tasks.spawn(async move {
                flights
                    .run("FSAID_1", || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        42
                    })
                    .await
            });
        }

        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight().await, 0);
    }

    #[tokio::test]
    async fn completed_flight_is_not_reused() {
        let flights = SingleFlight::<u32>::new();
        assert_eq!(flights.run("k", || async { 1 }).await, 1);
        assert_eq!(flights.run("k", || async { 2 }).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_sees_no_entry_once_result_is_visible() {
        let flights = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let flights = flights.clone();
            tokio::spawn(async move {
                let first = flights.run("k", || async { 99 }).await;
                let registered = flights.in_flight().await;
                let second = flights.run("k", || async { 2 }).await;
                (first, registered, second)
            })
        };

        assert_eq!(leader.await.unwrap(), 1);
        assert_eq!(follower.await.unwrap(), (1, 0, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_independently() {
        let flights = Arc::new(SingleFlight::<&'static str>::new());
        let a = flights.run("a", || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            "a"
        });
        let b = flights.run("b", || async { "b" });
        let (a, b) = tokio::join!(a, b);
        assert_eq!((a, b), ("a", "b"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_leader_hands_over_to_waiter() {
        let flights = Arc::new(SingleFlight::<&'static str>::new());

        let leader = {
            let flights = flights.clone();
            tokio::spawn(async move {
                flights
                    .run("k", || async {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                        "leader"
                    })
                    .await
            })
        };
        // Let the leader register and start its closure
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let flights = flights.clone();
            tokio::spawn(async move { flights.run("k", || async { "follower" }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert_eq!(follower.await.unwrap(), "follower");
    }
}
