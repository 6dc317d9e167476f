//! Deduplication of concurrent identical lookups.
//!
//! When many callers ask for the same key at once (every client of a
//! popular room re-checking the same membership entry), only the first
//! performs the lookup; the rest wait on its in-flight result. Sequential
//! calls are unaffected: the flight entry is removed before the result is
//! broadcast.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;

enum Role<T> {
    Leader(watch::Sender<Option<T>>),
    Follower(watch::Receiver<Option<T>>),
}

/// Keyed in-flight map: at most one running lookup per key, result shared
/// with every concurrent caller.
pub struct Singleflight<T> {
    flights: Mutex<HashMap<String, watch::Receiver<Option<T>>>>,
}

impl<T: Clone> Singleflight<T> {
    pub fn new() -> Self {
        Singleflight {
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` for `key`, or join an identical call already in flight
    /// and share its result. `work` is polled only by the caller that
    /// leads the flight.
    pub async fn run<F>(&self, key: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let role = {
            let mut flights = self.flights.lock().expect("flight map poisoned");
            match flights.get(key) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key.to_owned(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let value = work.await;
                self.flights
                    .lock()
                    .expect("flight map poisoned")
                    .remove(key);
                let _ = tx.send(Some(value.clone()));
                value
            }
            Role::Follower(mut rx) => {
                let existing_value = {
                    match rx.wait_for(Option::is_some).await {
                        Ok(value) => Some(value.as_ref().expect("set before broadcast").clone()),
                        Err(_) => None,
                    }
                };
                match existing_value {
                    Some(value) => value,
                    None => {
                        // The leader was cancelled mid-flight. Clear its
                        // stale entry (unless a new flight took the key)
                        // and do the work ourselves.
                        {
                            let mut flights =
                                self.flights.lock().expect("flight map poisoned");
                            if let Some(existing) = flights.get(key) {
                                if existing.has_changed().is_err() {
                                    flights.remove(key);
                                }
                            }
                        }
                        work.await
                    }
                }
            }
        }
    }
}

impl<T: Clone> Default for Singleflight<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_for_one_key_share_a_single_lookup() {
        let flight = Arc::new(Singleflight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let flight = flight.clone();
            let calls = calls.clone();
            let mut release = release_rx.clone();
            tasks.push(tokio::spawn(async move {
                flight
                    .run("membership:server:42:1001", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release.wait_for(|go| *go).await;
                        7u64
                    })
                    .await
            }));
        }

        // Let every task register against the flight, then release the leader.
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(true).expect("waiters alive");

        for task in tasks {
            assert_eq!(task.await.expect("task"), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1, "one lookup served all ten callers");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_share_flights() {
        let flight = Arc::new(Singleflight::<u64>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let a = {
            let flight = flight.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flight
                    .run("user:info:1", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        1u64
                    })
                    .await
            })
        };
        let b = {
            let flight = flight.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                flight
                    .run("user:info:2", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        2u64
                    })
                    .await
            })
        };

        assert_eq!(a.await.expect("task"), 1);
        assert_eq!(b.await.expect("task"), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sequential_calls_each_run_their_own_lookup() {
        let flight = Singleflight::<u64>::new();
        let calls = AtomicUsize::new(0);

        for expected in 1..=3 {
            let value = flight
                .run("user:info:1", async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    9u64
                })
                .await;
            assert_eq!(value, 9);
            assert_eq!(calls.load(Ordering::SeqCst), expected);
        }
    }
}
