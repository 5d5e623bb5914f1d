//! At-most-once task execution with single-flight coalescing.
//!
//! Any number of dependents may request the same task concurrently; exactly
//! one runs it, the rest wait on the same result.  Results are remembered
//! for the rest of the run, errors included.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::graph::TaskId;

type StoredResult = Result<(), Arc<anyhow::Error>>;

#[derive(Default)]
pub struct TaskMemo {
    done: Mutex<HashMap<TaskId, StoredResult>>,
    flights: Mutex<HashMap<TaskId, Arc<Mutex<()>>>>,
}

fn share(result: StoredResult) -> anyhow::Result<()> {
    // The stored error is shared between waiters; hand each caller a copy
    // carrying the full context chain as its message.
    result.map_err(|err| anyhow::anyhow!("{:#}", err))
}

impl TaskMemo {
    pub fn new() -> TaskMemo {
        TaskMemo::default()
    }

    fn try_get(&self, task_id: &str) -> Option<StoredResult> {
        self.done.lock().unwrap().get(task_id).cloned()
    }

    /// Runs `f` for `task_id` unless a result already exists or another
    /// caller is mid-flight, in which case the existing/incoming result is
    /// returned instead.
    pub fn run<F>(&self, task_id: &TaskId, f: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        if let Some(result) = self.try_get(task_id) {
            return share(result);
        }

        let flight = {
            let mut flights = self.flights.lock().unwrap();
            flights.entry(task_id.clone()).or_default().clone()
        };

        // Whoever holds the flight lock executes; everyone else blocks here
        // and finds the published result on the recheck.
        let _slot = flight.lock().unwrap();
        if let Some(result) = self.try_get(task_id) {
            return share(result);
        }

        let result: StoredResult = f().map_err(Arc::new);
        self.done
            .lock()
            .unwrap()
            .insert(task_id.clone(), result.clone());
        share(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_once_under_contention() {
        let memo = TaskMemo::new();
        let calls = AtomicUsize::new(0);
        let id = "t".to_string();

        std::thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    memo.run(&id, || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Widen the race window.
                        std::thread::sleep(std::time::Duration::from_millis(10));
                        Ok(())
                    })
                    .unwrap();
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_is_shared_with_all_callers() {
        let memo = TaskMemo::new();
        let calls = AtomicUsize::new(0);
        let id = "t".to_string();

        let run = || {
            memo.run(&id, || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("boom").context("run task t"))
            })
        };
        let first = run().unwrap_err();
        let second = run().unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(first.to_string().contains("boom"));
        assert_eq!(second.to_string(), "run task t: boom");
    }

    #[test]
    fn distinct_ids_run_independently() {
        let memo = TaskMemo::new();
        let calls = AtomicUsize::new(0);
        for id in ["a", "b", "c"] {
            memo.run(&id.to_string(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
