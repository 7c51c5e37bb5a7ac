//! Bounded worker pool for shutdown work.
//!
//! Items are queued on a crossbeam channel and consumed by `workers` named
//! scoped threads. Items left over because no thread could be spawned are
//! handled on the calling thread.

use std::thread;

use tracing::{debug, warn};

/// Apply `f` to every item on up to `workers` threads and wait for all of them.
pub fn run_parallel<T, F>(name: &str, workers: usize, items: Vec<T>, f: F)
where
    T: Send,
    F: Fn(T) + Sync,
{
    if items.is_empty() {
        return;
    }
    let workers = workers.clamp(1, items.len());
    debug!(pool = name, workers, items = items.len(), "Starting worker pool");

    let (tx, rx) = crossbeam_channel::unbounded::<T>();
    for item in items {
        if tx.send(item).is_err() {
            break;
        }
    }
    drop(tx);

    thread::scope(|scope| {
        for id in 0..workers {
            let rx = rx.clone();
            let f = &f;
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn_scoped(scope, move || {
                    while let Ok(item) = rx.recv() {
                        f(item);
                    }
                });
            if let Err(e) = spawned {
                warn!(pool = name, worker = id, error = %e, "Failed to spawn worker");
            }
        }
    });

    while let Ok(item) = rx.try_recv() {
        f(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_every_item_processed_once() {
        let sum = AtomicU64::new(0);
        run_parallel("test", 4, (1..=100u64).collect(), |n| {
            sum.fetch_add(n, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn test_more_workers_than_items() {
        let count = AtomicU64::new(0);
        run_parallel("test", 16, vec![(); 3], |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_empty() {
        run_parallel("test", 4, Vec::<u8>::new(), |_| unreachable!());
    }
}
