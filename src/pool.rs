//! Bounded worker pool for independent units of work.
//!
//! Scoped std threads pull indices from a shared atomic cursor; results land
//! in per-slot cells and are merged in input order only after every worker
//! has joined, so callers never observe a partial result set.

use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

/// Applies `op` to every item using at most `workers` threads, preserving
/// input order in the returned vector.
pub fn map_parallel<T, R, F>(items: Vec<T>, workers: usize, op: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(usize, T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = workers.max(1).min(items.len());
    if workers == 1 {
        return items
            .into_iter()
            .enumerate()
            .map(|(idx, item)| op(idx, item))
            .collect();
    }

    let work: Vec<Mutex<Option<T>>> = items.into_iter().map(|item| Mutex::new(Some(item))).collect();
    let slots: Vec<Mutex<Option<R>>> = (0..work.len()).map(|_| Mutex::new(None)).collect();
    let cursor = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let idx = cursor.fetch_add(1, Ordering::SeqCst);
                    if idx >= work.len() {
                        break;
                    }
                    let item = work[idx]
                        .lock()
                        .expect("work slot lock")
                        .take()
                        .expect("each work item is claimed once");
                    let result = op(idx, item);
                    *slots[idx].lock().expect("result slot lock") = Some(result);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .expect("result slot lock")
                .expect("every slot is filled before the scope ends")
        })
        .collect()
}
