//! Bounded worker pool for per-file work.
//!
//! Scanning and chunking are independent per file. [`map_bounded`] runs a
//! blocking closure over a batch with at most `limit` tasks in flight and
//! hands results back in input order, so the single writer downstream stays
//! deterministic regardless of completion order.

use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

/// Apply `work` to every item on the blocking pool, at most `limit` at a
/// time. `on_done` is called on the collecting task with the number of
/// completed items after each completion.
///
/// Results are returned in the order of `items`. A panicking worker aborts
/// the remaining tasks and surfaces as the `JoinError`.
pub async fn map_bounded<T, R, F, P>(
    items: Vec<T>,
    limit: usize,
    work: F,
    mut on_done: P,
) -> Result<Vec<R>, JoinError>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
    P: FnMut(usize),
{
    let limit = limit.max(1);
    let work = Arc::new(work);
    let total = items.len();
    let mut results: Vec<Option<R>> = Vec::with_capacity(total);
    results.resize_with(total, || None);

    let mut set: JoinSet<(usize, R)> = JoinSet::new();
    let mut pending = items.into_iter().enumerate();
    let mut done = 0usize;

    loop {
        while set.len() < limit {
            let Some((idx, item)) = pending.next() else {
                break;
            };
            let work = Arc::clone(&work);
            set.spawn_blocking(move || (idx, work(item)));
        }

        match set.join_next().await {
            Some(joined) => {
                let (idx, out) = joined?;
                results[idx] = Some(out);
                done += 1;
                on_done(done);
            }
            None => break,
        }
    }

    Ok(results.into_iter().flatten().collect())
}
