//! Bounded concurrency runner
//!
//! Runs a batch of items with a concurrency ceiling, collecting every item's
//! outcome without aborting the batch. Completion order is not guaranteed;
//! the caller's worker body is responsible for never letting an error escape
//! (it converts failures into recorded outcomes), so the runner itself is
//! infallible.

use futures::StreamExt;
use futures::stream;

/// Execute `worker(item, index)` for every item with at most `concurrency`
/// invocations in flight at once. Returns only after all items have settled.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, concurrency: usize, worker: F) -> Vec<R>
where
    F: Fn(T, usize) -> Fut,
    Fut: std::future::Future<Output = R>,
{
    stream::iter(
        items
            .into_iter()
            .enumerate()
            .map(|(index, item)| worker(item, index)),
    )
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await
}
