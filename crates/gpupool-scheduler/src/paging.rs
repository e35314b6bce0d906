//! Lazy paged listings

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use gpupool_core::{PoolError, PoolResult};
use std::future::Future;

/// Lazy sequence of results. A listing fetches one page at a time as the
/// stream is polled and can be restarted from the last item seen.
pub type PoolStream<T> = BoxStream<'static, PoolResult<T>>;

/// Build a stream that calls `fetch` for successive pages of `page_size`
/// items, deriving the next query from the last item with `resume`.
pub(crate) fn paged<T, Q, F, Fut>(
    query: Q,
    page_size: usize,
    fetch: F,
    resume: fn(Q, &T) -> Q,
) -> PoolStream<T>
where
    T: Send + 'static,
    Q: Clone + Send + 'static,
    F: Fn(Q, usize) -> Fut + Send + 'static,
    Fut: Future<Output = PoolResult<Vec<T>>> + Send + 'static,
{
    let page_size = page_size.max(1);

    stream::unfold(Some(query), move |state| {
        let pending = state.map(|q| (q.clone(), fetch(q, page_size)));
        async move {
            let (query, page) = pending?;
            match page.await {
                Ok(items) => {
                    let next = if items.len() < page_size {
                        None
                    } else {
                        items.last().map(|last| resume(query, last))
                    };
                    Some((Ok(items), next))
                }
                Err(e) => Some((Err(e), None)),
            }
        }
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, PoolError>)))
    .try_flatten()
    .boxed()
}
