//! Chunked fan-out fetching within backend query-shape limits.

use futures::future::{join_all, try_join_all};
use log::debug;
use std::fmt::Display;
use std::future::Future;

/// Splits `ids` into ordered, non-overlapping groups of at most `chunk_size`.
/// A zero chunk size is treated as one.
pub fn chunk_ids<T: Clone>(ids: &[T], chunk_size: usize) -> Vec<Vec<T>> {
    ids.chunks(chunk_size.max(1)).map(<[T]>::to_vec).collect()
}

/// Issues `fetch` once per chunk concurrently and concatenates the results in
/// chunk order. Any failing chunk fails the whole aggregate.
pub async fn fetch_chunked<Id, T, E, F, Fut>(
    ids: &[Id],
    chunk_size: usize,
    fetch: F,
) -> Result<Vec<T>, E>
where
    Id: Clone,
    F: Fn(Vec<Id>) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let groups = try_join_all(chunk_ids(ids, chunk_size).into_iter().map(&fetch)).await?;
    Ok(groups.into_iter().flatten().collect())
}

/// Result of a best-effort fan-out: one entry per parent, plus the parents
/// whose fetch failed and were substituted with an empty result.
#[derive(Debug, Clone, PartialEq)]
pub struct BestEffortBatch<T> {
    pub results: Vec<(String, Vec<T>)>,
    pub skipped: Vec<String>,
}

impl<T> BestEffortBatch<T> {
    pub fn item_count(&self) -> usize {
        self.results.iter().map(|(_, items)| items.len()).sum()
    }
}

/// Fetches per parent concurrently; a failure for one parent yields an empty
/// result for it and never fails the batch.
pub async fn fetch_each_best_effort<T, E, F, Fut>(
    parent_ids: &[String],
    fetch: F,
) -> BestEffortBatch<T>
where
    E: Display,
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Vec<T>, E>>,
{
    let outcomes = join_all(parent_ids.iter().cloned().map(|id| {
        let pending = fetch(id.clone());
        async move { (id, pending.await) }
    }))
    .await;

    let mut batch = BestEffortBatch {
        results: Vec::with_capacity(outcomes.len()),
        skipped: Vec::new(),
    };
    for (id, outcome) in outcomes {
        match outcome {
            Ok(items) => batch.results.push((id, items)),
            Err(err) => {
                debug!("[Fetch] Best-effort fetch for {} failed: {}", id, err);
                batch.skipped.push(id.clone());
                batch.results.push((id, Vec::new()));
            }
        }
    }
    batch
}
