//! Batch assembly for [`ResourceLoader::load_batch`].

use std::collections::{HashMap, HashSet};

use futures::future;
use tokio::time::Instant;

use super::{LoaderEvent, LoaderInner, ResourceLoader};
use crate::priority::sort_by_score;
use crate::strategy::BatchOutcome;
use crate::types::{LoadOptions, Resource, ResourceType, normalize_url};

/// Normalizes urls and removes duplicates, keeping the first occurrence.
///
/// Empty urls are dropped, they can never load.
fn dedup(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter()
        .filter(|url| !url.trim().is_empty())
        .map(|url| normalize_url(url))
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Moves stylesheets, scripts and data files ahead of everything else.
///
/// The relative order within both groups is kept.
fn group_critical(urls: Vec<String>) -> Vec<String> {
    let (mut critical, rest): (Vec<_>, Vec<_>) = urls
        .into_iter()
        .partition(|url| ResourceType::from_url(url).is_critical());
    critical.extend(rest);
    critical
}

/// Counts the urls of a batch run that wait for a later batch as queued requests.
///
/// Whatever is left is uncounted on drop, also when the run is abandoned.
struct Backlog<'a> {
    inner: &'a LoaderInner,
    remaining: usize,
}

impl<'a> Backlog<'a> {
    fn new(inner: &'a LoaderInner, count: usize) -> Self {
        inner.state.lock().backlog += count;
        Self {
            inner,
            remaining: count,
        }
    }

    fn take(&mut self, count: usize) {
        let count = count.min(self.remaining);
        self.remaining -= count;
        let mut state = self.inner.state.lock();
        state.backlog = state.backlog.saturating_sub(count);
    }
}

impl Drop for Backlog<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.backlog = state.backlog.saturating_sub(self.remaining);
    }
}

pub(super) async fn load_batch(
    loader: &ResourceLoader,
    urls: &[String],
    options: LoadOptions,
) -> Vec<Option<Resource>> {
    let inner = &loader.inner;

    let mut unique = dedup(urls);
    sort_by_score(&*inner.scorer, &mut unique, options.priority);
    if unique.len() > inner.config.batch_grouping_threshold {
        unique = group_critical(unique);
    }
    tracing::debug!(
        requested = urls.len(),
        unique = unique.len(),
        "loading batch"
    );

    let mut loaded: HashMap<String, Resource> = HashMap::with_capacity(unique.len());
    let mut backlog = Backlog::new(inner, unique.len());
    let mut remaining = unique.as_slice();
    while !remaining.is_empty() {
        if inner.is_destroyed() {
            break;
        }

        let context = inner.concurrency_context();
        let size = inner.batch_size(&context).min(remaining.len());
        let (batch, rest) = remaining.split_at(size);
        remaining = rest;
        backlog.take(size);

        let started = Instant::now();
        let results = future::join_all(
            batch
                .iter()
                .map(|url| loader.load(url, options.clone())),
        )
        .await;
        let total_time = started.elapsed();

        let mut success_count = 0;
        for (url, result) in batch.iter().zip(results) {
            if let Ok(resource) = result {
                success_count += 1;
                loaded.insert(url.clone(), resource);
            }
        }
        let failure_count = batch.len() - success_count;

        if inner.is_destroyed() {
            break;
        }

        inner.source.record_batch(&BatchOutcome {
            concurrency_used: size,
            total_time,
            resource_count: batch.len(),
            success_count,
            failure_count,
            context,
        });
        inner.state.lock().stats.batches += 1;

        tracing::debug!(
            size,
            success_count,
            failure_count,
            duration = %humantime::format_duration(total_time),
            "batch completed"
        );
        metric!(timer("loader.batch.duration") = total_time);
        metric!(histogram("loader.batch.size") = size as u64);
        inner.emit(LoaderEvent::BatchCompleted {
            size: batch.len(),
            success_count,
            failure_count,
            concurrency: size,
            duration: total_time,
        });
    }
    drop(backlog);

    urls.iter()
        .map(|url| {
            if url.trim().is_empty() {
                return None;
            }
            loaded.get(&normalize_url(url)).cloned()
        })
        .collect()
}
