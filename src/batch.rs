use crate::cache::{CacheStore, CachedValue};
use crate::config::BatchSettings;
use crate::error::{DupemapError, RemoteError, Result};
use crate::transport::{BatchReply, BatchRequest, RemoteTransport};
use crate::types::ObjectRecord;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Successful result recorded for one id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchPayload {
    Metadata(ObjectRecord),
    Trashed(bool),
}

/// Request counters, reported to the operator at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub cache_hits: u64,
}

impl BatchStats {
    pub fn merge(&mut self, other: &BatchStats) {
        self.total_requests += other.total_requests;
        self.successes += other.successes;
        self.failures += other.failures;
        self.retries += other.retries;
        self.cache_hits += other.cache_hits;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successes as f64 / self.total_requests as f64 * 100.0
    }
}

/// Accumulates per-object requests and sends them as bounded batches.
///
/// Successful metadata replies are written to the cache; successful trash
/// replies evict the object from it. Item failures are collected in a
/// failed set rather than raised.
pub struct BatchMultiplexer<'a> {
    transport: &'a dyn RemoteTransport,
    cache: &'a mut CacheStore,
    settings: BatchSettings,
    pending: Vec<BatchRequest>,
    results: HashMap<String, BatchPayload>,
    cached_results: HashMap<String, BatchPayload>,
    failed: HashSet<String>,
    stats: BatchStats,
}

impl<'a> BatchMultiplexer<'a> {
    pub fn new(
        transport: &'a dyn RemoteTransport,
        cache: &'a mut CacheStore,
        settings: BatchSettings,
    ) -> Self {
        Self {
            transport,
            cache,
            settings,
            pending: Vec::with_capacity(settings.batch_size),
            results: HashMap::new(),
            cached_results: HashMap::new(),
            failed: HashSet::new(),
            stats: BatchStats::default(),
        }
    }

    /// Queues a metadata fetch, answering from the cache when possible.
    ///
    /// A full batch is executed first; its error (if any) is returned after
    /// the new request has been queued.
    pub fn add_metadata_request(&mut self, id: &str) -> Result<()> {
        if let Some(record) = self.cache.get_object(id) {
            self.stats.cache_hits += 1;
            self.cached_results
                .insert(id.to_string(), BatchPayload::Metadata(record));
            return Ok(());
        }
        self.enqueue(BatchRequest::Metadata(id.to_string()))
    }

    pub fn add_trash_request(&mut self, id: &str) -> Result<()> {
        self.enqueue(BatchRequest::Trash(id.to_string()))
    }

    fn enqueue(&mut self, request: BatchRequest) -> Result<()> {
        let flushed = if self.pending.len() >= self.settings.batch_size {
            self.execute()
        } else {
            Ok(())
        };
        self.stats.total_requests += 1;
        self.pending.push(request);
        flushed
    }

    /// Sends the pending batch, retrying whole-batch transport failures with
    /// a constant delay. The buffer is empty afterwards either way.
    pub fn execute(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let requests = std::mem::take(&mut self.pending);
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            debug!(
                "executing batch with {} requests (attempt {attempt}/{max_attempts})",
                requests.len()
            );
            match self.transport.batch(&requests) {
                Ok(outcomes) => break Ok(outcomes),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    self.stats.retries += 1;
                    warn!(
                        "batch execution failed, retrying in {:?}: {e}",
                        self.settings.retry_delay
                    );
                    std::thread::sleep(self.settings.retry_delay);
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(outcomes) => {
                self.dispatch(&requests, outcomes);
                info!(
                    "batch completed: {}/{} successful ({:.1}%), {} failed, {} retries",
                    self.stats.successes,
                    self.stats.total_requests,
                    self.stats.success_rate(),
                    self.stats.failures,
                    self.stats.retries
                );
                Ok(())
            }
            Err(source) => {
                error!(
                    "batch execution failed after {attempt} attempts: {source}"
                );
                for request in &requests {
                    self.mark_failed(request.id());
                }
                Err(DupemapError::BatchExhausted {
                    size: requests.len(),
                    attempts: attempt,
                    source,
                })
            }
        }
    }

    fn dispatch(
        &mut self,
        requests: &[BatchRequest],
        outcomes: Vec<std::result::Result<BatchReply, RemoteError>>,
    ) {
        if outcomes.len() != requests.len() {
            warn!(
                "batch returned {} outcomes for {} requests",
                outcomes.len(),
                requests.len()
            );
        }

        let mut updates = Vec::new();
        let mut removals = Vec::new();
        let mut outcomes = outcomes.into_iter();

        for request in requests {
            let id = request.id();
            match (request, outcomes.next()) {
                (BatchRequest::Metadata(_), Some(Ok(BatchReply::Metadata(record)))) => {
                    self.mark_succeeded(id);
                    updates.push((id.to_string(), CachedValue::Object(record.clone())));
                    self.results
                        .insert(id.to_string(), BatchPayload::Metadata(record));
                }
                (BatchRequest::Trash(_), Some(Ok(BatchReply::Trashed))) => {
                    self.mark_succeeded(id);
                    removals.push(id.to_string());
                    self.results
                        .insert(id.to_string(), BatchPayload::Trashed(true));
                }
                (BatchRequest::Metadata(_), Some(Err(e))) => {
                    error!("error getting metadata for {id}: {e}");
                    self.mark_failed(id);
                }
                (BatchRequest::Trash(_), Some(Err(e))) => {
                    error!("error trashing {id}: {e}");
                    self.mark_failed(id);
                }
                (_, Some(Ok(reply))) => {
                    error!("unexpected reply for {id}: {reply:?}");
                    self.mark_failed(id);
                }
                (_, None) => {
                    error!("no reply received for {id}");
                    self.mark_failed(id);
                }
            }
        }

        self.cache.update(updates);
        self.cache.remove(&removals);
    }

    fn mark_succeeded(&mut self, id: &str) {
        self.stats.successes += 1;
        self.failed.remove(id);
    }

    fn mark_failed(&mut self, id: &str) {
        self.stats.failures += 1;
        self.failed.insert(id.to_string());
    }

    /// Every successful payload so far, cache hits included.
    pub fn get_results(&self) -> HashMap<String, BatchPayload> {
        let mut merged = self.results.clone();
        merged.extend(
            self.cached_results
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    pub fn get_failed_requests(&self) -> &HashSet<String> {
        &self.failed
    }

    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Runs `f` up to `settings.max_retries` times, sleeping
/// `item_base_delay * 2^(attempt - 1)` between attempts. Only transient
/// errors are retried. Returns the final result and the number of retries.
pub fn retry_with_backoff<T, F>(
    settings: &BatchSettings,
    op_name: &str,
    mut f: F,
) -> (std::result::Result<T, RemoteError>, u32)
where
    F: FnMut() -> std::result::Result<T, RemoteError>,
{
    let max_attempts = settings.max_retries.max(1);
    let mut retries = 0;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f() {
            Ok(value) => return (Ok(value), retries),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = settings.item_backoff(attempt);
                warn!(
                    "{op_name}: transient error (attempt {attempt}/{max_attempts}), retrying in {delay:?}: {e}"
                );
                retries += 1;
                std::thread::sleep(delay);
            }
            Err(e) => return (Err(e), retries),
        }
    }
}
