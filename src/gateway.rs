use crate::batch::{retry_with_backoff, BatchMultiplexer, BatchPayload, BatchStats};
use crate::cache::{CacheStore, CachedValue, ALL_FOLDERS_KEY, ALL_OBJECTS_KEY};
use crate::config::BatchSettings;
use crate::error::{DupemapError, Result};
use crate::progress::ScanProgress;
use crate::transport::RemoteTransport;
use crate::types::ObjectRecord;
use std::collections::{HashMap, HashSet};
use tracing::{debug, error, info, warn};

/// Cache-first access to remote object metadata.
///
/// This is the only component the detector and analyzer talk to; it
/// decides when to answer from the cache, when to batch, and when to fall
/// back to one-by-one fetches.
pub struct RemoteGateway<T: RemoteTransport> {
    transport: T,
    cache: CacheStore,
    settings: BatchSettings,
    stats: BatchStats,
    progress: ScanProgress,
}

impl<T: RemoteTransport> RemoteGateway<T> {
    pub fn new(transport: T, cache: CacheStore, settings: BatchSettings) -> Self {
        Self {
            transport,
            cache,
            settings,
            stats: BatchStats::default(),
            progress: ScanProgress::hidden(),
        }
    }

    pub fn with_progress(mut self, progress: ScanProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Every non-trashed object in the store.
    ///
    /// Served from the cache unless `force_refresh` is set or nothing is
    /// cached. If paging fails part way and a cached listing exists, the
    /// stale listing is returned instead of the error.
    pub fn list_objects(&mut self, force_refresh: bool) -> Result<Vec<ObjectRecord>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get_objects(ALL_OBJECTS_KEY) {
                if !cached.is_empty() {
                    debug!(objects = cached.len(), "using cached listing");
                    return Ok(cached);
                }
            }
        }

        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0;

        loop {
            let (page, retries) = retry_with_backoff(&self.settings, "list objects", || {
                self.transport.list_page(page_token.as_deref())
            });
            self.stats.retries += u64::from(retries);

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    self.progress.finish();
                    error!("error listing objects after {pages} pages: {e}");
                    if let Some(cached) = self.cache.get_objects(ALL_OBJECTS_KEY) {
                        warn!(
                            objects = cached.len(),
                            "falling back to cached listing"
                        );
                        return Ok(cached);
                    }
                    return Err(DupemapError::ListingFailed(e));
                }
            };

            pages += 1;
            objects.extend(page.objects.into_iter().filter(|o| !o.trashed));
            self.progress.listing(objects.len(), pages);

            match page.next_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }
        self.progress.finish();

        info!(objects = objects.len(), pages, "listed remote objects");
        if !objects.is_empty() {
            let folders: Vec<ObjectRecord> =
                objects.iter().filter(|o| o.is_container).cloned().collect();
            self.cache.cache_objects(objects.clone());
            self.cache.cache_folders(folders);
        }
        Ok(objects)
    }

    /// Container objects from the listing.
    pub fn list_folders(&mut self, force_refresh: bool) -> Result<Vec<ObjectRecord>> {
        if !force_refresh {
            if let Some(cached) = self.cache.get_objects(ALL_FOLDERS_KEY) {
                if !cached.is_empty() {
                    return Ok(cached);
                }
            }
        }
        let objects = self.list_objects(force_refresh)?;
        Ok(objects.into_iter().filter(|o| o.is_container).collect())
    }

    /// Metadata for one object; `None` means "could not determine", not
    /// "does not exist".
    pub fn get_object_metadata(&mut self, id: &str) -> Option<ObjectRecord> {
        if let Some(record) = self.cache.get_object(id) {
            self.stats.cache_hits += 1;
            return Some(record);
        }

        self.stats.total_requests += 1;
        let (result, retries) =
            retry_with_backoff(&self.settings, &format!("get metadata for {id}"), || {
                self.transport.get(id)
            });
        self.stats.retries += u64::from(retries);

        match result {
            Ok(record) => {
                self.stats.successes += 1;
                self.cache.set(id, CachedValue::Object(record.clone()));
                Some(record)
            }
            Err(e) => {
                self.stats.failures += 1;
                error!("error getting metadata for {id}: {e}");
                None
            }
        }
    }

    /// Metadata for many objects. Ids whose metadata could not be fetched,
    /// even individually, are absent from the returned map.
    pub fn get_objects_metadata_batch(&mut self, ids: &[String]) -> HashMap<String, ObjectRecord> {
        let mut results = HashMap::new();
        let mut remaining = Vec::new();
        let mut seen = HashSet::new();

        for id in ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            match self.cache.get_object(id) {
                Some(record) => {
                    self.stats.cache_hits += 1;
                    results.insert(id.clone(), record);
                }
                None => remaining.push(id.clone()),
            }
        }

        if remaining.is_empty() {
            return results;
        }

        let settings = self.settings;
        let total = remaining.len();
        let mut done = 0;
        let mut fallback = Vec::new();

        for chunk in remaining.chunks(settings.batch_size) {
            let mut mux = BatchMultiplexer::new(&self.transport, &mut self.cache, settings);
            for id in chunk {
                if let Err(e) = mux.add_metadata_request(id) {
                    warn!("batch flush failed while queueing {id}: {e}");
                }
            }
            let executed = mux.execute();

            for (id, payload) in mux.get_results() {
                if let BatchPayload::Metadata(record) = payload {
                    results.insert(id, record);
                }
            }

            match executed {
                Ok(()) => {
                    let failed = mux.get_failed_requests();
                    if !failed.is_empty() {
                        warn!("failed to get metadata for {} objects in batch", failed.len());
                    }
                    fallback.extend(chunk.iter().filter(|id| failed.contains(*id)).cloned());
                }
                Err(e) => {
                    warn!("batch failed, fetching {} objects individually: {e}", chunk.len());
                    fallback.extend(chunk.iter().filter(|id| !results.contains_key(*id)).cloned());
                }
            }
            self.stats.merge(mux.stats());

            done += chunk.len();
            self.progress.fetching(done, total);
        }
        self.progress.finish();

        for id in fallback {
            match self.get_object_metadata(&id) {
                Some(record) => {
                    results.insert(id, record);
                }
                None => warn!("metadata unavailable for {id}"),
            }
        }

        results
    }

    /// Moves objects to the trash. Every input id appears in the result;
    /// `false` means the mutation did not take effect.
    pub fn move_to_trash_batch(&mut self, ids: &[String]) -> HashMap<String, bool> {
        let mut unique = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            if seen.insert(id.as_str()) {
                unique.push(id.clone());
            }
        }

        let settings = self.settings;
        let total = unique.len();
        let mut done = 0;
        let mut results = HashMap::with_capacity(total);
        let mut fallback = Vec::new();

        for chunk in unique.chunks(settings.batch_size) {
            let mut mux = BatchMultiplexer::new(&self.transport, &mut self.cache, settings);
            for id in chunk {
                if let Err(e) = mux.add_trash_request(id) {
                    warn!("batch flush failed while queueing {id}: {e}");
                }
            }
            if let Err(e) = mux.execute() {
                warn!("trash batch failed, trashing {} objects individually: {e}", chunk.len());
            }

            let batch_results = mux.get_results();
            for id in chunk {
                let moved = matches!(batch_results.get(id), Some(BatchPayload::Trashed(true)));
                if !moved {
                    fallback.push(id.clone());
                }
                results.insert(id.clone(), moved);
            }
            self.stats.merge(mux.stats());

            done += chunk.len();
            self.progress.trashing(done, total);
        }
        self.progress.finish();

        for id in fallback {
            let moved = self.trash_one(&id);
            if !moved {
                error!("failed to move {id} to trash");
            }
            results.insert(id, moved);
        }

        let moved: HashSet<&str> = results
            .iter()
            .filter(|(_, ok)| **ok)
            .map(|(id, _)| id.as_str())
            .collect();
        if !moved.is_empty() {
            self.forget_listed(&moved);
        }

        results
    }

    fn trash_one(&mut self, id: &str) -> bool {
        self.stats.total_requests += 1;
        let (result, retries) =
            retry_with_backoff(&self.settings, &format!("trash {id}"), || {
                self.transport.trash(id)
            });
        self.stats.retries += u64::from(retries);

        match result {
            Ok(()) => {
                self.stats.successes += 1;
                self.cache.remove(&[id]);
                true
            }
            Err(e) => {
                self.stats.failures += 1;
                error!("error trashing {id}: {e}");
                false
            }
        }
    }

    /// Drops trashed ids from the cached listings so later runs do not
    /// report them again. The listings keep their original age.
    fn forget_listed(&mut self, ids: &HashSet<&str>) {
        for key in [ALL_OBJECTS_KEY, ALL_FOLDERS_KEY] {
            self.cache
                .retain_objects(key, |o| !ids.contains(o.id.as_str()));
        }
    }

    pub fn stats(&self) -> BatchStats {
        self.stats
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CacheStore {
        &mut self.cache
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Fingerprint;
    use crate::testutil::{
        batch_settings, cache_settings, file, folder, ids, ManualClock, MockTransport,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn gateway(dir: &TempDir, transport: MockTransport, batch_size: usize) -> RemoteGateway<MockTransport> {
        let cache = CacheStore::open(
            dir.path().join("cache.json"),
            Fingerprint::new("test"),
            cache_settings(),
        );
        RemoteGateway::new(transport, cache, batch_settings(batch_size))
    }

    fn objects() -> Vec<ObjectRecord> {
        vec![
            file("a", 100, "h1"),
            file("b", 100, "h1"),
            file("c", 100, "h2"),
            folder("f1", "Photos", &[]),
            file("d", 200, "h3"),
        ]
    }

    #[test]
    fn test_list_objects_pages_and_caches() {
        let dir = TempDir::new().unwrap();
        let mut gw = gateway(&dir, MockTransport::new(objects()).with_page_size(2), 10);

        let listed = gw.list_objects(false).unwrap();
        assert_eq!(listed.len(), 5);
        assert_eq!(gw.transport().list_calls.get(), 3);

        let again = gw.list_objects(false).unwrap();
        assert_eq!(again, listed);
        assert_eq!(gw.transport().list_calls.get(), 3);

        gw.list_objects(true).unwrap();
        assert_eq!(gw.transport().list_calls.get(), 6);

        let folders = gw.list_folders(false).unwrap();
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].id, "f1");
    }

    #[test]
    fn test_list_objects_falls_back_to_cache() {
        let dir = TempDir::new().unwrap();
        let mut gw = gateway(&dir, MockTransport::new(objects()), 10);
        gw.list_objects(false).unwrap();

        gw.transport().fail_listing_at_page(Some(1));
        let listed = gw.list_objects(true).unwrap();
        assert_eq!(listed.len(), 5);
    }

    #[test]
    fn test_list_objects_retries_transient_page() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_listing_transiently(1, 2);
        let mut gw = gateway(&dir, transport, 10);

        let listed = gw.list_objects(false).unwrap();

        assert_eq!(listed.len(), 5);
        assert_eq!(gw.transport().list_calls.get(), 5);
        assert_eq!(gw.stats().retries, 2);
    }

    #[test]
    fn test_list_objects_gives_up_after_transient_retries() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_listing_transiently(2, 3);
        let mut gw = gateway(&dir, transport, 10);

        let err = gw.list_objects(false).unwrap_err();

        assert!(matches!(err, DupemapError::ListingFailed(ref e) if e.is_transient()));
        assert_eq!(gw.transport().list_calls.get(), 5);
    }

    #[test]
    fn test_list_objects_without_cache_propagates() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_listing_at_page(Some(0));
        let mut gw = gateway(&dir, transport, 10);

        let err = gw.list_objects(false).unwrap_err();
        assert!(matches!(err, DupemapError::ListingFailed(_)));
    }

    #[test]
    fn test_get_object_metadata_is_cache_first() {
        let dir = TempDir::new().unwrap();
        let mut gw = gateway(&dir, MockTransport::new(objects()), 10);

        let first = gw.get_object_metadata("a").unwrap();
        let second = gw.get_object_metadata("a").unwrap();
        assert_eq!(first, second);
        assert_eq!(gw.transport().get_calls.get(), 1);
        assert_eq!(gw.stats().cache_hits, 1);
    }

    #[test]
    fn test_get_object_metadata_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let mut gw = gateway(&dir, MockTransport::new(objects()), 10);

        assert!(gw.get_object_metadata("nope").is_none());
        // Not found is terminal, so no retries.
        assert_eq!(gw.transport().get_calls.get(), 1);
    }

    #[test]
    fn test_get_object_metadata_retries_transient() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_get("a", 2);
        let mut gw = gateway(&dir, transport, 10);

        assert!(gw.get_object_metadata("a").is_some());
        assert_eq!(gw.transport().get_calls.get(), 3);
        assert_eq!(gw.stats().retries, 2);
    }

    #[test]
    fn test_batch_lookup_chunks_and_falls_back() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_in_batch("c");
        let mut gw = gateway(&dir, transport, 2);

        let results = gw.get_objects_metadata_batch(&ids(&["a", "b", "c", "d", "a"]));

        assert_eq!(results.len(), 4);
        assert_eq!(*gw.transport().batch_sizes.borrow(), vec![2, 2]);
        // "c" failed in its batch and was fetched on its own.
        assert_eq!(gw.transport().get_calls.get(), 1);
    }

    #[test]
    fn test_batch_lookup_omits_unavailable_ids() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_in_batch("c");
        transport.fail_get("c", 10);
        let mut gw = gateway(&dir, transport, 10);

        let results = gw.get_objects_metadata_batch(&ids(&["a", "c", "missing"]));

        assert_eq!(results.len(), 1);
        assert!(results.contains_key("a"));
        assert!(!results.contains_key("c"));
        assert!(!results.contains_key("missing"));
    }

    #[test]
    fn test_batch_lookup_survives_whole_batch_failure() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_batches(3);
        let mut gw = gateway(&dir, transport, 10);

        let results = gw.get_objects_metadata_batch(&ids(&["a", "b"]));

        assert_eq!(results.len(), 2);
        assert_eq!(gw.transport().batch_calls.get(), 3);
        assert_eq!(gw.transport().get_calls.get(), 2);
    }

    #[test]
    fn test_batch_lookup_uses_cache() {
        let dir = TempDir::new().unwrap();
        let mut gw = gateway(&dir, MockTransport::new(objects()), 10);
        gw.get_objects_metadata_batch(&ids(&["a", "b"]));
        gw.get_objects_metadata_batch(&ids(&["a", "b"]));

        assert_eq!(gw.transport().batch_calls.get(), 1);
        assert_eq!(gw.stats().cache_hits, 2);
    }

    #[test]
    fn test_move_to_trash_reports_every_id() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_trash("b");
        let mut gw = gateway(&dir, transport, 2);
        gw.list_objects(false).unwrap();
        gw.get_object_metadata("a");

        let results = gw.move_to_trash_batch(&ids(&["a", "b", "missing"]));

        assert_eq!(results.len(), 3);
        assert!(results["a"]);
        assert!(!results["b"]);
        assert!(!results["missing"]);
        assert!(gw.transport().is_trashed("a"));

        assert!(gw.cache_mut().get_object("a").is_none());
        let cached: Vec<String> = gw
            .cache_mut()
            .get_all_objects()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert!(!cached.contains(&"a".to_string()));
        assert!(cached.contains(&"b".to_string()));
    }

    #[test]
    fn test_move_to_trash_falls_back_after_batch_failure() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_batches(3);
        transport.fail_trash("b");
        let mut gw = gateway(&dir, transport, 10);

        let results = gw.move_to_trash_batch(&ids(&["a", "b"]));

        assert_eq!(results.len(), 2);
        assert!(results["a"]);
        assert!(!results["b"]);
        assert_eq!(gw.transport().trash_calls.get(), 2);
        assert!(gw.transport().is_trashed("a"));
    }

    #[test]
    fn test_move_to_trash_retries_transient_item_individually() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new(objects());
        transport.fail_in_batch("a");
        let mut gw = gateway(&dir, transport, 10);
        gw.list_objects(false).unwrap();

        let results = gw.move_to_trash_batch(&ids(&["a", "c"]));

        assert!(results["a"]);
        assert!(results["c"]);
        assert_eq!(gw.transport().trash_calls.get(), 1);
        let cached: Vec<String> = gw
            .cache_mut()
            .get_all_objects()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(cached, vec!["b", "f1", "d"]);
    }

    #[test]
    fn test_trash_does_not_extend_listing_lifetime() {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new();
        let cache = CacheStore::open_with_clock(
            dir.path().join("cache.json"),
            Fingerprint::new("test"),
            cache_settings(),
            Box::new(clock.clone()),
        );
        let mut gw = RemoteGateway::new(MockTransport::new(objects()), cache, batch_settings(10));

        gw.list_objects(false).unwrap();
        assert_eq!(gw.transport().list_calls.get(), 3);

        clock.advance(Duration::from_secs(23 * 3600));
        assert!(gw.move_to_trash_batch(&ids(&["a"]))["a"]);

        clock.advance(Duration::from_secs(2 * 3600));
        let listed = gw.list_objects(false).unwrap();

        // The 25h old listing is expired, so the store is paged again.
        assert_eq!(gw.transport().list_calls.get(), 5);
        assert_eq!(listed.len(), 4);
        assert!(listed.iter().all(|o| o.id != "a"));
    }
}
