//! Test doubles shared by the unit tests.

use crate::clock::Clock;
use crate::config::{BatchSettings, CacheSettings};
use crate::error::RemoteError;
use crate::transport::{BatchReply, BatchRequest, ListPage, RemoteTransport};
use crate::types::ObjectRecord;
use chrono::{DateTime, TimeZone, Utc};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::time::Duration;

pub fn file(id: &str, size: u64, hash: &str) -> ObjectRecord {
    ObjectRecord {
        id: id.to_string(),
        name: format!("{id}.bin"),
        size: Some(size),
        content_hash: Some(hash.to_string()),
        parents: Vec::new(),
        is_container: false,
        trashed: false,
        mime_type: Some("application/octet-stream".to_string()),
    }
}

pub fn file_in(id: &str, size: u64, hash: &str, parents: &[&str]) -> ObjectRecord {
    let mut record = file(id, size, hash);
    record.parents = parents.iter().map(|p| p.to_string()).collect();
    record
}

pub fn folder(id: &str, name: &str, parents: &[&str]) -> ObjectRecord {
    ObjectRecord {
        id: id.to_string(),
        name: name.to_string(),
        size: None,
        content_hash: None,
        parents: parents.iter().map(|p| p.to_string()).collect(),
        is_container: true,
        trashed: false,
        mime_type: Some("application/vnd.google-apps.folder".to_string()),
    }
}

pub fn ids(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

pub fn cache_settings() -> CacheSettings {
    CacheSettings {
        ttl: Duration::from_secs(24 * 3600),
        save_interval: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(600),
    }
}

pub fn batch_settings(batch_size: usize) -> BatchSettings {
    BatchSettings {
        batch_size,
        max_retries: 3,
        retry_delay: Duration::ZERO,
        item_base_delay: Duration::ZERO,
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            now: Rc::new(Cell::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap();
        self.now.set(self.now.get() + delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }
}

/// Scripted in-memory remote store.
pub struct MockTransport {
    objects: RefCell<Vec<ObjectRecord>>,
    page_size: usize,
    batch_item_failures: RefCell<HashSet<String>>,
    get_failures: RefCell<HashMap<String, u32>>,
    trash_failures: RefCell<HashSet<String>>,
    batch_failures: Cell<u32>,
    list_failure_page: Cell<Option<usize>>,
    list_transient_failures: RefCell<HashMap<usize, u32>>,
    pub list_calls: Cell<usize>,
    pub get_calls: Cell<usize>,
    pub batch_calls: Cell<usize>,
    pub batch_sizes: RefCell<Vec<usize>>,
    pub trash_calls: Cell<usize>,
}

impl MockTransport {
    pub fn new(objects: Vec<ObjectRecord>) -> Self {
        Self {
            objects: RefCell::new(objects),
            page_size: 2,
            batch_item_failures: RefCell::new(HashSet::new()),
            get_failures: RefCell::new(HashMap::new()),
            trash_failures: RefCell::new(HashSet::new()),
            batch_failures: Cell::new(0),
            list_failure_page: Cell::new(None),
            list_transient_failures: RefCell::new(HashMap::new()),
            list_calls: Cell::new(0),
            get_calls: Cell::new(0),
            batch_calls: Cell::new(0),
            batch_sizes: RefCell::new(Vec::new()),
            trash_calls: Cell::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// The id fails with a transient error whenever it appears in a batch.
    pub fn fail_in_batch(&self, id: &str) {
        self.batch_item_failures.borrow_mut().insert(id.to_string());
    }

    /// The next `times` individual fetches of `id` fail transiently.
    pub fn fail_get(&self, id: &str, times: u32) {
        self.get_failures.borrow_mut().insert(id.to_string(), times);
    }

    pub fn fail_trash(&self, id: &str) {
        self.trash_failures.borrow_mut().insert(id.to_string());
    }

    /// The next `times` batch calls fail as a whole.
    pub fn fail_batches(&self, times: u32) {
        self.batch_failures.set(times);
    }

    pub fn fail_listing_at_page(&self, page: Option<usize>) {
        self.list_failure_page.set(page);
    }

    /// The next `times` requests for `page` fail transiently.
    pub fn fail_listing_transiently(&self, page: usize, times: u32) {
        self.list_transient_failures.borrow_mut().insert(page, times);
    }

    pub fn is_trashed(&self, id: &str) -> bool {
        self.objects
            .borrow()
            .iter()
            .any(|o| o.id == id && o.trashed)
    }

    fn lookup(&self, id: &str) -> Result<ObjectRecord, RemoteError> {
        self.objects
            .borrow()
            .iter()
            .find(|o| o.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::terminal(format!("file not found: {id}")))
    }

    fn mark_trashed(&self, id: &str) -> Result<(), RemoteError> {
        if self.trash_failures.borrow().contains(id) {
            return Err(RemoteError::terminal(format!("insufficient permissions for {id}")));
        }
        let mut objects = self.objects.borrow_mut();
        match objects.iter_mut().find(|o| o.id == id) {
            Some(object) => {
                object.trashed = true;
                Ok(())
            }
            None => Err(RemoteError::terminal(format!("file not found: {id}"))),
        }
    }
}

impl RemoteTransport for MockTransport {
    fn list_page(&self, page_token: Option<&str>) -> Result<ListPage, RemoteError> {
        self.list_calls.set(self.list_calls.get() + 1);
        let page: usize = page_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        if self.list_failure_page.get() == Some(page) {
            return Err(RemoteError::terminal("listing rejected"));
        }
        if let Some(remaining) = self.list_transient_failures.borrow_mut().get_mut(&page) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::transient(format!("backend error on page {page}")));
            }
        }

        let visible: Vec<ObjectRecord> = self
            .objects
            .borrow()
            .iter()
            .filter(|o| !o.trashed)
            .cloned()
            .collect();
        let start = page * self.page_size;
        let end = (start + self.page_size).min(visible.len());
        let objects = visible.get(start..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < visible.len()).then(|| (page + 1).to_string());

        Ok(ListPage {
            objects,
            next_token,
        })
    }

    fn get(&self, id: &str) -> Result<ObjectRecord, RemoteError> {
        self.get_calls.set(self.get_calls.get() + 1);
        if let Some(remaining) = self.get_failures.borrow_mut().get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::transient(format!("backend error for {id}")));
            }
        }
        self.lookup(id)
    }

    fn batch(
        &self,
        requests: &[BatchRequest],
    ) -> Result<Vec<Result<BatchReply, RemoteError>>, RemoteError> {
        self.batch_calls.set(self.batch_calls.get() + 1);
        self.batch_sizes.borrow_mut().push(requests.len());

        let pending_failures = self.batch_failures.get();
        if pending_failures > 0 {
            self.batch_failures.set(pending_failures - 1);
            return Err(RemoteError::transient("connection reset"));
        }

        let outcomes = requests
            .iter()
            .map(|request| {
                if self.batch_item_failures.borrow().contains(request.id()) {
                    return Err(RemoteError::transient(format!(
                        "backend error for {}",
                        request.id()
                    )));
                }
                match request {
                    BatchRequest::Metadata(id) => self.lookup(id).map(BatchReply::Metadata),
                    BatchRequest::Trash(id) => self.mark_trashed(id).map(|_| BatchReply::Trashed),
                }
            })
            .collect();
        Ok(outcomes)
    }

    fn trash(&self, id: &str) -> Result<(), RemoteError> {
        self.trash_calls.set(self.trash_calls.get() + 1);
        self.mark_trashed(id)
    }
}
