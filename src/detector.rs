use crate::error::Result;
use crate::gateway::RemoteGateway;
use crate::transport::RemoteTransport;
use crate::types::{DuplicateGroup, ObjectRecord};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    Idle,
    Listing,
    GroupedBySize,
    GroupedByHash,
    Done,
}

/// Output of one detection pass.
#[derive(Debug, Clone)]
pub struct Detection {
    pub listing: Vec<ObjectRecord>,
    pub groups: Vec<DuplicateGroup>,
    pub candidates: usize,
}

/// Two-phase duplicate grouping: exact size first, then content hash.
///
/// Buckets keep the order objects were added in, so group membership
/// follows listing order.
pub struct DuplicateFinder {
    state: DetectorState,
    size_index: HashMap<u64, usize>,
    size_groups: Vec<(u64, Vec<ObjectRecord>)>,
    candidates: usize,
}

impl DuplicateFinder {
    pub fn new() -> Self {
        Self {
            state: DetectorState::Idle,
            size_index: HashMap::new(),
            size_groups: Vec::new(),
            candidates: 0,
        }
    }

    pub fn state(&self) -> DetectorState {
        self.state
    }

    pub fn candidates(&self) -> usize {
        self.candidates
    }

    /// Adds an object to its size bucket. Folders and objects without a
    /// positive size are ignored.
    pub fn add_object(&mut self, object: &ObjectRecord) {
        self.state = DetectorState::Listing;
        if object.is_container {
            return;
        }
        let Some(size) = object.valid_size() else {
            return;
        };

        self.candidates += 1;
        let next = self.size_groups.len();
        let slot = *self.size_index.entry(size).or_insert(next);
        if slot == next {
            self.size_groups.push((size, Vec::new()));
        }
        self.size_groups[slot].1.push(object.clone());
    }

    /// Size buckets that could hold duplicates.
    pub fn size_candidates(&self) -> impl Iterator<Item = &(u64, Vec<ObjectRecord>)> {
        self.size_groups.iter().filter(|(_, members)| members.len() > 1)
    }

    /// Splits every multi-member size bucket by content hash and returns
    /// the hash buckets that still have two or more members.
    pub fn group_by_hash(&mut self) -> Vec<Vec<ObjectRecord>> {
        self.state = DetectorState::GroupedBySize;
        let mut groups = Vec::new();

        for (size, members) in self.size_candidates() {
            let mut hash_index: HashMap<&str, usize> = HashMap::new();
            let mut by_hash: Vec<Vec<ObjectRecord>> = Vec::new();

            for member in members {
                // No hash means no way to prove equality.
                let Some(hash) = member.content_hash.as_deref() else {
                    continue;
                };
                let next = by_hash.len();
                let slot = *hash_index.entry(hash).or_insert(next);
                if slot == next {
                    by_hash.push(Vec::new());
                }
                by_hash[slot].push(member.clone());
            }

            let before = groups.len();
            groups.extend(by_hash.into_iter().filter(|g| g.len() > 1));
            debug!(size = *size, groups = groups.len() - before, "hashed size bucket");
        }

        self.state = DetectorState::GroupedByHash;
        groups
    }
}

impl Default for DuplicateFinder {
    fn default() -> Self {
        Self::new()
    }
}

/// Groups a listing into duplicate sets without fetching any metadata.
pub fn find_duplicates(objects: &[ObjectRecord]) -> Vec<DuplicateGroup> {
    let mut finder = DuplicateFinder::new();
    for object in objects {
        finder.add_object(object);
    }
    finder
        .group_by_hash()
        .into_iter()
        .filter_map(|files| DuplicateGroup::new(files, HashMap::new()))
        .collect()
}

/// Lists the store through the gateway, groups duplicates, and attaches
/// fresh metadata for every duplicate member in one batched lookup.
pub fn detect<T: RemoteTransport>(
    gateway: &mut RemoteGateway<T>,
    force_refresh: bool,
) -> Result<Detection> {
    let mut finder = DuplicateFinder::new();

    let listing: Vec<ObjectRecord> = gateway
        .list_objects(force_refresh)?
        .into_iter()
        .filter(|o| !o.trashed)
        .collect();
    for object in &listing {
        finder.add_object(object);
    }

    let hash_groups = finder.group_by_hash();
    let duplicate_ids: Vec<String> = hash_groups
        .iter()
        .flatten()
        .map(|o| o.id.clone())
        .collect();

    let metadata = if duplicate_ids.is_empty() {
        HashMap::new()
    } else {
        gateway.get_objects_metadata_batch(&duplicate_ids)
    };

    let groups: Vec<DuplicateGroup> = hash_groups
        .into_iter()
        .filter_map(|files| {
            let own = files
                .iter()
                .filter_map(|f| metadata.get(&f.id).map(|m| (f.id.clone(), m.clone())))
                .collect();
            DuplicateGroup::new(files, own)
        })
        .collect();

    finder.state = DetectorState::Done;
    info!(
        listed = listing.len(),
        candidates = finder.candidates(),
        groups = groups.len(),
        "duplicate detection finished"
    );

    Ok(Detection {
        listing,
        groups,
        candidates: finder.candidates(),
    })
}
