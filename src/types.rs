use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::batch::BatchStats;

/// Snapshot of one object (file or folder) as reported by the remote store.
///
/// Records are never patched in place; a fresh fetch replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub is_container: bool,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ObjectRecord {
    /// Size in bytes, or `None` when the store reported no size or zero.
    pub fn valid_size(&self) -> Option<u64> {
        self.size.filter(|&s| s > 0)
    }

    /// Size for arithmetic; absent sizes count as zero.
    pub fn size_or_zero(&self) -> u64 {
        self.size.unwrap_or(0)
    }

    pub fn first_parent(&self) -> Option<&str> {
        self.parents.first().map(String::as_str)
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "Unknown"
        } else {
            &self.name
        }
    }
}

/// Two or more objects that share a byte size and a content hash.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub size: u64,
    pub hash: String,
    pub files: Vec<ObjectRecord>,
    pub total_size: u64,
    pub wasted_space: u64,
    #[serde(skip)]
    metadata: HashMap<String, ObjectRecord>,
}

impl DuplicateGroup {
    /// Builds a group from members in listing order. Returns `None` for
    /// fewer than two members or members that disagree on size or hash.
    pub fn new(files: Vec<ObjectRecord>, metadata: HashMap<String, ObjectRecord>) -> Option<Self> {
        if files.len() < 2 {
            return None;
        }

        let size = files[0].valid_size()?;
        let hash = files[0].content_hash.clone()?;
        let consistent = files
            .iter()
            .all(|f| f.size == Some(size) && f.content_hash.as_deref() == Some(hash.as_str()));
        if !consistent {
            return None;
        }

        let total_size: u64 = files.iter().map(ObjectRecord::size_or_zero).sum();
        let wasted_space = total_size - size;

        Some(Self {
            size,
            hash,
            files,
            total_size,
            wasted_space,
            metadata,
        })
    }

    /// Freshest known record for a member: fetched metadata if available,
    /// otherwise the listing entry the group was built from.
    pub fn record(&self, id: &str) -> Option<&ObjectRecord> {
        self.metadata
            .get(id)
            .or_else(|| self.files.iter().find(|f| f.id == id))
    }

    pub fn metadata(&self) -> &HashMap<String, ObjectRecord> {
        &self.metadata
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.id.as_str())
    }

    /// Parent folder ids across all members, using fetched metadata when present.
    pub fn parent_folders(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .filter_map(|f| self.record(&f.id))
            .flat_map(|r| r.parents.iter().cloned())
            .collect()
    }
}

/// Per-folder view of which children are duplicates.
#[derive(Debug, Clone, Serialize)]
pub struct FolderSummary {
    pub folder_id: String,
    pub folder: Option<ObjectRecord>,
    pub duplicate_ids: BTreeSet<String>,
    pub contained_ids: BTreeSet<String>,
    pub is_duplicate_only: bool,
    pub total_size: u64,
}

impl FolderSummary {
    pub fn new(
        folder_id: String,
        folder: Option<ObjectRecord>,
        duplicate_ids: BTreeSet<String>,
        contained_ids: BTreeSet<String>,
        total_size: u64,
    ) -> Self {
        let is_duplicate_only = duplicate_ids == contained_ids;
        Self {
            folder_id,
            folder,
            duplicate_ids,
            contained_ids,
            is_duplicate_only,
            total_size,
        }
    }

    pub fn name(&self) -> &str {
        self.folder
            .as_ref()
            .map(ObjectRecord::display_name)
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanTotals {
    pub objects_listed: u64,
    pub candidates: u64,
    pub duplicate_groups: u64,
    pub duplicate_files: u64,
    pub wasted_bytes: u64,
    pub folders_with_duplicates: u64,
    pub duplicate_only_folders: u64,
}

/// Everything one scan produced, in the shape handed to renderers.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub totals: ScanTotals,
    pub groups: Vec<DuplicateGroup>,
    pub folders: Vec<FolderSummary>,
    pub duplicate_only: Vec<FolderSummary>,
    pub stats: BatchStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<String>,
}

/// Per-id outcome of a trash run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrashOutcome {
    pub requested: usize,
    pub moved: usize,
    pub failed: Vec<String>,
}
