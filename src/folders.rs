use crate::types::{DuplicateGroup, FolderSummary, ObjectRecord};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// Folder summaries for one scan.
#[derive(Debug, Clone, Default)]
pub struct FolderAnalysis {
    pub summaries: BTreeMap<String, FolderSummary>,
}

impl FolderAnalysis {
    /// Every folder holding at least one duplicate, largest first.
    pub fn sorted(&self) -> Vec<FolderSummary> {
        let mut folders: Vec<FolderSummary> = self.summaries.values().cloned().collect();
        folders.sort_by(|a, b| {
            b.total_size
                .cmp(&a.total_size)
                .then_with(|| a.folder_id.cmp(&b.folder_id))
        });
        folders
    }

    /// Folders whose direct children are all duplicates, largest first.
    pub fn duplicate_only(&self) -> Vec<FolderSummary> {
        self.sorted()
            .into_iter()
            .filter(|f| f.is_duplicate_only)
            .collect()
    }

    pub fn get(&self, folder_id: &str) -> Option<&FolderSummary> {
        self.summaries.get(folder_id)
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

/// Maps duplicate objects onto the folders that hold them.
///
/// An object with several parents counts toward every one of them.
/// Membership is direct only: a folder's children are the listed objects
/// naming it as a parent, folders and empty files included.
pub struct FolderAnalyzer<'a> {
    listing: &'a [ObjectRecord],
}

impl<'a> FolderAnalyzer<'a> {
    pub fn new(listing: &'a [ObjectRecord]) -> Self {
        Self { listing }
    }

    /// Parent folder ids referenced by the duplicate groups.
    pub fn folder_ids(groups: &[DuplicateGroup]) -> BTreeSet<String> {
        groups.iter().flat_map(DuplicateGroup::parent_folders).collect()
    }

    /// Builds summaries for every folder containing a duplicate. `folders`
    /// supplies records for naming; folders missing from it are still
    /// summarised with no record.
    pub fn analyze(
        &self,
        groups: &[DuplicateGroup],
        folders: &HashMap<String, ObjectRecord>,
    ) -> FolderAnalysis {
        let mut duplicates: BTreeMap<String, (BTreeSet<String>, u64)> = BTreeMap::new();

        for group in groups {
            for file in &group.files {
                let Some(record) = group.record(&file.id) else {
                    continue;
                };
                let size = record.size.unwrap_or(group.size);
                for parent in &record.parents {
                    let entry = duplicates.entry(parent.clone()).or_default();
                    if entry.0.insert(file.id.clone()) {
                        entry.1 += size;
                    }
                }
            }
        }

        let mut children: HashMap<&str, BTreeSet<String>> = HashMap::new();
        for object in self.listing.iter().filter(|o| !o.trashed) {
            for parent in &object.parents {
                if duplicates.contains_key(parent) {
                    children
                        .entry(parent.as_str())
                        .or_default()
                        .insert(object.id.clone());
                }
            }
        }

        let summaries: BTreeMap<String, FolderSummary> = duplicates
            .into_iter()
            .map(|(folder_id, (duplicate_ids, total_size))| {
                let contained_ids = children.remove(folder_id.as_str()).unwrap_or_default();
                let folder = folders.get(&folder_id).cloned();
                let summary =
                    FolderSummary::new(folder_id.clone(), folder, duplicate_ids, contained_ids, total_size);
                (folder_id, summary)
            })
            .collect();

        debug!(
            folders = summaries.len(),
            duplicate_only = summaries.values().filter(|s| s.is_duplicate_only).count(),
            "analyzed folders"
        );

        FolderAnalysis { summaries }
    }
}
