use crate::detector::detect;
use crate::error::{DupemapError, Result};
use crate::folders::FolderAnalyzer;
use crate::gateway::RemoteGateway;
use crate::transport::RemoteTransport;
use crate::types::{DuplicateGroup, ObjectRecord, ScanReport, ScanTotals, TrashOutcome};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

/// Which member of a duplicate group survives a deletion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepChoice {
    Keep(usize),
    Skip,
}

/// Runs detection and folder analysis end to end.
pub struct DuplicateScanner {
    force_refresh: bool,
}

impl DuplicateScanner {
    pub fn new(force_refresh: bool) -> Self {
        Self { force_refresh }
    }

    pub fn scan<T: RemoteTransport>(&self, gateway: &mut RemoteGateway<T>) -> Result<ScanReport> {
        let detection = detect(gateway, self.force_refresh)?;

        let mut unresolved: Vec<String> = detection
            .groups
            .iter()
            .flat_map(|g| g.ids().filter(|id| !g.metadata().contains_key(*id)))
            .map(str::to_string)
            .collect();

        let folder_ids = FolderAnalyzer::folder_ids(&detection.groups);
        let folders = resolve_folders(gateway, &detection.listing, &folder_ids);
        unresolved.extend(
            folder_ids
                .iter()
                .filter(|id| !folders.contains_key(*id))
                .cloned(),
        );
        if !unresolved.is_empty() {
            warn!(count = unresolved.len(), "metadata unavailable for some objects");
        }

        let analysis = FolderAnalyzer::new(&detection.listing).analyze(&detection.groups, &folders);

        let mut groups = detection.groups;
        groups.sort_by(|a, b| b.wasted_space.cmp(&a.wasted_space));

        let folder_list = analysis.sorted();
        let duplicate_only = analysis.duplicate_only();
        let totals = ScanTotals {
            objects_listed: detection.listing.len() as u64,
            candidates: detection.candidates as u64,
            duplicate_groups: groups.len() as u64,
            duplicate_files: groups.iter().map(|g| g.files.len() as u64).sum(),
            wasted_bytes: groups.iter().map(|g| g.wasted_space).sum(),
            folders_with_duplicates: folder_list.len() as u64,
            duplicate_only_folders: duplicate_only.len() as u64,
        };

        info!(
            groups = totals.duplicate_groups,
            wasted = totals.wasted_bytes,
            folders = totals.folders_with_duplicates,
            "scan complete"
        );

        Ok(ScanReport {
            totals,
            groups,
            folders: folder_list,
            duplicate_only,
            stats: gateway.stats(),
            unresolved,
        })
    }
}

/// Folder records for `ids`: containers from the listing first, then a
/// batched lookup for the rest (the drive root is never listed).
fn resolve_folders<T: RemoteTransport>(
    gateway: &mut RemoteGateway<T>,
    listing: &[ObjectRecord],
    ids: &BTreeSet<String>,
) -> HashMap<String, ObjectRecord> {
    let mut folders: HashMap<String, ObjectRecord> = listing
        .iter()
        .filter(|o| o.is_container && ids.contains(&o.id))
        .map(|o| (o.id.clone(), o.clone()))
        .collect();

    let missing: Vec<String> = ids
        .iter()
        .filter(|id| !folders.contains_key(*id))
        .cloned()
        .collect();
    if !missing.is_empty() {
        folders.extend(gateway.get_objects_metadata_batch(&missing));
    }
    folders
}

/// Ids to trash, chosen group by group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionPlan {
    pub trash: Vec<String>,
    pub kept: Vec<String>,
    pub skipped_groups: usize,
}

/// Builds a deletion plan by asking `choose` which member of each group to
/// keep. Out-of-range choices skip the group.
pub fn plan_deletions<F>(groups: &[DuplicateGroup], mut choose: F) -> Result<DeletionPlan>
where
    F: FnMut(usize, &DuplicateGroup) -> std::io::Result<KeepChoice>,
{
    let mut plan = DeletionPlan::default();
    let mut planned = BTreeSet::new();

    for (index, group) in groups.iter().enumerate() {
        let keep = match choose(index, group).map_err(DupemapError::Prompt)? {
            KeepChoice::Keep(n) if n < group.files.len() => n,
            _ => {
                plan.skipped_groups += 1;
                continue;
            }
        };

        let kept = &group.files[keep].id;
        plan.kept.push(kept.clone());
        for file in &group.files {
            if &file.id != kept && planned.insert(file.id.clone()) {
                plan.trash.push(file.id.clone());
            }
        }
    }

    // An id kept in one group is never trashed through another.
    let kept: BTreeSet<&String> = plan.kept.iter().collect();
    plan.trash.retain(|id| !kept.contains(id));
    Ok(plan)
}

pub fn keep_first(_index: usize, _group: &DuplicateGroup) -> std::io::Result<KeepChoice> {
    Ok(KeepChoice::Keep(0))
}

/// Moves every planned id to the trash and tallies the outcome.
pub fn execute_deletions<T: RemoteTransport>(
    gateway: &mut RemoteGateway<T>,
    plan: &DeletionPlan,
) -> TrashOutcome {
    if plan.trash.is_empty() {
        return TrashOutcome::default();
    }

    let results = gateway.move_to_trash_batch(&plan.trash);
    let failed: Vec<String> = plan
        .trash
        .iter()
        .filter(|id| !results.get(*id).copied().unwrap_or(false))
        .cloned()
        .collect();

    let outcome = TrashOutcome {
        requested: plan.trash.len(),
        moved: plan.trash.len() - failed.len(),
        failed,
    };
    info!(
        moved = outcome.moved,
        requested = outcome.requested,
        "trash run finished"
    );
    outcome
}
