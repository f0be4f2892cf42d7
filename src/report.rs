use crate::batch::BatchStats;
use crate::error::Result;
use crate::types::{DuplicateGroup, FolderSummary, ObjectRecord, ScanReport, TrashOutcome};
use colored::*;
use humansize::{format_size, BINARY};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::path::Path;

const BOX_TL: &str = "╭";
const BOX_TR: &str = "╮";
const BOX_BL: &str = "╰";
const BOX_BR: &str = "╯";
const BOX_H: &str = "─";
const BOX_V: &str = "│";
const BOX_LT: &str = "├";
const BOX_RT: &str = "┤";

/// Folder id to display name, for every folder the scan resolved.
pub fn folder_names(report: &ScanReport) -> HashMap<String, String> {
    report
        .folders
        .iter()
        .map(|f| (f.folder_id.clone(), f.name().to_string()))
        .collect()
}

pub struct TerminalRenderer {
    use_color: bool,
    verbose: bool,
    /// Deletion messages go to stderr when stdout carries JSON.
    notices_to_stderr: bool,
}

impl TerminalRenderer {
    pub fn new(use_color: bool, verbose: bool) -> Self {
        Self {
            use_color,
            verbose,
            notices_to_stderr: false,
        }
    }

    pub fn with_notices_to_stderr(mut self, enabled: bool) -> Self {
        self.notices_to_stderr = enabled;
        self
    }

    fn notice(&self, line: String) {
        if self.notices_to_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    pub fn render(&self, report: &ScanReport) {
        let names = folder_names(report);

        println!();
        self.print_header(report);
        println!();

        if report.groups.is_empty() {
            println!("  No duplicate files found.");
            println!();
            return;
        }

        self.print_groups(&report.groups, &names);

        if !report.folders.is_empty() {
            println!();
            self.print_folders("Folders Containing Duplicates", &report.folders);
        }

        println!();
        if report.duplicate_only.is_empty() {
            println!(
                "  {}",
                self.colorize("No folders contain only duplicates.", "bright_black", false)
            );
        } else {
            self.print_folders("Folders Containing Only Duplicates", &report.duplicate_only);
        }

        if !report.unresolved.is_empty() {
            println!();
            self.print_unresolved(&report.unresolved);
        }

        println!();
        self.print_stats(&report.stats);
        println!();
    }

    fn print_header(&self, report: &ScanReport) {
        let width = 62;
        let totals = &report.totals;

        println!(
            "  {}{}{}",
            self.colorize(BOX_TL, "bright_black", false),
            self.colorize(&BOX_H.repeat(width), "bright_black", false),
            self.colorize(BOX_TR, "bright_black", false)
        );
        self.box_line("  Duplicate Analysis", "cyan", true, width);
        println!(
            "  {}{}{}",
            self.colorize(BOX_LT, "bright_black", false),
            self.colorize(&BOX_H.repeat(width), "bright_black", false),
            self.colorize(BOX_RT, "bright_black", false)
        );

        let lines = [
            (
                format!(
                    "  Objects: {}  │  Candidates: {}",
                    totals.objects_listed, totals.candidates
                ),
                "white",
            ),
            (
                format!(
                    "  Groups: {}  │  Duplicate files: {}",
                    totals.duplicate_groups, totals.duplicate_files
                ),
                "yellow",
            ),
            (
                format!("  Wasted space: {}", format_size(totals.wasted_bytes, BINARY)),
                "red",
            ),
            (
                format!(
                    "  Folders: {}  │  Duplicate-only: {}",
                    totals.folders_with_duplicates, totals.duplicate_only_folders
                ),
                "magenta",
            ),
        ];
        for (text, color) in &lines {
            self.box_line(text, color, false, width);
        }

        println!(
            "  {}{}{}",
            self.colorize(BOX_BL, "bright_black", false),
            self.colorize(&BOX_H.repeat(width), "bright_black", false),
            self.colorize(BOX_BR, "bright_black", false)
        );
    }

    fn box_line(&self, text: &str, color: &str, bold: bool, width: usize) {
        let shown = truncate(text, width - 2);
        let padding = width.saturating_sub(shown.chars().count());
        println!(
            "  {} {}{} {}",
            self.colorize(BOX_V, "bright_black", false),
            self.colorize(&shown, color, bold),
            " ".repeat(padding.saturating_sub(1)),
            self.colorize(BOX_V, "bright_black", false)
        );
    }

    fn print_groups(&self, groups: &[DuplicateGroup], names: &HashMap<String, String>) {
        println!(
            "  {} {}",
            self.colorize("▼", "cyan", false),
            self.colorize("Duplicate Groups", "cyan", true)
        );
        println!("  {}", self.colorize(&"─".repeat(60), "bright_black", false));

        let shown = if self.verbose { groups.len() } else { groups.len().min(20) };
        for (i, group) in groups.iter().take(shown).enumerate() {
            println!(
                "  {} {} × {}  {}",
                self.colorize(&format!("{:>3}.", i + 1), "bright_black", false),
                self.colorize(&group.files.len().to_string(), "cyan", true),
                self.colorize(&format_size(group.size, BINARY), "green", false),
                self.colorize(
                    &format!("(wasted {})", format_size(group.wasted_space, BINARY)),
                    "red",
                    false
                )
            );
            for file in &group.files {
                let record = group.record(&file.id).unwrap_or(file);
                let folder = record
                    .first_parent()
                    .and_then(|p| names.get(p))
                    .map(String::as_str)
                    .unwrap_or("Unknown");
                println!(
                    "       {} {}",
                    self.colorize(&truncate(&format!("{folder}/{}", record.display_name()), 45), "white", false),
                    self.colorize(&format!("[{}]", record.id), "bright_black", false)
                );
            }
        }

        if groups.len() > shown {
            println!(
                "    {}",
                self.colorize(
                    &format!("... and {} more groups (use -v to list all)", groups.len() - shown),
                    "bright_black",
                    false
                )
            );
        }
    }

    fn print_folders(&self, title: &str, folders: &[FolderSummary]) {
        println!(
            "  {} {}",
            self.colorize("▼", "cyan", false),
            self.colorize(title, "cyan", true)
        );
        println!("  {}", self.colorize(&"─".repeat(60), "bright_black", false));

        let shown = if self.verbose { folders.len() } else { folders.len().min(10) };
        for (i, folder) in folders.iter().take(shown).enumerate() {
            let marker = if folder.is_duplicate_only { "●" } else { "○" };
            println!(
                "  {} {} {:>10}  {}  {}",
                self.colorize(&format!("{:>2}.", i + 1), "bright_black", false),
                self.colorize(marker, "yellow", false),
                self.colorize(&format_size(folder.total_size, BINARY), "green", false),
                self.colorize(&truncate(folder.name(), 30), "white", false),
                self.colorize(
                    &format!(
                        "{}/{} duplicates",
                        folder.duplicate_ids.len(),
                        folder.contained_ids.len()
                    ),
                    "bright_black",
                    false
                )
            );
        }

        if folders.len() > shown {
            println!(
                "    {}",
                self.colorize(
                    &format!("... and {} more", folders.len() - shown),
                    "bright_black",
                    false
                )
            );
        }
    }

    fn print_unresolved(&self, ids: &[String]) {
        println!(
            "  {} {}",
            self.colorize("⚠", "yellow", false),
            self.colorize(
                &format!("Metadata unavailable for {} objects", ids.len()),
                "yellow",
                true
            )
        );
        let display_count = ids.len().min(5);
        for id in ids.iter().take(display_count) {
            println!("    {}", self.colorize(id, "bright_black", false));
        }
        if ids.len() > display_count {
            println!(
                "    {}",
                self.colorize(
                    &format!("... and {} more", ids.len() - display_count),
                    "bright_black",
                    false
                )
            );
        }
    }

    fn print_stats(&self, stats: &BatchStats) {
        println!(
            "  {}",
            self.colorize(
                &format!(
                    "Requests: {}  │  Succeeded: {} ({:.1}%)  │  Failed: {}  │  Retries: {}  │  Cache hits: {}",
                    stats.total_requests,
                    stats.successes,
                    stats.success_rate(),
                    stats.failures,
                    stats.retries,
                    stats.cache_hits
                ),
                "bright_black",
                false
            )
        );
    }

    pub fn render_dry_run(&self, ids: &[String], report: &ScanReport) {
        let records: HashMap<&str, &ObjectRecord> = report
            .groups
            .iter()
            .flat_map(|g| g.files.iter())
            .map(|f| (f.id.as_str(), f))
            .collect();

        self.notice(format!(
            "  {} {}",
            self.colorize("▼", "cyan", false),
            self.colorize(&format!("Would move {} files to trash", ids.len()), "cyan", true)
        ));
        for id in ids {
            let name = records
                .get(id.as_str())
                .map(|r| r.display_name())
                .unwrap_or("Unknown");
            self.notice(format!(
                "    {} {}",
                self.colorize(name, "white", false),
                self.colorize(&format!("[{id}]"), "bright_black", false)
            ));
        }
    }

    pub fn render_trash(&self, outcome: &TrashOutcome) {
        let color = if outcome.failed.is_empty() { "green" } else { "yellow" };
        self.notice(format!(
            "  {}",
            self.colorize(
                &format!("Moved {} of {} files to trash", outcome.moved, outcome.requested),
                color,
                true
            )
        ));
        for id in &outcome.failed {
            self.notice(format!(
                "    {} {}",
                self.colorize("failed:", "red", false),
                self.colorize(id, "white", false)
            ));
        }
    }

    fn colorize(&self, text: &str, color: &str, bold: bool) -> String {
        if !self.use_color {
            return text.to_string();
        }

        let colored = match color {
            "red" => text.red(),
            "green" => text.green(),
            "yellow" => text.yellow(),
            "blue" => text.blue(),
            "cyan" => text.cyan(),
            "magenta" => text.magenta(),
            "white" => text.white(),
            "bright_black" => text.bright_black(),
            _ => text.normal(),
        };

        if bold {
            colored.bold().to_string()
        } else {
            colored.to_string()
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max + 3).collect();
    format!("...{tail}")
}

pub struct JsonRenderer;

impl JsonRenderer {
    pub fn new() -> Self {
        Self
    }

    pub fn render(&self, report: &ScanReport, output_file: Option<&Path>) -> io::Result<()> {
        let json = serde_json::to_string_pretty(report)?;

        if let Some(path) = output_file {
            std::fs::write(path, json)?;
        } else {
            println!("{}", json);
        }

        Ok(())
    }
}

/// One CSV row: a file and one of its duplicates.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    #[serde(rename = "File Name")]
    file_name: &'a str,
    #[serde(rename = "Full Path")]
    full_path: String,
    #[serde(rename = "Size (Bytes)")]
    size: u64,
    #[serde(rename = "Size (Human Readable)")]
    size_human: String,
    #[serde(rename = "File ID")]
    file_id: &'a str,
    #[serde(rename = "MD5 Checksum")]
    checksum: &'a str,
    #[serde(rename = "Duplicate Group ID")]
    group_id: usize,
    #[serde(rename = "Parent Folder")]
    parent_name: &'a str,
    #[serde(rename = "Parent Folder ID")]
    parent_id: &'a str,
    #[serde(rename = "Duplicate File Name")]
    dup_name: &'a str,
    #[serde(rename = "Duplicate File Path")]
    dup_path: String,
    #[serde(rename = "Duplicate File Size")]
    dup_size: u64,
    #[serde(rename = "Duplicate File ID")]
    dup_id: &'a str,
}

/// Writes one row per ordered pair of members within each group and
/// returns the number of rows.
pub fn write_csv<W: io::Write>(report: &ScanReport, writer: W) -> Result<usize> {
    let names = folder_names(report);
    let mut csv = csv::Writer::from_writer(writer);
    let mut rows = 0;

    let folder_name = |parent: Option<&str>| -> String {
        parent
            .and_then(|p| names.get(p))
            .cloned()
            .unwrap_or_else(|| "Unknown".to_string())
    };

    for (index, group) in report.groups.iter().enumerate() {
        let members: Vec<_> = group
            .files
            .iter()
            .map(|f| group.record(&f.id).unwrap_or(f))
            .collect();

        for (i, file) in members.iter().enumerate() {
            let parent_id = file.first_parent().unwrap_or("");
            let parent_name = folder_name(file.first_parent());
            for (j, dup) in members.iter().enumerate() {
                if i == j {
                    continue;
                }
                let dup_parent = folder_name(dup.first_parent());
                let size = file.size.unwrap_or(group.size);
                csv.serialize(CsvRow {
                    file_name: file.display_name(),
                    full_path: format!("{parent_name}/{}", file.display_name()),
                    size,
                    size_human: format_size(size, BINARY),
                    file_id: &file.id,
                    checksum: file.content_hash.as_deref().unwrap_or(&group.hash),
                    group_id: index + 1,
                    parent_name: &parent_name,
                    parent_id,
                    dup_name: dup.display_name(),
                    dup_path: format!("{dup_parent}/{}", dup.display_name()),
                    dup_size: dup.size.unwrap_or(group.size),
                    dup_id: &dup.id,
                })?;
                rows += 1;
            }
        }
    }

    csv.flush()?;
    Ok(rows)
}

pub fn write_csv_file(report: &ScanReport, path: &Path) -> Result<usize> {
    let file = std::fs::File::create(path)?;
    write_csv(report, io::BufWriter::new(file))
}
