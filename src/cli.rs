use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dupemap")]
#[command(about = "Find content-identical duplicates in a remote drive", long_about = None)]
pub struct Cli {
    /// Ignore cached metadata and list the drive again
    #[arg(long)]
    pub refresh_cache: bool,

    /// Empty the metadata cache and exit
    #[arg(long)]
    pub clear_cache: bool,

    /// Move duplicates to the trash, choosing which copy to keep
    #[arg(long)]
    pub delete: bool,

    /// With --delete, keep the first copy of every group without asking
    #[arg(long, requires = "delete")]
    pub keep_first: bool,

    /// With --delete, show what would be trashed without changing anything
    #[arg(long, requires = "delete")]
    pub dry_run: bool,

    /// Output JSON to stdout
    #[arg(long)]
    pub json: bool,

    /// Write JSON output to file
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Export duplicate pairs as CSV
    #[arg(long, value_name = "FILE")]
    pub csv: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Show progress indicator while listing and fetching
    #[arg(long)]
    pub progress: bool,

    /// Config file (default: ~/.config/dupemap/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Metadata cache file (overrides config)
    #[arg(long, value_name = "FILE")]
    pub cache_file: Option<PathBuf>,

    /// Requests per batch (overrides config)
    #[arg(long, value_name = "N")]
    pub batch_size: Option<usize>,

    /// Cache entry lifetime in hours (overrides config)
    #[arg(long, value_name = "N")]
    pub ttl_hours: Option<u64>,

    /// Bearer token for the drive API (overrides config and DUPEMAP_ACCESS_TOKEN)
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Also append log records to this file
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == Some(0) {
            return Err("--batch-size must be at least 1".to_string());
        }
        if self.ttl_hours == Some(0) {
            return Err("--ttl-hours must be at least 1".to_string());
        }
        if self.delete && self.json && !self.keep_first && !self.dry_run {
            return Err("--delete with --json needs --keep-first or --dry-run".to_string());
        }
        Ok(())
    }

    pub fn should_output_json(&self) -> bool {
        self.json || self.output.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "dupemap",
            "--refresh-cache",
            "--delete",
            "--keep-first",
            "--batch-size",
            "50",
            "-vv",
        ])
        .unwrap();

        assert!(cli.refresh_cache);
        assert!(cli.keep_first);
        assert_eq!(cli.batch_size, Some(50));
        assert_eq!(cli.verbose, 2);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_keep_first_requires_delete() {
        assert!(Cli::try_parse_from(["dupemap", "--keep-first"]).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let cli = Cli::try_parse_from(["dupemap", "--batch-size", "0"]).unwrap();
        assert!(cli.validate().is_err());
    }
}
