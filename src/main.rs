mod batch;
mod cache;
mod cli;
mod clock;
mod config;
mod detector;
mod drive;
mod error;
mod folders;
mod gateway;
mod logging;
mod progress;
mod prompt;
mod report;
mod scan;
mod transport;
mod types;

#[cfg(test)]
mod testutil;

use cache::{CacheStore, Fingerprint};
use clap::Parser;
use cli::Cli;
use config::DupemapConfig;
use drive::DriveTransport;
use gateway::RemoteGateway;
use is_terminal::IsTerminal;
use progress::ScanProgress;
use report::{JsonRenderer, TerminalRenderer};
use scan::{execute_deletions, keep_first, plan_deletions, DuplicateScanner};
use tracing::{error, info};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    // Runs to completion before exiting so the cache and log writer flush.
    let code = run(&cli);
    std::process::exit(code);
}

fn run(cli: &Cli) -> i32 {
    let use_color = !cli.no_color && std::io::stdout().is_terminal();
    let _log_guard = logging::init_logging(
        cli.verbose,
        cli.log_file.as_deref(),
        !cli.no_color && std::io::stderr().is_terminal(),
    );

    let mut config = match DupemapConfig::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };
    apply_overrides(&mut config, cli);

    let fingerprint = Fingerprint::from_credentials(&config.remote.credentials_path);
    let mut cache = CacheStore::open(config.cache_path(), fingerprint, config.cache_settings());

    if cli.clear_cache {
        cache.clear();
        eprintln!("Cleared metadata cache at {}", cache.path().display());
        return 0;
    }

    let Some(token) = config.access_token() else {
        eprintln!(
            "Error: no access token; pass --token, set remote.access_token in the config, \
             or set DUPEMAP_ACCESS_TOKEN"
        );
        return 2;
    };

    let transport = DriveTransport::new(&config.remote, token);
    let mut gateway = RemoteGateway::new(transport, cache, config.batch_settings())
        .with_progress(ScanProgress::new(cli.progress));

    let report = match DuplicateScanner::new(cli.refresh_cache).scan(&mut gateway) {
        Ok(report) => report,
        Err(e) => {
            error!("scan failed: {e}");
            eprintln!("Error: {}", e);
            return 3;
        }
    };

    let renderer = TerminalRenderer::new(use_color, cli.verbose > 0)
        .with_notices_to_stderr(cli.should_output_json());

    if cli.should_output_json() {
        if let Err(e) = JsonRenderer::new().render(&report, cli.output.as_deref()) {
            eprintln!("Error writing JSON output: {}", e);
            return 3;
        }
    } else {
        renderer.render(&report);
    }

    if let Some(path) = &cli.csv {
        match report::write_csv_file(&report, path) {
            Ok(rows) => eprintln!("Exported {} rows to {}", rows, path.display()),
            Err(e) => {
                eprintln!("Error writing CSV export: {}", e);
                return 3;
            }
        }
    }

    let mut exit_code = if report.unresolved.is_empty() { 0 } else { 1 };

    if cli.delete && !report.groups.is_empty() {
        let plan = if cli.keep_first {
            plan_deletions(&report.groups, keep_first)
        } else {
            let names = report::folder_names(&report);
            plan_deletions(&report.groups, |index, group| {
                prompt::ask_keep(index, group, &names)
            })
        };
        let plan = match plan {
            Ok(plan) => plan,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 3;
            }
        };

        if cli.dry_run {
            renderer.render_dry_run(&plan.trash, &report);
        } else {
            let outcome = execute_deletions(&mut gateway, &plan);
            renderer.render_trash(&outcome);
            if !outcome.failed.is_empty() {
                exit_code = 1;
            }
        }
    }

    let stats = gateway.stats();
    info!(
        requests = stats.total_requests,
        successes = stats.successes,
        failures = stats.failures,
        retries = stats.retries,
        cache_hits = stats.cache_hits,
        cache_entries = gateway.cache().len(),
        "run finished"
    );

    exit_code
}

fn apply_overrides(config: &mut DupemapConfig, cli: &Cli) {
    if let Some(path) = &cli.cache_file {
        config.cache.path = Some(path.clone());
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch.batch_size = batch_size;
    }
    if let Some(ttl_hours) = cli.ttl_hours {
        config.cache.ttl_hours = ttl_hours;
    }
    if let Some(token) = &cli.token {
        config.remote.access_token = Some(token.clone());
    }
}
