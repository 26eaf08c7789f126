//! Download Worker Binary
//!
//! Entry point for the OS periodic scheduler. Runs one time-boxed
//! reconciliation pass over the download ledger, lets running transfers
//! progress for whatever budget remains, then prints a JSON summary to
//! stdout and exits. Logs go to stderr.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use model_downloader::{default_data_dir, BackgroundCheckSummary, DownloaderConfig, ModelDownloader};

/// Background reconciliation pass for model downloads
#[derive(Parser, Debug)]
#[command(name = "download-worker")]
#[command(about = "Run one time-boxed background pass over the model download ledger")]
struct Cli {
    /// Downloader data directory (default: platform data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Total time this run may take, in seconds (default: the configured budget)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    budget_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WorkerReport {
    check: BackgroundCheckSummary,
    /// Nothing was starting or downloading when the worker exited
    idle: bool,
    active_downloads: usize,
    elapsed_ms: u128,
}

async fn run(cli: Cli) -> Result<WorkerReport> {
    let started = Instant::now();

    let config = DownloaderConfig::new(cli.data_dir.unwrap_or_else(default_data_dir));
    let downloader = ModelDownloader::open(config).context("Failed to open model downloader")?;
    let budget = cli
        .budget_secs
        .map(Duration::from_secs)
        .unwrap_or(downloader.config().background_budget);
    log::info!("Background pass starting, budget {:?}", budget);

    let check = downloader.check_background_downloads_within(budget).await;
    if let Some(error) = &check.error {
        log::warn!("Background check reported: {}", error);
    }

    let remaining = budget.saturating_sub(started.elapsed());
    let idle = if downloader.active_download_count() == 0 {
        true
    } else {
        log::info!(
            "Letting {} downloads run for up to {:?}",
            downloader.active_download_count(),
            remaining
        );
        downloader.wait_for_idle(remaining).await
    };

    downloader.shutdown();

    Ok(WorkerReport {
        check,
        idle,
        active_downloads: downloader.active_download_count(),
        elapsed_ms: started.elapsed().as_millis(),
    })
}

#[tokio::main]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("Download worker PANIC: {}", panic_info);
        if let Some(location) = panic_info.location() {
            eprintln!("  at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                log::error!("Failed to serialize report: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            log::error!("Background pass failed: {:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    fn parse(args: &[&str]) -> std::result::Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("download-worker").chain(args.iter().copied()))
    }

    #[test]
    fn test_parse_defaults() {
        let cli = parse(&[]).unwrap();
        assert_eq!(cli.data_dir, None);
        assert_eq!(cli.budget_secs, None);
    }

    #[test]
    fn test_parse_values() {
        let cli = parse(&["--data-dir", "/data/app", "--budget-secs", "20"]).unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/data/app")));
        assert_eq!(cli.budget_secs, Some(20));
    }

    #[test]
    fn test_parse_help_and_errors() {
        assert_eq!(parse(&["--help"]).unwrap_err().kind(), ErrorKind::DisplayHelp);
        assert!(parse(&["--budget-secs"]).is_err());
        assert_eq!(
            parse(&["--budget-secs", "soon"]).unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert_eq!(
            parse(&["--budget-secs", "0"]).unwrap_err().kind(),
            ErrorKind::ValueValidation
        );
        assert_eq!(parse(&["--verbose"]).unwrap_err().kind(), ErrorKind::UnknownArgument);
    }

    #[test]
    fn test_cli_definition() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[tokio::test]
    async fn test_run_on_empty_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("data");
        let report = run(Cli {
            data_dir: Some(dir.clone()),
            budget_secs: Some(5),
        })
        .await
        .unwrap();

        assert!(report.idle);
        assert_eq!(report.active_downloads, 0);
        assert!(report.check.error.is_none());
        assert!(dir.join("downloader.db").exists());
        assert!(dir.join("models").is_dir());
    }
}
