//! Hub Cache - command line entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hub_cache::cache::CacheManager;
use hub_cache::download::{FileDownloadRequest, FileDownloader, JobHandle, SnapshotRequest};
use hub_cache::hub::ModelQuery;
use hub_cache::{
    HttpTransport, HubApi, HubConfig, HubResult, RepoKind, RepoRef, SnapshotDownloader,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "hub-cache")]
#[command(about = "Model hub downloader with a shared local cache", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Never touch the network
    #[arg(long)]
    offline: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download a repository snapshot
    Download {
        repo_id: String,
        #[arg(long, default_value = "model")]
        repo_type: RepoKind,
        #[arg(long)]
        revision: Option<String>,
        /// Glob of files to include (repeatable)
        #[arg(long = "include")]
        include: Vec<String>,
        /// Glob of files to skip (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Download a single file
    File {
        repo_id: String,
        filename: String,
        #[arg(long, default_value = "model")]
        repo_type: RepoKind,
        #[arg(long)]
        revision: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Show what the cache holds
    Scan {
        /// Print the full inventory as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete old revisions
    Cleanup {
        /// Delete these commits instead of keeping the latest of every repo
        #[arg(long = "revision")]
        revisions: Vec<String>,
        /// Show what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
    /// Search models on the hub
    Search {
        query: Option<String>,
        #[arg(long = "filter")]
        filters: Vec<String>,
        #[arg(long)]
        sort: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays pipeable
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let mut config = HubConfig::load(cli.config)?;

    // CLI overrides
    if let Some(cache_dir) = cli.cache_dir {
        config.cache_dir = cache_dir;
    }
    if cli.offline {
        config.offline = true;
    }

    config.validate()?;

    tracing::debug!(
        endpoint = %config.endpoint,
        cache_dir = ?config.cache_dir,
        offline = config.offline,
        max_workers = config.max_workers,
        "Configuration loaded"
    );

    match cli.command {
        Command::Download {
            repo_id,
            repo_type,
            revision,
            include,
            exclude,
            force,
            max_workers,
        } => {
            if let Some(max_workers) = max_workers {
                config.max_workers = max_workers;
                config.validate()?;
            }
            let snapshots = build_downloader(&config)?;
            let request = SnapshotRequest {
                repo: RepoRef::new(repo_type, repo_id)?,
                revision,
                allow_patterns: (!include.is_empty()).then_some(include),
                ignore_patterns: (!exclude.is_empty()).then_some(exclude),
                force_download: force,
                local_files_only: config.offline,
            };

            let job = snapshots.job(request);
            let handle = job.handle();
            let path = run_until_signal(job.run(), &handle).await?;
            println!("{}", path.display());
        }

        Command::File {
            repo_id,
            filename,
            repo_type,
            revision,
            force,
        } => {
            let files = build_downloader(&config)?.files().clone();
            let request = FileDownloadRequest {
                repo: RepoRef::new(repo_type, repo_id)?,
                filename,
                revision,
                force_download: force,
                local_files_only: config.offline,
            };

            let job = files.job(request);
            let handle = job.handle();
            let path = run_until_signal(job.run(), &handle).await?;
            println!("{}", path.display());
        }

        Command::Scan { json } => {
            let info = CacheManager::new(&config.cache_dir).scan_cache()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                for repo in &info.repos {
                    println!(
                        "{:<8} {:<50} {:>14} {:>6} files {:>3} revisions",
                        repo.repo_kind,
                        repo.repo_id,
                        repo.size_on_disk,
                        repo.nb_files,
                        repo.revisions.len()
                    );
                }
                println!(
                    "{} repositories, {} bytes in {:?}",
                    info.repos.len(),
                    info.size_on_disk,
                    info.cache_dir
                );
                for warning in &info.warnings {
                    eprintln!("warning: {}", warning);
                }
            }
        }

        Command::Cleanup { revisions, dry_run } => {
            let manager = CacheManager::new(&config.cache_dir);

            let plan = if revisions.is_empty() {
                manager.plan_cleanup_all()?
            } else {
                let commits: Vec<&str> = revisions.iter().map(String::as_str).collect();
                manager.scan_cache()?.delete_revisions(&commits)
            };

            if dry_run {
                println!("{}", serde_json::to_string_pretty(&plan)?);
                println!("Would free {} bytes", plan.expected_freed_size);
            } else if revisions.is_empty() {
                let report = manager.cleanup_all_keep_latest()?;
                for failure in &report.failures {
                    eprintln!("failed to clean {}: {}", failure.repo_id, failure.error);
                }
                println!(
                    "Freed {} bytes across {} repositories",
                    report.freed_bytes, report.repos_cleaned
                );
            } else {
                let freed = plan.execute()?;
                println!("Freed {} bytes", freed);
            }
        }

        Command::Search {
            query,
            filters,
            sort,
            limit,
        } => {
            let api = build_api(&config)?;
            let models = api
                .list_models(&ModelQuery {
                    search: query,
                    filter: filters,
                    sort,
                    direction: Some(-1),
                    limit: Some(limit),
                })
                .await?;

            for model in models {
                println!(
                    "{:<60} {:>10} downloads {:>6} likes",
                    model.id, model.downloads, model.likes
                );
            }
        }
    }

    Ok(())
}

fn build_api(config: &HubConfig) -> Result<Arc<HubApi>> {
    let transport =
        HttpTransport::new(config.transport_options()).context("Failed to build HTTP client")?;
    Ok(Arc::new(HubApi::new(
        Arc::new(transport),
        config.api_options()?,
    )))
}

fn build_downloader(config: &HubConfig) -> Result<SnapshotDownloader> {
    let files = FileDownloader::new(
        build_api(config)?,
        config.cache_dir.clone(),
        config.download_options(),
    );
    Ok(SnapshotDownloader::new(files, config.snapshot_options()))
}

/// Drive a job; the first shutdown signal pauses it and keeps partial files
async fn run_until_signal<T>(
    job: impl Future<Output = HubResult<T>>,
    handle: &JobHandle,
) -> Result<T> {
    tokio::pin!(job);

    tokio::select! {
        result = &mut job => return Ok(result?),
        _ = shutdown_signal() => {
            tracing::info!("Pausing download, partial files are kept for the next run");
            handle.pause();
        }
    }

    let result = job.await;
    if let Some(token) = handle.resume_token() {
        tracing::info!(path = ?token.incomplete_path, offset = token.offset, "Download paused");
    }
    result.context("Download interrupted")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        },
    }
}
