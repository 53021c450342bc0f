use std::sync::Arc;

use anyhow::{Context, Result};
use comet_fetcher::{RepoSpec, RepositoryClient, ResolutionError, Resolver};
use comet_history::HistoryManager;
use comet_launcher::{AppLauncher, ExecutionContext, HostEnv, StartError};

use crate::progress::ProgressReporter;
use crate::CometCli;

/// Resolve a coordinate and hand control to the app, with a progress bar
/// while anything downloads.
pub async fn execute(cli: &CometCli, host_env: &HostEnv, coordinate: &str) -> Result<()> {
    let cache_dir = cli.cache_dir();
    let mut history =
        HistoryManager::open(&cache_dir).context("could not open the history store")?;
    if cli.clear_cache {
        history
            .clear_cache(&cache_dir)
            .context("could not clear the cache directory")?;
    }

    let repos = match RepoSpec::new(&cli.repositories, cli.disable_ssl).resolve() {
        Ok(repos) => repos,
        Err(e) => {
            crate::commands::render_error(&e.to_string());
            std::process::exit(1);
        }
    };

    let progress = Arc::new(ProgressReporter::new());
    let client = RepositoryClient::new(
        cache_dir.join("packages"),
        repos,
        Some(progress.clone()),
        cli.offline,
    )
    .context("could not initialize the repository client")?;
    let resolver = Resolver::new(client);

    let mut launcher = AppLauncher::new(
        resolver,
        history,
        ExecutionContext::Cli,
        host_env.clone(),
        Some(progress),
    );

    if let Err(e) = launcher.start(coordinate, &cli.args, cli.refresh).await {
        render_start_error(&e);
        std::process::exit(1);
    }
    Ok(())
}

/// Failures here are shown to a person mid-command, so they get a short
/// actionable sentence instead of an error chain. The chain still lands in
/// the log for anyone debugging.
fn render_start_error(error: &StartError) {
    tracing::warn!("exception during start: {error:?}");
    match error {
        StartError::Resolution(ResolutionError::NotFound { coordinate }) => {
            println!("Sorry, that package is unknown. Check for typos? ({coordinate})");
        }
        StartError::Resolution(ResolutionError::Unauthorized { .. })
        | StartError::Resolution(ResolutionError::Invalid { .. }) => {
            println!("{error}");
        }
        StartError::Resolution(ResolutionError::Network { url, .. }) => {
            println!("Sorry, could not reach {url}. Are you offline? If so try the --offline flag.");
        }
        other => crate::commands::render_error(&other.to_string()),
    }
}
