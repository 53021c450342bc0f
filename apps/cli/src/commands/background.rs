use anyhow::{Context, Result};
use chrono::Duration;
use comet_fetcher::{RepoSpec, RepositoryClient, Resolver};
use comet_history::{HistoryManager, Options};
use comet_launcher::HostEnv;
use comet_updater::{release_signing_key, UpdateChecker, UpdateResult};
use url::Url;

use crate::CometCli;

/// The scheduled background pass: refresh stale history entries so recent
/// apps stay pre-fetched, then check for an update to comet itself. Nothing
/// in here may crash or block foreground use; every failure is logged and
/// deferred to the next scheduled run.
pub async fn execute(cli: &CometCli, host_env: &HostEnv) {
    tracing::info!("background update started");

    if let Err(e) = refresh_recent_apps(cli).await {
        tracing::error!("app refresh failed: {e:#}");
    }

    // We won't check for online updates unless run from the main install
    // image, as otherwise we may not have a version or installation path.
    let (Some(version), Some(install_path)) = (host_env.version, host_env.install_path.clone())
    else {
        tracing::info!("not running from an installed image, skipping self-update");
        return;
    };
    let Ok(version) = u32::try_from(version) else {
        tracing::warn!("nonsensical version number {version}, skipping self-update");
        return;
    };
    let base_url = match Url::parse(&cli.update_url) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!("bad update URL '{}': {e}", cli.update_url);
            return;
        }
    };

    let checker = UpdateChecker::new(base_url, release_signing_key());
    match checker.check_for_update(version, &install_path).await {
        Ok(UpdateResult::UpdatedTo(n)) => tracing::info!("updated to version {n}"),
        Ok(UpdateResult::AlreadyFresh) => tracing::info!("no update needed"),
        Ok(UpdateResult::InsufficientDiskSpace) => {
            tracing::warn!("not enough disk space for an update")
        }
        Ok(UpdateResult::InstallerFailed) => tracing::error!("native installer failed"),
        // Includes signature failures: logged only, the user never sees an
        // unattended update break.
        Err(e) => tracing::error!("update check failed: {e}"),
    }
}

async fn refresh_recent_apps(cli: &CometCli) -> Result<()> {
    let cache_dir = cli.cache_dir();
    let mut history = HistoryManager::open_with(
        &cache_dir,
        Options {
            // Half the foreground interval, so entries are usually fresh by
            // the time the user asks for them.
            refresh_interval: Duration::hours(12),
            ..Options::default()
        },
    )
    .context("could not open the history store")?;

    let repos = RepoSpec::new(&cli.repositories, cli.disable_ssl)
        .resolve()
        .context("bad repository spec")?;
    let client = RepositoryClient::new(cache_dir.join("packages"), repos, None, cli.offline)
        .context("could not initialize the repository client")?;
    let resolver = Resolver::new(client);

    let resolver_ref = &resolver;
    history
        .refresh_all(|fragment| async move { resolver_ref.download(&fragment).await })
        .await;
    history.persist_now()?;
    Ok(())
}
