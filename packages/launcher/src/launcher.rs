use std::process::Command;
use std::sync::Arc;

use comet_fetcher::{Resolution, Resolver};
use comet_history::{HistoryEntry, HistoryManager};

use crate::env::{self, HostEnv};
use crate::error::StartError;
use crate::loader::{Gateway, ModuleLoader};
use crate::strategy::{select_load_strategy, Capabilities, ExecutionContext, LoadStrategy};

/// Launch lifecycle callbacks, layered on top of the fetch progress events
/// the resolver already emits. Defaults are no-ops.
pub trait LaunchEvents: Send + Sync {
    fn preparing_to_download(&self) {}
    fn initializing_app(&self) {}
    fn about_to_start_app(&self, _out_of_process: bool) {}
    fn app_finished(&self) {}
    fn on_error(&self, _error: &StartError) {}
}

/// Performs the tasks needed to start an app: cache lookup, resolution,
/// history recording, strategy selection and the handoff itself.
pub struct AppLauncher {
    resolver: Resolver,
    history: HistoryManager,
    context: ExecutionContext,
    host_env: HostEnv,
    gateway: Gateway,
    events: Option<Arc<dyn LaunchEvents>>,
}

impl AppLauncher {
    pub fn new(
        resolver: Resolver,
        history: HistoryManager,
        context: ExecutionContext,
        host_env: HostEnv,
        events: Option<Arc<dyn LaunchEvents>>,
    ) -> Self {
        let gateway = Gateway::headless(host_env.version);
        AppLauncher {
            resolver,
            history,
            context,
            host_env,
            gateway,
            events,
        }
    }

    /// A GUI shell calls this so hosted apps see the real drawable area.
    pub fn set_gateway(&mut self, gateway: Gateway) {
        self.gateway = gateway;
    }

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut HistoryManager {
        &mut self.history
    }

    /// Resolves the user's input, records the launch in the history list and
    /// hands control to the app.
    pub async fn start(
        &mut self,
        user_input: &str,
        args: &[String],
        force_refresh: bool,
    ) -> Result<(), StartError> {
        let result = self.start_inner(user_input, args, force_refresh).await;
        if let Err(e) = &result {
            if let Some(events) = &self.events {
                events.on_error(e);
            }
        }
        result
    }

    async fn start_inner(
        &mut self,
        user_input: &str,
        args: &[String],
        force_refresh: bool,
    ) -> Result<(), StartError> {
        let user_input = user_input.trim();
        if user_input.is_empty() {
            return Err(StartError::BadInvocation(
                "No coordinates specified".to_owned(),
            ));
        }
        let fetch = self.lookup_or_download(user_input, force_refresh).await?;
        // Move (or insert) the entry at the top of the history list.
        self.history
            .record(HistoryEntry::from_resolution(user_input, &fetch));
        self.run_app(user_input, &fetch, args).await
    }

    /// Performs a download from the user's input, consulting the history
    /// list first. A hit is only trusted if it is fresh and every module
    /// file is still on disk; anything less silently falls back to a full
    /// resolution.
    pub async fn lookup_or_download(
        &mut self,
        user_input: &str,
        force_refresh: bool,
    ) -> Result<Resolution, StartError> {
        if !force_refresh {
            if let Some(hit) = self.history.search(user_input) {
                if !hit.stale && hit.entry.still_on_disk() {
                    // The entry carries the full module list, so this skips
                    // both the version poll and the dependency walk.
                    tracing::info!("used previously resolved coordinates {}", hit.entry);
                    return Ok(hit.entry.as_resolution()?);
                }
            }
        }
        if let Some(events) = &self.events {
            events.preparing_to_download();
        }
        let fetch = self.resolver.download(user_input).await?;
        tracing::info!("app name: {}", fetch.name);
        if let Some(description) = &fetch.description {
            tracing::info!("app description: {description}");
        }
        Ok(fetch)
    }

    async fn run_app(
        &mut self,
        user_input: &str,
        fetch: &Resolution,
        args: &[String],
    ) -> Result<(), StartError> {
        let loader = match ModuleLoader::for_resolution(fetch) {
            Ok(loader) => loader,
            Err(StartError::MissingModule(missing)) => {
                // We thought we had a resolution but it's not on disk any
                // more; the user probably wiped the cache, which deletes
                // artifacts but leaves the recent apps list alone.
                tracing::info!("{} vanished, re-resolving", missing.display());
                let fresh = self.resolver.download(user_input).await?;
                ModuleLoader::for_resolution(&fresh)?
            }
            Err(e) => return Err(e),
        };

        if let Some(events) = &self.events {
            events.initializing_app();
        }

        let caps = Capabilities {
            inline_capable: loader.inline_capable(),
        };
        let strategy = select_load_strategy(self.context, caps);
        tracing::info!("load strategy is {strategy:?}");

        match strategy {
            LoadStrategy::RestartAndRun => self.restart_and_run(&loader, args),
            LoadStrategy::HostedInline => self.run_hosted(&loader, args).await,
            LoadStrategy::InvokeDirectly => self.invoke_directly(&loader, args).await,
        }
    }

    /// Invoke our own binary again with the resolved module list in the
    /// environment, so the app gets a whole process to itself.
    fn restart_and_run(&self, loader: &ModuleLoader, args: &[String]) -> Result<(), StartError> {
        let exe = match &self.host_env.exe_path {
            Some(path) => path.clone(),
            // Not running from an installed image, probably during
            // development.
            None => std::env::current_exe()?,
        };
        let modules = std::env::join_paths(loader.module_paths()).map_err(|e| {
            StartError::BadInvocation(format!("module path not passable via environment: {e}"))
        })?;

        let mut command = Command::new(&exe);
        command
            .args(args)
            .env(env::ENV_RUN_MODULES, &modules)
            .env(env::ENV_RUN_ENTRY, loader.entry_point()?);
        if let Some(home) = dirs::home_dir() {
            command.current_dir(home);
        }
        tracing::info!("restarting to execute {}", exe.display());
        if let Some(events) = &self.events {
            events.about_to_start_app(true);
        }
        let mut child = command.spawn()?;

        let events = self.events.clone();
        std::thread::spawn(move || {
            let _ = child.wait();
            tracing::info!("sub-process finished");
            if let Some(events) = events {
                events.app_finished();
            }
        });
        Ok(())
    }

    async fn run_hosted(&self, loader: &ModuleLoader, args: &[String]) -> Result<(), StartError> {
        if let Some(events) = &self.events {
            events.about_to_start_app(false);
        }
        loader.run(self.gateway, args).await?;
        tracing::info!("inlined application finished, back to the shell");
        if let Some(events) = &self.events {
            events.app_finished();
        }
        Ok(())
    }

    async fn invoke_directly(
        &self,
        loader: &ModuleLoader,
        args: &[String],
    ) -> Result<(), StartError> {
        if let Some(events) = &self.events {
            events.about_to_start_app(false);
        }
        loader
            .run(Gateway::headless(self.host_env.version), args)
            .await?;
        tracing::info!("app entry point has returned");
        if let Some(events) = &self.events {
            events.app_finished();
        }
        Ok(())
    }
}

/// Boot straight into an already-resolved module list, as passed through
/// the environment by [`AppLauncher::restart_and_run`].
pub async fn run_from_env(host_env: &HostEnv, args: &[String]) -> Result<(), StartError> {
    let modules = host_env
        .run_modules
        .clone()
        .ok_or_else(|| StartError::BadInvocation("no module list in the environment".to_owned()))?;
    let loader = ModuleLoader::from_parts(modules, host_env.run_entry.clone(), Vec::new())?;
    loader
        .run(Gateway::headless(host_env.version), args)
        .await
}
