use std::path::PathBuf;

use comet_fetcher::Resolution;
use wasmtime::component::{Component, Linker, ResourceTable};
use wasmtime::{Config, Engine, Store};
use wasmtime_wasi::{WasiCtx, WasiCtxBuilder, WasiView};

use crate::error::StartError;

/// The one import a hosted app may satisfy from the shell. Always resolved
/// against our own definitions; a copy of the API bundled into the artifact
/// can never shadow it, because the linker is the only name source a
/// component has.
pub const HOST_INTERFACE: &str = "comet:api/host";

/// The export we recognize as an application entry point when the package
/// manifest doesn't declare one.
const APP_ENTRY_EXPORT: &str = "run";

/// Manifest feature that opts a component into in-process hosting without
/// importing the host interface.
const INLINE_FEATURE: &str = "inline";

pub mod bindings {
    use wasmtime::component::bindgen;
    bindgen!({
        path: "wit/app.wit",
        world: "app",
        async: true,
    });
}

/// What the shell exposes through `comet:api/host`.
#[derive(Debug, Clone, Copy)]
pub struct Gateway {
    pub version: i32,
    pub width: u32,
    pub height: u32,
}

impl Gateway {
    /// Gateway for contexts with no attached screen (CLI, re-exec'd runs).
    pub fn headless(version: Option<i32>) -> Self {
        Gateway {
            version: version.unwrap_or(-1),
            width: 0,
            height: 0,
        }
    }
}

pub struct HostState {
    ctx: WasiCtx,
    table: ResourceTable,
    gateway: Gateway,
}

impl HostState {
    fn new(gateway: Gateway) -> Self {
        let ctx = WasiCtxBuilder::new().inherit_stdio().build();
        HostState {
            ctx,
            table: ResourceTable::new(),
            gateway,
        }
    }
}

impl WasiView for HostState {
    fn ctx(&mut self) -> &mut WasiCtx {
        &mut self.ctx
    }

    fn table(&mut self) -> &mut ResourceTable {
        &mut self.table
    }
}

#[async_trait::async_trait]
impl bindings::comet::api::host::Host for HostState {
    async fn version(&mut self) -> i32 {
        self.gateway.version
    }

    async fn width(&mut self) -> u32 {
        self.gateway.width
    }

    async fn height(&mut self) -> u32 {
        self.gateway.height
    }
}

/// An isolated loading context built from a resolved artifact's module
/// paths. The root payload is compiled eagerly; instantiation happens per
/// run with a linker that knows only WASI and [`HOST_INTERFACE`].
pub struct ModuleLoader {
    engine: Engine,
    component: Component,
    module_paths: Vec<PathBuf>,
    declared_entry: Option<String>,
    features: Vec<String>,
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("module_paths", &self.module_paths)
            .field("declared_entry", &self.declared_entry)
            .field("features", &self.features)
            .finish_non_exhaustive()
    }
}

impl ModuleLoader {
    pub fn for_resolution(resolution: &Resolution) -> Result<Self, StartError> {
        Self::from_parts(
            resolution.module_paths.clone(),
            resolution.entry.clone(),
            resolution.features.clone(),
        )
    }

    pub fn from_parts(
        module_paths: Vec<PathBuf>,
        declared_entry: Option<String>,
        features: Vec<String>,
    ) -> Result<Self, StartError> {
        if module_paths.is_empty() {
            return Err(StartError::BadInvocation(
                "resolved artifact has an empty module list".to_owned(),
            ));
        }
        for path in &module_paths {
            if !path.exists() {
                return Err(StartError::MissingModule(path.clone()));
            }
        }

        let mut config = Config::new();
        config.wasm_component_model(true);
        config.async_support(true);
        let path_list = join_for_display(&module_paths);

        let engine = Engine::new(&config).map_err(|e| StartError::Loader {
            path_list: path_list.clone(),
            source: e,
        })?;
        let component =
            Component::from_file(&engine, &module_paths[0]).map_err(|e| StartError::Loader {
                path_list: path_list.clone(),
                source: e,
            })?;

        Ok(ModuleLoader {
            engine,
            component,
            module_paths,
            declared_entry,
            features,
        })
    }

    pub fn module_paths(&self) -> &[PathBuf] {
        &self.module_paths
    }

    /// Prefers the entry point declared in packaging metadata, otherwise
    /// scans the root component's exports for one we recognize.
    pub fn entry_point(&self) -> Result<String, StartError> {
        pick_entry(self.declared_entry.as_deref(), &self.export_names())
    }

    pub fn inline_capable(&self) -> bool {
        if self.features.iter().any(|f| f == INLINE_FEATURE) {
            return true;
        }
        self.component
            .component_type()
            .imports(&self.engine)
            .any(|(name, _)| name == HOST_INTERFACE)
    }

    fn export_names(&self) -> Vec<String> {
        self.component
            .component_type()
            .exports(&self.engine)
            .map(|(name, _)| name.to_owned())
            .collect()
    }

    /// Instantiates the component in a fresh store and invokes its entry
    /// point, blocking until the app returns.
    pub async fn run(&self, gateway: Gateway, args: &[String]) -> Result<(), StartError> {
        let entry = self.entry_point()?;
        if entry != APP_ENTRY_EXPORT {
            // The manifest named an export we have no calling convention
            // for; nothing sensible we can do with it in-process.
            tracing::warn!("declared entry point '{entry}' is not invokable");
            return Err(StartError::NoEntryPoint);
        }

        let loader_err = |e: anyhow::Error| StartError::Loader {
            path_list: join_for_display(&self.module_paths),
            source: e,
        };

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        wasmtime_wasi::add_to_linker_async(&mut linker).map_err(loader_err)?;
        bindings::App::add_to_linker(&mut linker, |state: &mut HostState| state)
            .map_err(loader_err)?;

        let mut store = Store::new(&self.engine, HostState::new(gateway));
        let app = bindings::App::instantiate_async(&mut store, &self.component, &linker)
            .await
            .map_err(loader_err)?;

        match app.call_run(&mut store, args).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(StartError::AppFailed(anyhow::anyhow!(message))),
            Err(e) => Err(StartError::AppFailed(e)),
        }
    }
}

fn join_for_display(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn pick_entry(declared: Option<&str>, exports: &[String]) -> Result<String, StartError> {
    if let Some(declared) = declared {
        if exports.iter().any(|e| e == declared) {
            return Ok(declared.to_owned());
        }
        tracing::warn!("declared entry point '{declared}' not found among exports");
        return Err(StartError::NoEntryPoint);
    }
    if exports.iter().any(|e| e == APP_ENTRY_EXPORT) {
        return Ok(APP_ENTRY_EXPORT.to_owned());
    }
    Err(StartError::NoEntryPoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declared_entry_wins_when_present() {
        let exports = vec!["run".to_owned(), "setup".to_owned()];
        assert_eq!(pick_entry(Some("setup"), &exports).unwrap(), "setup");
    }

    #[test]
    fn missing_declared_entry_is_fatal() {
        let exports = vec!["run".to_owned()];
        assert!(matches!(
            pick_entry(Some("start"), &exports),
            Err(StartError::NoEntryPoint)
        ));
    }

    #[test]
    fn falls_back_to_the_recognized_app_export() {
        let exports = vec!["other".to_owned(), "run".to_owned()];
        assert_eq!(pick_entry(None, &exports).unwrap(), "run");
    }

    #[test]
    fn no_usable_export_is_fatal() {
        assert!(matches!(
            pick_entry(None, &["other".to_owned()]),
            Err(StartError::NoEntryPoint)
        ));
    }

    #[test]
    fn loader_reports_the_first_missing_module() {
        let tmp = tempfile::tempdir().unwrap();
        let present = tmp.path().join("present.wasm");
        std::fs::write(&present, b"not really wasm").unwrap();
        let missing = tmp.path().join("missing.wasm");

        let err =
            ModuleLoader::from_parts(vec![present, missing.clone()], None, Vec::new()).unwrap_err();
        match err {
            StartError::MissingModule(p) => assert_eq!(p, missing),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn garbage_payload_fails_context_construction() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.wasm");
        std::fs::write(&path, b"mostly harmless").unwrap();

        let err = ModuleLoader::from_parts(vec![path], None, Vec::new()).unwrap_err();
        assert!(matches!(err, StartError::Loader { .. }));
    }
}
