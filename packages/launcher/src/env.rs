use std::env;
use std::path::PathBuf;

/// Base directory of the versioned install image, set by the bootstrap.
pub const ENV_INSTALL_PATH: &str = "COMET_INSTALL_PATH";
/// Path of the running executable inside the install image.
pub const ENV_EXE_PATH: &str = "COMET_EXE_PATH";
/// Integer build number of the running program.
pub const ENV_VERSION: &str = "COMET_VERSION";
/// An already-resolved module path list, set when the launcher re-execs
/// itself to run an app in a clean process. These travel as environment
/// variables rather than argv so they never leak into shell history or
/// URL-handler invocations.
pub const ENV_RUN_MODULES: &str = "COMET_RUN_MODULES";
/// Entry point name paired with [`ENV_RUN_MODULES`].
pub const ENV_RUN_ENTRY: &str = "COMET_RUN_ENTRY";

/// Environment the bootstrap (or a re-exec) handed us. Everything is
/// optional: during development none of it is set.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    pub install_path: Option<PathBuf>,
    pub exe_path: Option<PathBuf>,
    pub version: Option<i32>,
    pub run_modules: Option<Vec<PathBuf>>,
    pub run_entry: Option<String>,
}

impl HostEnv {
    pub fn from_env() -> Self {
        HostEnv {
            install_path: env::var_os(ENV_INSTALL_PATH).map(PathBuf::from),
            exe_path: env::var_os(ENV_EXE_PATH).map(PathBuf::from),
            version: env::var(ENV_VERSION).ok().and_then(|v| v.parse().ok()),
            run_modules: env::var_os(ENV_RUN_MODULES)
                .map(|v| env::split_paths(&v).collect()),
            run_entry: env::var(ENV_RUN_ENTRY).ok(),
        }
    }

    /// True when we were re-exec'd with a resolved module list and should
    /// boot straight into it instead of doing a normal resolution.
    pub fn is_direct_run(&self) -> bool {
        self.run_modules.is_some()
    }
}
