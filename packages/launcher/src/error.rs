use std::path::PathBuf;

use comet_fetcher::ResolutionError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StartError {
    #[error("Could not locate any way to start the app.")]
    NoEntryPoint,

    /// A cached resolution pointed at a file that is no longer there,
    /// usually because the user wiped the cache. Callers treat this as a
    /// cache miss and re-resolve rather than failing the launch.
    #[error("artifact file {0} is missing from the local cache")]
    MissingModule(PathBuf),

    #[error("failed to build an isolated loading context from: {path_list}")]
    Loader {
        path_list: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Application failed to start")]
    AppFailed(#[source] anyhow::Error),

    #[error("{0}")]
    BadInvocation(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
