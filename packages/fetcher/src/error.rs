use thiserror::Error;

use crate::coordinate;

/// What the resolver reports to callers. The `Display` strings here are the
/// user-facing messages; the underlying diagnostics stay in the source chain
/// and the log.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("Sorry, no package with those coordinates is known.")]
    NotFound { coordinate: String },

    /// Forge proxies answer 401 for repositories that don't exist, because
    /// they might be private ones requiring authentication.
    #[error("Sorry, no repository was found with those coordinates.")]
    Unauthorized { coordinate: String },

    #[error("Sorry, could not understand '{input}': {reason}. Use group:name syntax.")]
    Invalid { input: String, reason: String },

    #[error("network error while contacting {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{message}")]
    Other { message: String },
}

/// Repository-level failures, before the resolver has decided which of the
/// candidate coordinates to blame. Classified into [`ResolutionError`] once
/// the whole resolution plan is exhausted.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("no repository has metadata for {coordinate}")]
    MetadataNotFound { coordinate: String },

    #[error("no repository has an artifact payload for {coordinate}")]
    ArtifactNotFound { coordinate: String },

    #[error("no version of {coordinate} satisfies '{requirement}'")]
    NoMatchingVersion {
        coordinate: String,
        requirement: String,
    },

    #[error("HTTP {status} fetching {url}")]
    Status { status: u16, url: String },

    #[error("failed to fetch {url}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid repository metadata at {path}: {message}")]
    Metadata { path: String, message: String },

    #[error(transparent)]
    Invalid(#[from] ResolutionError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    fn is_not_found(&self) -> bool {
        matches!(
            self,
            FetchError::MetadataNotFound { .. }
                | FetchError::ArtifactNotFound { .. }
                | FetchError::NoMatchingVersion { .. }
                | FetchError::Status { status: 404, .. }
        )
    }
}

/// Maps the error from the *first* resolution attempt onto a user-facing
/// [`ResolutionError`]. `original_input` is what the user actually typed;
/// errors never mention reversed or otherwise rewritten coordinates.
pub(crate) fn classify(err: FetchError, original_input: &str) -> ResolutionError {
    let forge_hosted = coordinate::normalize(original_input)
        .map(|c| c.is_forge_hosted())
        .unwrap_or(false);

    match err {
        e if e.is_not_found() => ResolutionError::NotFound {
            coordinate: original_input.to_owned(),
        },
        FetchError::Status { status: 401, .. } if forge_hosted => ResolutionError::Unauthorized {
            coordinate: original_input.to_owned(),
        },
        FetchError::Transport { url, source } => ResolutionError::Network { url, source },
        FetchError::Invalid(e) => e,
        other => ResolutionError::Other {
            message: chained_message(&other),
        },
    }
}

/// Builds a coherent multi-line story out of a cause chain, dropping
/// consecutive duplicate messages.
pub fn chained_message(err: &dyn std::error::Error) -> String {
    let mut lines = Vec::new();
    let mut last = String::new();
    let mut cursor: Option<&dyn std::error::Error> = Some(err);
    while let Some(e) = cursor {
        let message = e.to_string();
        if message != last {
            last = message.clone();
            lines.push(message);
        }
        cursor = e.source();
    }
    lines.join("\n")
}
