use std::path::PathBuf;

use thiserror::Error;

/// Why an update package failed verification. Every payload entry must be
/// signed by the one pinned key; there is no chain of trust to walk.
#[derive(Error, Debug)]
pub enum SignatureError {
    #[error("file {0} in the update package is not signed")]
    Unsigned(String),

    #[error("file {0} is not signed by the pinned update key")]
    WrongSigner(String),

    #[error("signature metadata is malformed: {0}")]
    BadMetadata(String),
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("failed to contact {url}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("control document is malformed: {0}")]
    BadControlFile(String),

    #[error("{0} is not a usable install target")]
    BadTarget(PathBuf),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error("update package is not a valid archive")]
    BadArchive(#[from] zip::result::ZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
