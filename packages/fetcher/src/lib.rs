//! Resolution of user-typed coordinates against remote package repositories.
//!
//! The [`RepositoryClient`] speaks the repository layout (metadata, manifests,
//! payloads) over HTTP or a local directory. The [`Resolver`] wraps it with
//! the product's fallback policy: coordinate normalization, reversed-group
//! retry, branch-qualified retry for forge-hosted packages, and error
//! classification into something a person can act on.

pub mod client;
pub mod coordinate;
pub mod error;
pub mod events;
pub mod repo;
pub mod resolver;

pub use client::{PackageManifest, RepositoryClient};
pub use coordinate::Coordinate;
pub use error::ResolutionError;
pub use events::FetchEvents;
pub use repo::{RepoLocation, RepoSpec, Repository};
pub use resolver::{Resolution, Resolver};
