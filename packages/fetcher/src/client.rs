use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use semver::Version;
use serde::Deserialize;

use crate::coordinate::Coordinate;
use crate::error::FetchError;
use crate::events::FetchEvents;
use crate::repo::{RepoLocation, Repository};

/// Per-version package manifest, the repository's equivalent of packaging
/// metadata. All fields are optional so a bare payload still resolves.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageManifest {
    pub name: Option<String>,
    pub description: Option<String>,
    /// Export the launcher should invoke, when the package declares one.
    pub entry: Option<String>,
    #[serde(default)]
    pub features: Vec<String>,
    /// `"group:name" = "<version requirement>"`.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct VersionList {
    #[serde(default)]
    versions: Vec<String>,
}

/// Talks to the configured repositories in order, downloading metadata,
/// manifests and payloads. Downloaded payloads are cached on disk in the
/// repository layout; metadata is always fetched fresh because the caller
/// (the history store) does its own freshness tracking on top of us.
pub struct RepositoryClient {
    cache_dir: PathBuf,
    repos: Vec<Repository>,
    http: reqwest::Client,
    events: Option<Arc<dyn FetchEvents>>,
    offline: bool,
    started: AtomicBool,
    total_bytes: AtomicU64,
    downloaded: AtomicU64,
}

impl RepositoryClient {
    pub fn new(
        cache_dir: PathBuf,
        repos: Vec<Repository>,
        events: Option<Arc<dyn FetchEvents>>,
        offline: bool,
    ) -> Result<Self, FetchError> {
        fs::create_dir_all(&cache_dir)?;
        Ok(RepositoryClient {
            cache_dir,
            repos,
            http: reqwest::Client::new(),
            events,
            offline,
            started: AtomicBool::new(false),
            total_bytes: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
        })
    }

    /// Highest published version of the package, by semantic version order.
    /// Entries that don't parse as semver (branch names and the like) are
    /// skipped; they can still be requested as an explicit version.
    pub async fn latest_version(&self, coordinate: &Coordinate) -> Result<String, FetchError> {
        let versions = self.list_versions(coordinate).await?;
        let best = versions
            .iter()
            .filter_map(|v| match Version::parse(v) {
                Ok(parsed) => Some((parsed, v)),
                Err(_) => {
                    tracing::debug!("ignoring non-semantic version '{v}' of {coordinate}");
                    None
                }
            })
            .max_by(|(a, _), (b, _)| a.cmp(b));
        match best {
            Some((_, raw)) => {
                tracing::info!("latest version of {coordinate} is {raw}");
                Ok(raw.clone())
            }
            None => Err(FetchError::NoMatchingVersion {
                coordinate: coordinate.versionless_key(),
                requirement: "*".to_owned(),
            }),
        }
    }

    /// Highest published version satisfying a requirement string. A
    /// requirement that isn't parseable as a semver range is treated as an
    /// exact version (or branch) name.
    pub async fn highest_matching(
        &self,
        coordinate: &Coordinate,
        requirement: &str,
    ) -> Result<String, FetchError> {
        let versions = self.list_versions(coordinate).await?;
        if let Ok(req) = semver::VersionReq::parse(requirement) {
            let best = versions
                .iter()
                .filter_map(|v| Version::parse(v).ok().map(|parsed| (parsed, v)))
                .filter(|(parsed, _)| req.matches(parsed))
                .max_by(|(a, _), (b, _)| a.cmp(b));
            if let Some((_, raw)) = best {
                return Ok(raw.clone());
            }
        } else if versions.iter().any(|v| v == requirement) {
            return Ok(requirement.to_owned());
        }
        Err(FetchError::NoMatchingVersion {
            coordinate: coordinate.versionless_key(),
            requirement: requirement.to_owned(),
        })
    }

    async fn list_versions(&self, coordinate: &Coordinate) -> Result<Vec<String>, FetchError> {
        let rel = format!("{}/metadata.toml", package_dir(coordinate));
        for repo in &self.repos {
            if let Some(text) = self.fetch_text(repo, &rel).await? {
                let list: VersionList =
                    toml::from_str(&text).map_err(|e| FetchError::Metadata {
                        path: rel.clone(),
                        message: e.to_string(),
                    })?;
                return Ok(list.versions);
            }
        }
        Err(FetchError::MetadataNotFound {
            coordinate: coordinate.versionless_key(),
        })
    }

    /// The package manifest for a concrete version. A version directory
    /// without one is tolerated and yields an empty manifest.
    pub async fn manifest(&self, coordinate: &Coordinate) -> Result<PackageManifest, FetchError> {
        let version = expect_version(coordinate);
        let rel = format!("{}/{}/manifest.toml", package_dir(coordinate), version);
        for repo in &self.repos {
            if let Some(text) = self.fetch_text(repo, &rel).await? {
                return toml::from_str(&text).map_err(|e| FetchError::Metadata {
                    path: rel.clone(),
                    message: e.to_string(),
                });
            }
        }
        tracing::warn!("{coordinate} has no manifest, treating as a bare payload");
        Ok(PackageManifest::default())
    }

    /// Downloads the payload into the artifact cache and returns its local
    /// path. A payload already in the cache is reused without touching the
    /// network, except that always-refresh repositories are checked first
    /// and win unconditionally.
    pub async fn fetch_payload(&self, coordinate: &Coordinate) -> Result<PathBuf, FetchError> {
        let rel = payload_rel(coordinate);
        let dest = self.cache_dir.join(&rel);

        for repo in self.repos.iter().filter(|r| r.always_refresh) {
            if let RepoLocation::Dir(root) = &repo.location {
                let src = root.join(&rel);
                if src.exists() {
                    tracing::info!("fetching {coordinate} from {} (always refreshed)", repo.id);
                    copy_into_cache(&src, &dest)?;
                    return Ok(dest);
                }
            }
        }

        if dest.exists() {
            tracing::debug!("artifact cache hit for {coordinate}");
            return Ok(dest);
        }

        for repo in &self.repos {
            if self.download_from(repo, &rel, &dest).await? {
                return Ok(dest);
            }
        }
        Err(FetchError::ArtifactNotFound {
            coordinate: coordinate.to_string(),
        })
    }

    async fn download_from(
        &self,
        repo: &Repository,
        rel: &str,
        dest: &Path,
    ) -> Result<bool, FetchError> {
        match &repo.location {
            RepoLocation::Dir(root) => {
                let src = root.join(rel);
                if !src.exists() {
                    return Ok(false);
                }
                copy_into_cache(&src, dest)?;
                Ok(true)
            }
            RepoLocation::Http(base) => {
                if self.offline {
                    return Ok(false);
                }
                let url = join_url(base, rel)?;
                tracing::info!("GET {url}");
                let response = self
                    .http
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| FetchError::Transport {
                        url: url.to_string(),
                        source: e,
                    })?;
                if response.status().as_u16() == 404 {
                    return Ok(false);
                }
                if !response.status().is_success() {
                    return Err(FetchError::Status {
                        status: response.status().as_u16(),
                        url: url.to_string(),
                    });
                }

                let file_name = rel.rsplit('/').next().unwrap_or(rel).to_owned();
                self.note_transfer_started(&file_name, response.content_length().unwrap_or(0));

                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                // Stream through a .part file so an aborted transfer can
                // never be mistaken for a cached artifact.
                let part = dest.with_extension("part");
                let mut out = fs::File::create(&part)?;
                let mut stream = response.bytes_stream();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| FetchError::Transport {
                        url: url.to_string(),
                        source: e,
                    })?;
                    out.write_all(&chunk)?;
                    self.note_progress(&file_name, chunk.len() as u64);
                }
                drop(out);
                fs::rename(&part, dest)?;
                Ok(true)
            }
        }
    }

    async fn fetch_text(&self, repo: &Repository, rel: &str) -> Result<Option<String>, FetchError> {
        match &repo.location {
            RepoLocation::Dir(root) => {
                let path = root.join(rel);
                match fs::read_to_string(&path) {
                    Ok(text) => Ok(Some(text)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e.into()),
                }
            }
            RepoLocation::Http(base) => {
                if self.offline {
                    return Ok(None);
                }
                let url = join_url(base, rel)?;
                tracing::debug!("GET {url}");
                let response = self
                    .http
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| FetchError::Transport {
                        url: url.to_string(),
                        source: e,
                    })?;
                match response.status().as_u16() {
                    404 => Ok(None),
                    s if (200..300).contains(&s) => {
                        let text = response.text().await.map_err(|e| FetchError::Transport {
                            url: url.to_string(),
                            source: e,
                        })?;
                        Ok(Some(text))
                    }
                    s => Err(FetchError::Status {
                        status: s,
                        url: url.to_string(),
                    }),
                }
            }
        }
    }

    fn note_transfer_started(&self, name: &str, content_length: u64) {
        self.total_bytes.fetch_add(content_length, Ordering::Relaxed);
        if !self.started.swap(true, Ordering::Relaxed) {
            if let Some(events) = &self.events {
                events.on_started_downloading(name);
            }
        }
    }

    fn note_progress(&self, name: &str, delta: u64) {
        let downloaded = self.downloaded.fetch_add(delta, Ordering::Relaxed) + delta;
        if let Some(events) = &self.events {
            events.on_fetch(name, self.total_bytes.load(Ordering::Relaxed), downloaded);
        }
    }

    /// Fires `on_stopped_downloading` if any downloads happened since the
    /// last call, whether or not they succeeded.
    pub fn finish_events(&self) {
        if self.started.swap(false, Ordering::Relaxed) {
            if let Some(events) = &self.events {
                events.on_stopped_downloading();
            }
        }
    }
}

fn package_dir(coordinate: &Coordinate) -> String {
    format!("{}/{}", coordinate.group.replace('.', "/"), coordinate.name)
}

fn payload_rel(coordinate: &Coordinate) -> String {
    let version = expect_version(coordinate);
    format!(
        "{}/{}/{}-{}.wasm",
        package_dir(coordinate),
        version,
        coordinate.name,
        version
    )
}

fn expect_version(coordinate: &Coordinate) -> &str {
    coordinate
        .version
        .as_deref()
        .expect("coordinate was pinned to a version before fetching")
}

fn copy_into_cache(src: &Path, dest: &Path) -> Result<(), FetchError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(src, dest)?;
    Ok(())
}

fn join_url(base: &url::Url, rel: &str) -> Result<url::Url, FetchError> {
    base.join(rel).map_err(|e| FetchError::Metadata {
        path: rel.to_owned(),
        message: e.to_string(),
    })
}
