use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use semver::Version;

use crate::client::{PackageManifest, RepositoryClient};
use crate::coordinate::{self, Coordinate};
use crate::error::{classify, FetchError, ResolutionError};

/// The result of resolving a user-typed coordinate: the pinned coordinate,
/// display metadata from the package manifest, and the flat transitive
/// closure of module paths (the package's own payload first).
#[derive(Debug, Clone)]
pub struct Resolution {
    pub coordinate: Coordinate,
    pub name: String,
    pub description: Option<String>,
    pub entry: Option<String>,
    pub features: Vec<String>,
    pub module_paths: Vec<PathBuf>,
    pub refresh_time: DateTime<Utc>,
}

/// Wraps the repository client with the product's fallback policy. The
/// sequence of coordinates we are willing to try is computed up front by
/// [`resolution_plan`] so the policy is data, not control flow.
pub struct Resolver {
    client: RepositoryClient,
}

impl Resolver {
    pub fn new(client: RepositoryClient) -> Self {
        Resolver { client }
    }

    pub fn client(&self) -> &RepositoryClient {
        &self.client
    }

    /// Resolves and downloads the user's input and its transitive closure.
    /// On total failure the error describes the *first* attempt only:
    /// reversed coordinates are an internal trick and would confuse anyone
    /// seeing them in a message.
    pub async fn download(&self, user_input: &str) -> Result<Resolution, ResolutionError> {
        let plan = resolution_plan(user_input)?;
        let mut first_error: Option<FetchError> = None;
        for candidate in &plan {
            tracing::info!("attempting fetch for {candidate}");
            match self.resolve_candidate(candidate).await {
                Ok(resolution) => {
                    self.client.finish_events();
                    return Ok(resolution);
                }
                Err(e) => {
                    tracing::info!("candidate {candidate} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        self.client.finish_events();
        let err = first_error.unwrap_or(FetchError::MetadataNotFound {
            coordinate: user_input.to_owned(),
        });
        Err(classify(err, user_input))
    }

    /// Resolves one concrete candidate: pin the version, walk the dependency
    /// graph with highest-version-wins conflict resolution, then download
    /// every selected payload.
    async fn resolve_candidate(&self, candidate: &Coordinate) -> Result<Resolution, FetchError> {
        let root = match &candidate.version {
            Some(_) => candidate.clone(),
            None => {
                let latest = self.client.latest_version(candidate).await?;
                candidate.with_version(&latest)
            }
        };
        tracing::info!("request to download and build module closure for {root}");

        let mut selected: HashMap<String, Coordinate> = HashMap::new();
        let mut manifests: HashMap<String, PackageManifest> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut queue: VecDeque<Coordinate> = VecDeque::new();
        queue.push_back(root.clone());

        while let Some(current) = queue.pop_front() {
            let key = current.versionless_key();
            match selected.get(&key) {
                Some(existing) if !version_newer(&current, existing) => continue,
                Some(existing) => {
                    // Conflicting versions in the graph. We always pick the
                    // newest rather than the one nearest the root: graphs
                    // like this are inherently unstable and newest-wins is
                    // at least predictable.
                    tracing::warn!(
                        "resolving conflict for {key} between {:?} and {:?}",
                        existing.version,
                        current.version
                    );
                }
                None => order.push(key.clone()),
            }

            let manifest = self.client.manifest(&current).await?;
            for (dep_key, requirement) in &manifest.dependencies {
                let dep = Coordinate::parse(dep_key).map_err(FetchError::Invalid)?;
                let version = self.client.highest_matching(&dep, requirement).await?;
                queue.push_back(dep.with_version(&version));
            }
            manifests.insert(key.clone(), manifest);
            selected.insert(key, current);
        }

        let mut module_paths = Vec::with_capacity(order.len());
        for key in &order {
            let coordinate = &selected[key];
            module_paths.push(self.client.fetch_payload(coordinate).await?);
        }

        let root_manifest = manifests.remove(&root.versionless_key()).unwrap_or_default();
        Ok(Resolution {
            name: root_manifest.name.unwrap_or_else(|| root.name.clone()),
            description: root_manifest.description,
            entry: root_manifest.entry,
            features: root_manifest.features,
            coordinate: root,
            module_paths,
            refresh_time: Utc::now(),
        })
    }
}

/// The ordered list of coordinates to try for a given user input: the
/// normalized form, then (for version-less forge-hosted packages) the same
/// with a `master` branch qualifier, then the group-reversed variants of
/// both. Reversal lets a human-friendly domain-like input resolve against
/// coordinate-first repositories.
pub fn resolution_plan(user_input: &str) -> Result<Vec<Coordinate>, ResolutionError> {
    let normalized = coordinate::normalize(user_input)?;
    let mut plan = Vec::with_capacity(4);
    push_with_branch_fallback(&mut plan, normalized.clone());
    let reversed = normalized.reversed();
    if reversed.group != normalized.group {
        push_with_branch_fallback(&mut plan, reversed);
    }
    Ok(plan)
}

fn push_with_branch_fallback(plan: &mut Vec<Coordinate>, candidate: Coordinate) {
    let wants_fallback = candidate.is_forge_hosted() && candidate.version.is_none();
    plan.push(candidate.clone());
    if wants_fallback {
        // Forge proxies serve repositories with no releases under their
        // default branch name, so a bare com.github.user:repo input gets
        // one more try as repo:master.
        plan.push(candidate.with_version("master"));
    }
}

/// Whether `a` carries a strictly newer version than `b`, by semantic
/// ordering. Non-semantic versions never displace an existing selection.
fn version_newer(a: &Coordinate, b: &Coordinate) -> bool {
    match (
        a.version.as_deref().and_then(|v| Version::parse(v).ok()),
        b.version.as_deref().and_then(|v| Version::parse(v).ok()),
    ) {
        (Some(a), Some(b)) => a > b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plan_strings(input: &str) -> Vec<String> {
        resolution_plan(input)
            .unwrap()
            .iter()
            .map(|c| c.to_string())
            .collect()
    }

    #[test]
    fn plain_coordinate_gets_reversed_fallback_only() {
        assert_eq!(
            plan_strings("foo.bar.org:app"),
            vec!["foo.bar.org:app", "org.bar.foo:app"]
        );
    }

    #[test]
    fn forge_coordinate_gets_branch_fallback_before_reversal() {
        assert_eq!(
            plan_strings("com.github.acme:tool"),
            vec![
                "com.github.acme:tool",
                "com.github.acme:tool:master",
                "acme.github.com:tool"
            ]
        );
    }

    #[test]
    fn explicit_version_suppresses_branch_fallback() {
        assert_eq!(
            plan_strings("com.github.acme:tool:1.0.0"),
            vec!["com.github.acme:tool:1.0.0", "acme.github.com:tool:1.0.0"]
        );
    }

    #[test]
    fn palindromic_group_is_not_retried() {
        assert_eq!(plan_strings("solo:app"), vec!["solo:app"]);
    }

    #[test]
    fn newest_version_wins() {
        let a = Coordinate::parse("g:n:2.0.0").unwrap();
        let b = Coordinate::parse("g:n:1.9.9").unwrap();
        assert!(version_newer(&a, &b));
        assert!(!version_newer(&b, &a));

        // Branch names never displace a concrete selection.
        let branch = Coordinate::parse("g:n:master").unwrap();
        assert!(!version_newer(&branch, &b));
    }
}
