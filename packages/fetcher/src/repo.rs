use std::path::PathBuf;

use url::Url;

use crate::error::ResolutionError;

/// Built-in repository aliases. The protocol prefix is attached when the
/// spec is resolved, so `--disable-ssl` can downgrade everything at once.
const ALIASES: [(&str, &str); 2] = [
    ("central", "://pkg.cometapps.io/central/"),
    ("forgepack", "://forgepack.io/"),
];

/// Name of the local deployment repository developers can publish into for
/// rapid iteration. Packages placed there are always re-fetched, bypassing
/// the artifact cache.
const DEV_LOCAL: &str = "dev-local";

/// A comma separated list of either repository aliases, or URLs to
/// repositories, resolvable to a set of configured [`Repository`] values in
/// search order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub spec: String,
    pub disable_ssl: bool,
}

#[derive(Debug, Clone)]
pub enum RepoLocation {
    Http(Url),
    Dir(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Repository {
    pub id: String,
    pub location: RepoLocation,
    /// Fetches from this repository bypass the local artifact cache.
    pub always_refresh: bool,
}

impl RepoSpec {
    pub fn new(spec: impl Into<String>, disable_ssl: bool) -> Self {
        RepoSpec {
            spec: spec.into(),
            disable_ssl,
        }
    }

    /// The default spec: every alias plus the dev-local repository.
    pub fn default_spec() -> String {
        let mut names: Vec<&str> = ALIASES.iter().map(|(name, _)| *name).collect();
        names.push(DEV_LOCAL);
        names.join(",")
    }

    pub fn resolve(&self) -> Result<Vec<Repository>, ResolutionError> {
        if self.spec.trim().is_empty() {
            return Err(self.invalid("empty"));
        }
        let protocol = if self.disable_ssl { "http" } else { "https" };

        let mut repos = Vec::new();
        let mut want_dev_local = false;
        for unit in self.spec.split(',').map(str::trim) {
            if unit == DEV_LOCAL {
                // Appended last so real repositories keep their search order.
                want_dev_local = true;
                continue;
            }
            if let Some((_, suffix)) = ALIASES.iter().find(|(name, _)| *name == unit) {
                let url = Url::parse(&format!("{protocol}{suffix}"))
                    .map_err(|e| self.invalid(&e.to_string()))?;
                repos.push(Repository {
                    id: unit.to_owned(),
                    location: RepoLocation::Http(url),
                    always_refresh: false,
                });
                continue;
            }
            repos.push(self.parse_url_unit(unit)?);
        }

        if want_dev_local {
            if let Some(home) = dirs::home_dir() {
                repos.push(Repository {
                    id: DEV_LOCAL.to_owned(),
                    location: RepoLocation::Dir(home.join(".comet").join(DEV_LOCAL)),
                    always_refresh: true,
                });
            }
        }
        Ok(repos)
    }

    fn parse_url_unit(&self, unit: &str) -> Result<Repository, ResolutionError> {
        let input = if self.disable_ssl && unit.starts_with("https://") {
            unit.replacen("https://", "http://", 1)
        } else {
            unit.to_owned()
        };
        let mut url = Url::parse(&input).map_err(|e| self.invalid(&e.to_string()))?;
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| self.invalid("file URL has no usable path"))?;
            return Ok(Repository {
                id: unit.to_owned(),
                location: RepoLocation::Dir(path),
                always_refresh: false,
            });
        }
        // Directory-style joins below need the trailing slash.
        if !url.path().ends_with('/') {
            url.set_path(&format!("{}/", url.path()));
        }
        let id = url.host_str().unwrap_or(unit).to_owned();
        Ok(Repository {
            id,
            location: RepoLocation::Http(url),
            always_refresh: false,
        })
    }

    fn invalid(&self, reason: &str) -> ResolutionError {
        ResolutionError::Invalid {
            input: self.spec.clone(),
            reason: format!("repository spec could not be parsed: {reason}"),
        }
    }
}
