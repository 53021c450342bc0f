use std::fmt;

use crate::error::ResolutionError;

/// Group prefixes that indicate a package hosted on a source forge rather
/// than a first-class repository. These get the `:master` retry treatment
/// when no version or branch was given.
const FORGE_GROUP_PREFIXES: [&str; 3] = ["com.github.", "org.bitbucket.", "com.gitlab."];

/// Forge hosts we recognize in URL-shaped input, with the group prefix each
/// one maps to.
const FORGE_HOSTS: [(&str, &str); 3] = [
    ("github.com", "com.github"),
    ("bitbucket.org", "org.bitbucket"),
    ("gitlab.com", "com.gitlab"),
];

/// A package coordinate of the form `group:name[:version]`. Immutable once
/// parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Coordinate {
    pub group: String,
    pub name: String,
    pub version: Option<String>,
}

impl Coordinate {
    /// Parses a full `group:name[:version]` string. Use [`normalize`] for
    /// raw user input, which may be missing the name entirely.
    pub fn parse(input: &str) -> Result<Self, ResolutionError> {
        let parts: Vec<&str> = input.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(ResolutionError::Invalid {
                input: input.to_owned(),
                reason: "expected group:name[:version]".to_owned(),
            });
        }
        Ok(Coordinate {
            group: parts[0].to_owned(),
            name: parts[1].to_owned(),
            version: parts.get(2).map(|v| (*v).to_owned()),
        })
    }

    /// The `group:name` pair that identifies a package independent of version.
    pub fn versionless_key(&self) -> String {
        format!("{}:{}", self.group, self.name)
    }

    pub fn with_version(&self, version: &str) -> Coordinate {
        Coordinate {
            group: self.group.clone(),
            name: self.name.clone(),
            version: Some(version.to_owned()),
        }
    }

    /// The same coordinate with the dotted group components in reversed
    /// order, so `foo.bar.org:app` becomes `org.bar.foo:app`.
    pub fn reversed(&self) -> Coordinate {
        let mut components: Vec<&str> = self.group.split('.').collect();
        components.reverse();
        Coordinate {
            group: components.join("."),
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    pub fn is_forge_hosted(&self) -> bool {
        FORGE_GROUP_PREFIXES.iter().any(|p| self.group.starts_with(p))
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{}:{}:{}", self.group, self.name, v),
            None => write!(f, "{}:{}", self.group, self.name),
        }
    }
}

/// Turns raw user input into a coordinate. Forge URLs like
/// `github.com/acme/tool` become `com.github.acme:tool`; a bare dotted group
/// with no separator gets the group's last component as its name, so
/// `acme.tool` becomes `acme.tool:tool`.
pub fn normalize(user_input: &str) -> Result<Coordinate, ResolutionError> {
    let input = user_input.trim();
    if input.is_empty() {
        return Err(ResolutionError::Invalid {
            input: user_input.to_owned(),
            reason: "empty coordinate".to_owned(),
        });
    }

    let converted = convert_forge_url(input).unwrap_or_else(|| input.to_owned());

    if !converted.contains(':') {
        let name = converted
            .rsplit('.')
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ResolutionError::Invalid {
                input: user_input.to_owned(),
                reason: "group name has no usable components".to_owned(),
            })?
            .to_owned();
        return Ok(Coordinate {
            group: converted.clone(),
            name,
            version: None,
        });
    }

    Coordinate::parse(&converted)
}

/// Recognizes `https://github.com/user/repo` style input (scheme optional)
/// for the forge hosts we know, and rewrites it to coordinate form. Anything
/// else passes through untouched.
fn convert_forge_url(input: &str) -> Option<String> {
    let without_scheme = input
        .strip_prefix("https://")
        .or_else(|| input.strip_prefix("http://"))
        .unwrap_or(input);

    let (host, rest) = without_scheme.split_once('/')?;
    let (_, group_prefix) = FORGE_HOSTS.iter().find(|(h, _)| *h == host)?;

    let components: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    if components.len() != 2 || components.iter().any(|c| c.is_empty()) {
        return None;
    }
    let result = format!("{}.{}:{}", group_prefix, components[0], components[1]);
    tracing::info!("user input {input} parsed as forge coordinate: {result}");
    Some(result)
}
