use url::Url;

use crate::error::UpdateError;

const LATEST_VERSION_KEY: &str = "Latest-Version-URL";

/// The control endpoint's answer: where the newest build lives. The version
/// number rides in the download file name, so a plain redirect file on a
/// static host is a complete update server.
#[derive(Debug, Clone)]
pub struct ControlManifest {
    pub version: u32,
    pub download_url: Url,
}

/// Parses the line-oriented `Key: value` control document. The link may be
/// relative; it is resolved against the URL the document came from.
pub fn parse_control(body: &str, base: &Url) -> Result<ControlManifest, UpdateError> {
    let link = body
        .lines()
        .find_map(|line| line.strip_prefix(&format!("{LATEST_VERSION_KEY}:")))
        .map(str::trim)
        .filter(|link| !link.is_empty())
        .ok_or_else(|| {
            UpdateError::BadControlFile(format!(
                "no {LATEST_VERSION_KEY} property in control document"
            ))
        })?;

    let download_url = base
        .join(link)
        .map_err(|e| UpdateError::BadControlFile(format!("bad link URL '{link}': {e}")))?;

    // We expect the link to point at a file of the form N.<platform>.update.*
    // where N is an integer.
    let file_name = download_url
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            UpdateError::BadControlFile(format!("link '{link}' does not name a file"))
        })?;
    let version = file_name
        .split('.')
        .next()
        .and_then(|lead| lead.parse::<u32>().ok())
        .ok_or_else(|| {
            UpdateError::BadControlFile(format!(
                "expected a version-numbered file name, got '{file_name}'"
            ))
        })?;

    Ok(ControlManifest {
        version,
        download_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn base() -> Url {
        Url::parse("https://update.comet.app/linux/control").unwrap()
    }

    #[test]
    fn parses_version_from_the_redirect_file_name() {
        let control = parse_control("Latest-Version-URL: /2.linux.update.zip\n", &base()).unwrap();
        assert_eq!(control.version, 2);
        assert_eq!(
            control.download_url.as_str(),
            "https://update.comet.app/2.linux.update.zip"
        );
    }

    #[test]
    fn tolerates_unrelated_lines() {
        let body = "Comment: hello\nLatest-Version-URL: /14.mac.update.zip\n";
        assert_eq!(parse_control(body, &base()).unwrap().version, 14);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_control("<html>some garbage that won't parse</html", &base()).is_err());
        assert!(parse_control("Latest-Version-URL: /not-a-version.zip", &base()).is_err());
        assert!(parse_control("Latest-Version-URL:", &base()).is_err());
    }
}
