//! Checking for and installing updates to comet itself.
//!
//! The protocol is deliberately dumb: GET a small per-platform control
//! document parameterized by our current version, follow the link it
//! contains, verify every file in the downloaded package against one pinned
//! public key, and unpack into a brand-new version-numbered directory. The
//! bootstrap picks the newest directory at startup, so an update that never
//! finishes its final rename simply doesn't exist.
//!
//! This runs unattended in the background. Nothing here is allowed to crash
//! or block foreground use; callers log failures and try again at the next
//! scheduled check.

pub mod control;
pub mod error;
pub mod package;

use std::path::Path;
use std::process::{Command, ExitStatus};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::VerifyingKey;
use futures_util::StreamExt;
use std::io::Write;
use url::Url;

pub use control::ControlManifest;
pub use error::{SignatureError, UpdateError};
pub use package::SignedPackage;

/// The release signing key baked into every build. Updates signed by
/// anything else are discarded.
const RELEASE_PUB_KEY_B64: &str = "WGZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmZmY=";

pub fn release_signing_key() -> VerifyingKey {
    let bytes = BASE64
        .decode(RELEASE_PUB_KEY_B64)
        .expect("baked-in release key is valid base64");
    let bytes: [u8; 32] = bytes
        .try_into()
        .expect("baked-in release key is 32 bytes");
    VerifyingKey::from_bytes(&bytes).expect("baked-in release key parses")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Mac,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Mac
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    /// Path segment used on the update server.
    pub fn control_segment(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Mac => "mac",
            Platform::Windows => "win",
        }
    }

    /// The binary inside an unpacked version directory that needs its
    /// execute bit flipped after unpack.
    pub fn entry_binary(self) -> Option<&'static str> {
        match self {
            Platform::Linux => Some("comet"),
            Platform::Mac => Some("Contents/MacOS/Comet"),
            Platform::Windows => None,
        }
    }

    /// Windows locks the binaries of running programs, so replacement has
    /// to be delegated to a native installer instead of unpacking ourselves.
    pub fn uses_native_installer(self) -> bool {
        self == Platform::Windows
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    UpdatedTo(u32),
    AlreadyFresh,
    InsufficientDiskSpace,
    InstallerFailed,
}

/// How subprocesses get run, injectable so tests can assert on the native
/// installer invocation without executing anything.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, command: &mut Command) -> std::io::Result<ExitStatus>;
}

struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, command: &mut Command) -> std::io::Result<ExitStatus> {
        command.status()
    }
}

pub struct UpdateChecker {
    base_url: Url,
    platform: Platform,
    signing_key: VerifyingKey,
    required_free_space_mb: u64,
    http: reqwest::Client,
    runner: Arc<dyn ProcessRunner>,
}

impl UpdateChecker {
    pub fn new(base_url: Url, signing_key: VerifyingKey) -> Self {
        UpdateChecker {
            base_url,
            platform: Platform::current(),
            signing_key,
            required_free_space_mb: 500,
            http: reqwest::Client::new(),
            runner: Arc::new(SystemRunner),
        }
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_required_free_space_mb(mut self, mb: u64) -> Self {
        self.required_free_space_mb = mb;
        self
    }

    pub fn with_process_runner(mut self, runner: Arc<dyn ProcessRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Checks the control endpoint and, when a newer build exists, installs
    /// it into a fresh version directory under `install_dir`. The current
    /// installation is never modified.
    pub async fn check_for_update(
        &self,
        current_version: u32,
        install_dir: &Path,
    ) -> Result<UpdateResult, UpdateError> {
        let control = self.fetch_control_data(current_version).await?;
        tracing::info!("latest version is {}", control.version);
        if control.version <= current_version {
            tracing::info!("we are up to date");
            return Ok(UpdateResult::AlreadyFresh);
        }

        // Preflight the disk before a single payload byte moves: a full
        // disk halfway through an unpack is the worst failure mode here.
        let temp_dir = std::env::temp_dir();
        if !self.enough_space(&temp_dir) || !self.enough_space(install_dir) {
            return Ok(UpdateResult::InsufficientDiskSpace);
        }

        let package = self.download_package(&control).await?;
        // The temp file guard deletes the downloaded package on drop,
        // whether installation worked or not.
        self.install(package.path(), control.version, install_dir)
    }

    pub async fn fetch_control_data(
        &self,
        current_version: u32,
    ) -> Result<ControlManifest, UpdateError> {
        let mut url = self
            .base_url
            .join(&format!("{}/control", self.platform.control_segment()))
            .map_err(|e| UpdateError::BadControlFile(e.to_string()))?;
        url.set_query(Some(&format!("c={current_version}")));

        tracing::info!("GET {url}");
        let response = self
            .http
            .get(url.clone())
            .header("User-Agent", format!("Comet/{current_version}"))
            .send()
            .await
            .map_err(|e| UpdateError::Transport {
                url: url.to_string(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(UpdateError::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.text().await.map_err(|e| UpdateError::Transport {
            url: url.to_string(),
            source: e,
        })?;
        tracing::info!("got control data from server, parsing");
        control::parse_control(&body, &url)
    }

    async fn download_package(
        &self,
        control: &ControlManifest,
    ) -> Result<tempfile::NamedTempFile, UpdateError> {
        let suffix = if self.platform.uses_native_installer() {
            ".update.exe"
        } else {
            ".update.zip"
        };
        let mut package = tempfile::Builder::new()
            .prefix("comet-update")
            .suffix(suffix)
            .tempfile()?;

        let url = control.download_url.clone();
        tracing::info!("GET {url}");
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| UpdateError::Transport {
                url: url.to_string(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(UpdateError::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| UpdateError::Transport {
                url: url.to_string(),
                source: e,
            })?;
            package.as_file_mut().write_all(&chunk)?;
        }
        tracing::info!("saved update package to {}", package.path().display());
        Ok(package)
    }

    fn install(
        &self,
        package: &Path,
        version: u32,
        install_dir: &Path,
    ) -> Result<UpdateResult, UpdateError> {
        if self.platform.uses_native_installer() {
            let mut command = Command::new(package);
            command
                .arg("/VERYSILENT")
                .arg(format!("/DIR=\"{}\"", install_dir.display()))
                .arg("/NORESTART")
                .arg("/NOICONS")
                .arg("/SUPPRESSMSGBOXES");
            let status = self.runner.run(&mut command)?;
            if !status.success() {
                tracing::error!("native installer exited with {status}");
                return Ok(UpdateResult::InstallerFailed);
            }
            return Ok(UpdateResult::UpdatedTo(version));
        }

        let target = install_dir.join(version.to_string());
        tracing::info!("unpacking to {}", target.display());
        SignedPackage::new(package.to_path_buf(), self.signing_key)
            .install(&target, self.platform)?;
        Ok(UpdateResult::UpdatedTo(version))
    }

    fn enough_space(&self, path: &Path) -> bool {
        match available_space_mb(path) {
            Some(mb) if mb < self.required_free_space_mb => {
                tracing::warn!(
                    "only {mb} MB free at {}, need {} MB, skipping update",
                    path.display(),
                    self.required_free_space_mb
                );
                false
            }
            // When we can't tell, proceed; the unpack will fail loudly if
            // the disk really is full.
            _ => true,
        }
    }
}

fn available_space_mb(path: &Path) -> Option<u64> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = sysinfo::Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / (1024 * 1024))
}
