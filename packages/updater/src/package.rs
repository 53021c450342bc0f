use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{SignatureError, UpdateError};
use crate::Platform;

/// Entries under this prefix are signing metadata, not payload: they are
/// neither unpacked nor required to be signed themselves.
const META_PREFIX: &str = "meta/";
const SIGNATURE_FILE: &str = "meta/signatures.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct SignatureManifest {
    /// Entry path -> base64 ed25519 signature over the entry's SHA-256.
    #[serde(default)]
    files: BTreeMap<String, String>,
}

/// A signed zip containing the contents of one versioned install directory.
///
/// The package deliberately does not contain a whole install tree with the
/// bootstrapper in it: those files are locked while we run on some
/// platforms, and unpacking into a brand-new version directory sidesteps
/// the problem entirely. The caller must therefore already know which
/// version number the package represents.
pub struct SignedPackage {
    path: PathBuf,
    signing_key: VerifyingKey,
}

impl SignedPackage {
    pub fn new(path: PathBuf, signing_key: VerifyingKey) -> Self {
        SignedPackage { path, signing_key }
    }

    /// Packs `content_dir` into a signed update package at `path`. This is
    /// what the release tooling (and the tests) use to produce updates.
    pub fn create(
        path: &Path,
        content_dir: &Path,
        signing_key: &SigningKey,
    ) -> Result<(), UpdateError> {
        let file = fs::File::create(path)?;
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        let mut manifest = SignatureManifest::default();

        for entry in walkdir::WalkDir::new(content_dir).min_depth(1) {
            let entry = entry.map_err(|e| UpdateError::Io(e.into()))?;
            let rel = entry
                .path()
                .strip_prefix(content_dir)
                .map_err(|_| UpdateError::BadTarget(entry.path().to_path_buf()))?;
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if entry.file_type().is_dir() {
                zip.add_directory(format!("{name}/"), options)?;
                continue;
            }
            let bytes = fs::read(entry.path())?;
            let signature = signing_key.sign(&Sha256::digest(&bytes));
            manifest
                .files
                .insert(name.clone(), BASE64.encode(signature.to_bytes()));
            zip.start_file(name, options)?;
            zip.write_all(&bytes)?;
        }

        let encoded = toml::to_string(&manifest)
            .map_err(|e| SignatureError::BadMetadata(e.to_string()))?;
        zip.start_file(SIGNATURE_FILE, options)?;
        zip.write_all(encoded.as_bytes())?;
        zip.finish()?;
        Ok(())
    }

    /// Verifies and unpacks the package into `target_install_dir`,
    /// atomically: everything lands in a sibling temporary directory first
    /// and is renamed into place only once every entry has checked out. On
    /// any failure the existing installation is untouched and the partial
    /// unpack is discarded.
    pub fn install(
        &self,
        target_install_dir: &Path,
        platform: Platform,
    ) -> Result<(), UpdateError> {
        let parent = target_install_dir
            .parent()
            .ok_or_else(|| UpdateError::BadTarget(target_install_dir.to_path_buf()))?;
        let dir_name = target_install_dir
            .file_name()
            .ok_or_else(|| UpdateError::BadTarget(target_install_dir.to_path_buf()))?;
        let tmp_target = parent.join(format!("tmp.{}", dir_name.to_string_lossy()));
        if tmp_target.exists() {
            fs::remove_dir_all(&tmp_target)?;
        }
        fs::create_dir_all(&tmp_target)?;

        let result = self
            .unpack_and_verify(&tmp_target)
            .and_then(|()| {
                if let Some(binary) = platform.entry_binary() {
                    set_execute_bit(&tmp_target.join(binary))?;
                }
                Ok(())
            })
            .and_then(|()| {
                fs::rename(&tmp_target, target_install_dir)?;
                Ok(())
            });

        if tmp_target.exists() {
            let _ = fs::remove_dir_all(&tmp_target);
        }
        result
    }

    fn unpack_and_verify(&self, dest: &Path) -> Result<(), UpdateError> {
        let file = fs::File::open(&self.path)?;
        let mut archive = zip::ZipArchive::new(file)?;
        let signatures = read_signature_manifest(&mut archive)?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let name = entry.name().to_owned();
            let rel = entry.enclosed_name().ok_or_else(|| {
                SignatureError::BadMetadata(format!("entry path escapes the archive: {name}"))
            })?;
            if entry.is_dir() {
                fs::create_dir_all(dest.join(&rel))?;
                continue;
            }
            if name.starts_with(META_PREFIX) {
                continue;
            }

            let mut bytes = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut bytes)?;
            verify_entry(&self.signing_key, &signatures, &name, &bytes)?;

            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, &bytes)?;
        }
        Ok(())
    }
}

fn read_signature_manifest(
    archive: &mut zip::ZipArchive<fs::File>,
) -> Result<SignatureManifest, UpdateError> {
    let mut entry = archive.by_name(SIGNATURE_FILE).map_err(|_| {
        SignatureError::BadMetadata(format!("package has no {SIGNATURE_FILE}"))
    })?;
    let mut contents = String::new();
    entry.read_to_string(&mut contents)?;
    let manifest = toml::from_str(&contents)
        .map_err(|e| SignatureError::BadMetadata(format!("unreadable signature manifest: {e}")))?;
    Ok(manifest)
}

fn verify_entry(
    key: &VerifyingKey,
    manifest: &SignatureManifest,
    name: &str,
    bytes: &[u8],
) -> Result<(), SignatureError> {
    let signature_b64 = manifest
        .files
        .get(name)
        .ok_or_else(|| SignatureError::Unsigned(name.to_owned()))?;
    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|e| SignatureError::BadMetadata(format!("signature for {name}: {e}")))?;
    let signature = Signature::from_slice(&signature_bytes)
        .map_err(|e| SignatureError::BadMetadata(format!("signature for {name}: {e}")))?;
    key.verify_strict(&Sha256::digest(bytes), &signature)
        .map_err(|_| SignatureError::WrongSigner(name.to_owned()))
}

fn set_execute_bit(path: &Path) -> Result<(), UpdateError> {
    if !path.exists() {
        // Packages built for another platform simply won't carry the
        // binary; nothing to flip.
        tracing::warn!("entry binary {} not present in update", path.display());
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
