use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use comet_updater::{
    Platform, ProcessRunner, SignatureError, SignedPackage, UpdateChecker, UpdateError,
    UpdateResult,
};
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use url::Url;

struct ServerState {
    dir: PathBuf,
    hits: Mutex<Vec<String>>,
}

async fn serve(state: Arc<ServerState>) -> Url {
    async fn handler(State(state): State<Arc<ServerState>>, uri: Uri) -> impl IntoResponse {
        let rel = uri.path().trim_start_matches('/').to_owned();
        state.hits.lock().unwrap().push(rel.clone());
        match fs::read(state.dir.join(&rel)) {
            Ok(bytes) => (StatusCode::OK, bytes).into_response(),
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        }
    }

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(handler).with_state(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{addr}/")).unwrap()
}

struct Fixture {
    _tmp: tempfile::TempDir,
    server_dir: PathBuf,
    install_dir: PathBuf,
    signing: SigningKey,
    state: Arc<ServerState>,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let server_dir = tmp.path().join("server");
        let install_dir = tmp.path().join("install");
        fs::create_dir_all(server_dir.join("linux")).unwrap();
        fs::create_dir_all(server_dir.join("win")).unwrap();
        fs::create_dir_all(&install_dir).unwrap();
        fs::write(
            server_dir.join("linux/control"),
            "Latest-Version-URL: /2.linux.update.zip\n",
        )
        .unwrap();
        fs::write(
            server_dir.join("win/control"),
            "Latest-Version-URL: /3.win.update.exe\n",
        )
        .unwrap();
        let state = Arc::new(ServerState {
            dir: server_dir.clone(),
            hits: Mutex::new(Vec::new()),
        });
        Fixture {
            _tmp: tmp,
            server_dir,
            install_dir,
            signing: SigningKey::generate(&mut OsRng),
            state,
        }
    }

    /// Builds a small fake install image and packs it as the served update.
    fn publish_signed_update(&self) {
        let image = self.server_dir.join("image");
        fs::create_dir_all(image.join("lib")).unwrap();
        fs::write(image.join("comet"), b"#!fake entry binary\n").unwrap();
        fs::write(image.join("lib/data.txt"), b"payload data\n").unwrap();
        SignedPackage::create(
            &self.server_dir.join("2.linux.update.zip"),
            &image,
            &self.signing,
        )
        .unwrap();
    }

    async fn checker(&self) -> UpdateChecker {
        let base = serve(self.state.clone()).await;
        UpdateChecker::new(base, self.signing.verifying_key()).with_platform(Platform::Linux)
    }

    fn hits(&self) -> Vec<String> {
        self.state.hits.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn manifest_at_or_below_current_version_means_already_fresh() {
    let fixture = Fixture::new();
    fixture.publish_signed_update();
    let checker = fixture.checker().await;

    let result = checker
        .check_for_update(2, &fixture.install_dir)
        .await
        .unwrap();
    assert_eq!(result, UpdateResult::AlreadyFresh);
    // No package download happened, only the control probe.
    assert_eq!(fixture.hits(), vec!["linux/control".to_owned()]);
}

#[tokio::test]
async fn installs_into_a_fresh_version_directory() {
    let fixture = Fixture::new();
    fixture.publish_signed_update();
    let checker = fixture.checker().await;

    let result = checker
        .check_for_update(1, &fixture.install_dir)
        .await
        .unwrap();
    assert_eq!(result, UpdateResult::UpdatedTo(2));

    let target = fixture.install_dir.join("2");
    assert_eq!(
        fs::read(target.join("comet")).unwrap(),
        b"#!fake entry binary\n"
    );
    assert_eq!(
        fs::read(target.join("lib/data.txt")).unwrap(),
        b"payload data\n"
    );
    // Signing metadata never lands in the installation.
    assert!(!target.join("meta").exists());
    // The staging directory was renamed away, not left behind.
    assert!(!fixture.install_dir.join("tmp.2").exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(target.join("comet")).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0, "entry binary should be executable");
    }
}

#[tokio::test]
async fn tampered_entry_aborts_the_whole_install() {
    let fixture = Fixture::new();
    let attacker = SigningKey::generate(&mut OsRng);
    write_tampered_package(
        &fixture.server_dir.join("2.linux.update.zip"),
        &fixture.signing,
        &attacker,
    );
    let checker = fixture.checker().await;

    let err = checker
        .check_for_update(1, &fixture.install_dir)
        .await
        .unwrap_err();
    match err {
        UpdateError::Signature(SignatureError::WrongSigner(name)) => {
            assert_eq!(name, "lib/data.txt")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Nothing from the package may exist in the install tree afterwards.
    assert!(!fixture.install_dir.join("2").exists());
    assert!(!fixture.install_dir.join("tmp.2").exists());
    assert_eq!(fs::read_dir(&fixture.install_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn unsigned_entry_is_rejected() {
    let fixture = Fixture::new();
    write_package_with_unsigned_entry(
        &fixture.server_dir.join("2.linux.update.zip"),
        &fixture.signing,
    );
    let checker = fixture.checker().await;

    let err = checker
        .check_for_update(1, &fixture.install_dir)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Signature(SignatureError::Unsigned(_))
    ));
    assert!(!fixture.install_dir.join("2").exists());
}

#[tokio::test]
async fn low_disk_space_aborts_before_the_payload_download() {
    let fixture = Fixture::new();
    fixture.publish_signed_update();
    let checker = fixture.checker().await.with_required_free_space_mb(u64::MAX);

    let result = checker
        .check_for_update(1, &fixture.install_dir)
        .await
        .unwrap();
    assert_eq!(result, UpdateResult::InsufficientDiskSpace);
    assert_eq!(fixture.hits(), vec!["linux/control".to_owned()]);
}

#[cfg(unix)]
mod native_installer {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, ExitStatus};

    struct FakeRunner {
        exit_code: i32,
        seen: Mutex<Vec<String>>,
    }

    impl ProcessRunner for FakeRunner {
        fn run(&self, command: &mut Command) -> std::io::Result<ExitStatus> {
            let mut parts = vec![command.get_program().to_string_lossy().into_owned()];
            parts.extend(
                command
                    .get_args()
                    .map(|a| a.to_string_lossy().into_owned()),
            );
            self.seen.lock().unwrap().push(parts.join(" "));
            Ok(ExitStatus::from_raw(self.exit_code << 8))
        }
    }

    #[tokio::test]
    async fn windows_updates_run_the_silent_installer() {
        let fixture = Fixture::new();
        fs::write(
            fixture.server_dir.join("3.win.update.exe"),
            b"not really an installer",
        )
        .unwrap();
        let runner = Arc::new(FakeRunner {
            exit_code: 0,
            seen: Mutex::new(Vec::new()),
        });
        let checker = fixture
            .checker()
            .await
            .with_platform(Platform::Windows)
            .with_process_runner(runner.clone());

        let result = checker
            .check_for_update(2, &fixture.install_dir)
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::UpdatedTo(3));

        let seen = runner.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let command = &seen[0];
        assert!(command.contains(".update.exe"), "{command}");
        assert!(command.contains("/VERYSILENT"), "{command}");
        assert!(command.contains("/NORESTART"), "{command}");
        assert!(command.contains("/SUPPRESSMSGBOXES"), "{command}");
        assert!(
            command.contains(&format!("/DIR=\"{}\"", fixture.install_dir.display())),
            "{command}"
        );
    }

    #[tokio::test]
    async fn nonzero_installer_exit_is_reported() {
        let fixture = Fixture::new();
        fs::write(
            fixture.server_dir.join("3.win.update.exe"),
            b"not really an installer",
        )
        .unwrap();
        let runner = Arc::new(FakeRunner {
            exit_code: 1,
            seen: Mutex::new(Vec::new()),
        });
        let checker = fixture
            .checker()
            .await
            .with_platform(Platform::Windows)
            .with_process_runner(runner);

        let result = checker
            .check_for_update(2, &fixture.install_dir)
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::InstallerFailed);
    }
}

fn write_tampered_package(path: &Path, good: &SigningKey, attacker: &SigningKey) {
    let entries: [(&str, &[u8], &SigningKey); 2] = [
        ("comet", b"#!fake entry binary\n", good),
        // Re-signed by a different key, as if swapped in transit.
        ("lib/data.txt", b"evil payload\n", attacker),
    ];
    write_custom_package(path, &entries, &[]);
}

fn write_package_with_unsigned_entry(path: &Path, good: &SigningKey) {
    let entries: [(&str, &[u8], &SigningKey); 1] = [("comet", b"#!fake entry binary\n", good)];
    let unsigned: [(&str, &[u8]); 1] = [("lib/data.txt", b"sneaky extra\n")];
    write_custom_package(path, &entries, &unsigned);
}

fn write_custom_package(
    path: &Path,
    signed: &[(&str, &[u8], &SigningKey)],
    unsigned: &[(&str, &[u8])],
) {
    let file = fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    let mut signatures: BTreeMap<String, String> = BTreeMap::new();

    for (name, bytes, key) in signed {
        let signature = key.sign(&Sha256::digest(bytes));
        signatures.insert((*name).to_owned(), BASE64.encode(signature.to_bytes()));
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    for (name, bytes) in unsigned {
        zip.start_file(*name, options).unwrap();
        zip.write_all(bytes).unwrap();
    }

    let mut manifest = String::from("[files]\n");
    for (name, signature) in &signatures {
        manifest.push_str(&format!("\"{name}\" = \"{signature}\"\n"));
    }
    zip.start_file("meta/signatures.toml", options).unwrap();
    zip.write_all(manifest.as_bytes()).unwrap();
    zip.finish().unwrap();
}
