//! History tracking and completion of coordinates to more precise forms.
//!
//! The history store is part of how comet keeps launches fast: we remember
//! the full resolution for everything recently run, and a background job
//! re-resolves stale entries so the latest versions are already downloaded
//! by the time the user asks again.
//!
//! The on-disk format is one TOML record per entry, separated by blank
//! lines, so the file stays easy to read and hand edit. It is rewritten
//! whole on every mutation; for a list capped at twenty entries that is
//! cheaper than being clever.

pub mod clock;
pub mod entry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use chrono::Duration;
use comet_fetcher::{Resolution, ResolutionError};
use thiserror::Error;

pub use clock::{Clock, SystemClock};
pub use entry::HistoryEntry;

const HISTORY_FILE: &str = "history.1.toml";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encode history records: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("refusing to delete {0}: it does not look like a cache directory")]
    SuspiciousCachePath(PathBuf),
}

/// Result of matching user input against the history list.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub entry: HistoryEntry,
    /// The entry is older than the refresh interval and should be
    /// re-resolved before being trusted.
    pub stale: bool,
    pub age: Duration,
}

/// Tunables for [`HistoryManager::open_with`].
pub struct Options {
    pub refresh_interval: Duration,
    pub max_history_size: usize,
    pub clock: Arc<dyn Clock>,
    /// Write the history file inline instead of on the background writer.
    /// Callers that immediately re-read the file (tests, mostly) need this.
    pub blocking: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            refresh_interval: Duration::hours(24),
            max_history_size: 20,
            clock: Arc::new(SystemClock),
            blocking: false,
        }
    }
}

struct BackgroundWriter {
    tx: mpsc::Sender<String>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Durable, bounded, newest-first cache of past resolutions, keyed by the
/// exact string the user typed.
pub struct HistoryManager {
    entries: Vec<HistoryEntry>,
    file: PathBuf,
    refresh_interval: Duration,
    max_history_size: usize,
    clock: Arc<dyn Clock>,
    writer: Option<BackgroundWriter>,
}

impl HistoryManager {
    pub fn open(storage_dir: &Path) -> Result<Self, CacheError> {
        Self::open_with(storage_dir, Options::default())
    }

    pub fn open_with(storage_dir: &Path, options: Options) -> Result<Self, CacheError> {
        fs::create_dir_all(storage_dir)?;
        let file = storage_dir.join(HISTORY_FILE);
        tracing::info!("comet cache is {}", storage_dir.display());

        let mut entries = Vec::new();
        if file.exists() {
            match fs::read_to_string(&file) {
                Ok(contents) => {
                    entries = parse_records(&contents, options.max_history_size);
                    tracing::info!("read {} entries from the history list", entries.len());
                }
                // Not ideal, but we don't want to brick ourselves.
                Err(e) => tracing::warn!("failed to read history file: {e}"),
            }
        }

        let writer = if options.blocking {
            None
        } else {
            Some(spawn_writer(file.clone()))
        };

        Ok(HistoryManager {
            entries,
            file,
            refresh_interval: options.refresh_interval,
            max_history_size: options.max_history_size,
            clock: options.clock,
            writer,
        })
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    /// Matches user input against the history list to locate the last fully
    /// resolved coordinates we used. The match is case-insensitive and
    /// exact on the fragment as originally typed.
    pub fn search(&self, fragment: &str) -> Option<Lookup> {
        tracing::info!("searching history for a cached resolution of '{fragment}'");
        let i = self.index_of(fragment)?;
        let entry = self.entries[i].clone();
        let (age, stale) = self.age_check(&entry);
        Some(Lookup { entry, stale, age })
    }

    /// Inserts or updates the history table for the given entry. If the
    /// fragment matches an existing entry it is replaced and moved to the
    /// front; otherwise the new entry pushes the oldest one off the list.
    pub fn record(&mut self, entry: HistoryEntry) -> HistoryEntry {
        if let Some(i) = self.index_of(&entry.coordinate) {
            self.entries.remove(i);
        }
        tracing::info!("recording history entry: {entry}");
        self.entries.insert(0, entry.clone());
        if self.entries.len() > self.max_history_size {
            let removed = self.entries.pop();
            if let Some(removed) = removed {
                tracing::info!(
                    "forgetting old history entry {removed}: more than {} entries",
                    self.max_history_size
                );
            }
        }
        self.write_history();
        entry
    }

    pub fn remove(&mut self, entry: &HistoryEntry) {
        let before = self.entries.len();
        self.entries.retain(|e| e != entry);
        if self.entries.len() != before {
            self.write_history();
        }
    }

    /// Re-resolves every stale item in the history list, oldest first, to
    /// check for and download updates. A failure on one entry is logged and
    /// skipped; it must never abort the batch.
    pub async fn refresh_all<F, Fut>(&mut self, resolve: F)
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<Resolution, ResolutionError>>,
    {
        for i in (0..self.entries.len()).rev() {
            let (age, stale) = self.age_check(&self.entries[i]);
            let fragment = self.entries[i].coordinate.clone();
            if !stale {
                tracing::info!(
                    "refreshed {fragment} {} seconds ago, skipping",
                    age.num_seconds()
                );
                continue;
            }
            tracing::info!("refreshing entry {i}: {fragment}");
            match resolve(fragment.clone()).await {
                Ok(resolution) => {
                    let mut entry = HistoryEntry::from_resolution(&fragment, &resolution);
                    entry.last_refresh_time = self.clock.now();
                    self.entries[i] = entry;
                    self.write_history();
                }
                Err(e) => tracing::error!("failed to refresh {fragment}, skipping: {e}"),
            }
        }
    }

    /// Deletes the artifact cache directory and re-writes the history file,
    /// which lives underneath it and would otherwise be lost too.
    pub fn clear_cache(&mut self, cache_dir: &Path) -> Result<(), CacheError> {
        // A bit of sanity checking before we delete stuff.
        if cache_dir.parent().is_none() || cache_dir.join(".bash_history").exists() {
            return Err(CacheError::SuspiciousCachePath(cache_dir.to_path_buf()));
        }
        tracing::info!("clearing cache: {}", cache_dir.display());
        if cache_dir.exists() {
            fs::remove_dir_all(cache_dir)?;
        }
        self.persist_now()?;
        Ok(())
    }

    /// Forces the on-disk file to reflect the current in-memory state before
    /// returning. Background writes are ordered, so joining the queue with
    /// one more snapshot is enough.
    pub fn persist_now(&self) -> Result<(), CacheError> {
        let contents = render_records(&self.entries)?;
        write_file(&self.file, &contents);
        Ok(())
    }

    fn write_history(&self) {
        // Do the writing off-thread to get out of the way of startup. Each
        // submission is a full snapshot, so the file is always internally
        // consistent even if it briefly trails the in-memory list.
        let contents = match render_records(&self.entries) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("failed to encode history: {e}");
                return;
            }
        };
        match &self.writer {
            Some(writer) => {
                if writer.tx.send(contents).is_err() {
                    tracing::warn!("history writer thread is gone, write dropped");
                }
            }
            None => write_file(&self.file, &contents),
        }
    }

    fn index_of(&self, fragment: &str) -> Option<usize> {
        let lower = fragment.to_lowercase();
        self.entries
            .iter()
            .position(|e| e.coordinate.to_lowercase() == lower)
    }

    fn age_check(&self, entry: &HistoryEntry) -> (Duration, bool) {
        let age = (self.clock.now() - entry.last_refresh_time).abs();
        (age, age > self.refresh_interval)
    }
}

impl Drop for HistoryManager {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            drop(writer.tx);
            if let Some(handle) = writer.handle {
                let _ = handle.join();
            }
        }
    }
}

fn spawn_writer(file: PathBuf) -> BackgroundWriter {
    let (tx, rx) = mpsc::channel::<String>();
    let handle = thread::spawn(move || {
        for contents in rx {
            write_file(&file, &contents);
        }
    });
    BackgroundWriter {
        tx,
        handle: Some(handle),
    }
}

fn write_file(file: &Path, contents: &str) {
    let result = (|| -> std::io::Result<()> {
        if let Some(parent) = file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(file, contents)
    })();
    if let Err(e) = result {
        tracing::warn!("failed to write history file {}: {e}", file.display());
    }
}

fn render_records(entries: &[HistoryEntry]) -> Result<String, toml::ser::Error> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        records.push(toml::to_string(entry)?);
    }
    Ok(records.join("\n"))
}

/// Parses the record file leniently: a record that fails to parse (usually a
/// missing field after a hand edit) is skipped with a warning rather than
/// taking the whole list down with it.
fn parse_records(contents: &str, max: usize) -> Vec<HistoryEntry> {
    let mut entries = Vec::new();
    for chunk in contents.split("\n\n") {
        if chunk.trim().is_empty() {
            continue;
        }
        match toml::from_str::<HistoryEntry>(chunk) {
            Ok(entry) => {
                entries.push(entry);
                if entries.len() == max {
                    break;
                }
            }
            Err(e) => tracing::warn!("skipping un-parseable history record: {e}"),
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use comet_fetcher::Coordinate;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(ManualClock(Mutex::new(Utc::now())))
        }
        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn example(fragment: &str, artifact: &str) -> HistoryEntry {
        HistoryEntry {
            coordinate: fragment.to_owned(),
            last_refresh_time: Utc::now(),
            resolved_artifact: artifact.to_owned(),
            module_paths: vec!["zzz.wasm".into(), "xxx.wasm".into()],
            name: "zzz app".to_owned(),
            description: Some("for sleeping".to_owned()),
        }
    }

    fn blocking_options() -> Options {
        Options {
            blocking: true,
            ..Options::default()
        }
    }

    #[test]
    fn happy_path() {
        let tmp = tempfile::tempdir().unwrap();
        // Check it can be started with no history file.
        let mut manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        assert!(manager.search("com.foo.bar").is_none());

        let entry = example("com.github.spotbugs", "com.github.spotbugs:spotbugs:1.2.3");
        manager.record(entry.clone());
        assert_eq!(
            manager.search("com.github.spotbugs").unwrap().entry.resolved_artifact,
            entry.resolved_artifact
        );

        // Reload from disk into a fresh instance.
        let mut manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        assert_eq!(
            manager.search("com.github.spotbugs").unwrap().entry.resolved_artifact,
            entry.resolved_artifact
        );

        // Overflow the history list.
        for i in 0..=manager.max_history_size() {
            manager.record(example(&format!("net.example:ex-{i}"), "net.example:ex:1.2.1"));
        }
        assert_eq!(manager.entries().len(), manager.max_history_size());
        // Now the original entry can't be found anymore, it's gone.
        assert!(manager.search("com.github.spotbugs").is_none());
    }

    #[test]
    fn re_recording_promotes_without_duplicating() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let mut manager = HistoryManager::open_with(
            tmp.path(),
            Options {
                clock: clock.clone(),
                blocking: true,
                ..Options::default()
            },
        )
        .unwrap();

        let first = example("com.github.spotbugs", "com.github.spotbugs:spotbugs:1.2.3");
        let second = example("net.example:ex", "net.example:ex:1.2.1");
        manager.record(first.clone());
        manager.record(second);
        assert_eq!(manager.entries()[1].coordinate, first.coordinate);

        // Re-recording the same fragment (case-insensitively) replaces it in
        // place and moves it to the front.
        let mut updated = first.clone();
        updated.coordinate = "COM.GITHUB.SPOTBUGS".to_owned();
        updated.resolved_artifact = "com.github.spotbugs:spotbugs:1.3.0".to_owned();
        let recorded = manager.record(updated);
        assert_eq!(manager.entries().len(), 2);
        assert_eq!(manager.entries()[0], recorded);
    }

    #[test]
    fn entries_go_stale_after_the_refresh_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let mut manager = HistoryManager::open_with(
            tmp.path(),
            Options {
                clock: clock.clone(),
                blocking: true,
                ..Options::default()
            },
        )
        .unwrap();

        let mut entry = example("net.example:ex", "net.example:ex:1.2.1");
        entry.last_refresh_time = clock.now();
        manager.record(entry);

        assert!(!manager.search("net.example:ex").unwrap().stale);
        clock.advance(Duration::days(2));
        assert!(manager.search("net.example:ex").unwrap().stale);
    }

    #[test]
    fn round_trip_preserves_order_and_drops_bad_records() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        manager.record(example("b:second", "b:second:2.0.0"));
        manager.record(example("a:first", "a:first:1.0.0"));
        drop(manager);

        // Corrupt the older record by removing a required field.
        let file = tmp.path().join(HISTORY_FILE);
        let contents = fs::read_to_string(&file).unwrap();
        let broken = contents.replace("name = \"zzz app\"\n", "");
        let mut chunks: Vec<&str> = broken.split("\n\n").collect();
        assert_eq!(chunks.len(), 2);
        let good_first = contents.split("\n\n").next().unwrap().to_owned();
        chunks[0] = &good_first;
        fs::write(&file, chunks.join("\n\n")).unwrap();

        let manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        assert_eq!(manager.entries().len(), 1);
        assert_eq!(manager.entries()[0].coordinate, "a:first");
    }

    #[test]
    fn missing_description_round_trips_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let mut manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        let mut entry = example("net.example:ex", "net.example:ex:1.2.1");
        entry.description = None;
        manager.record(entry);

        let manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        assert_eq!(manager.entries()[0].description, None);
    }

    #[test]
    fn corrupt_file_is_treated_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(HISTORY_FILE),
            "<html>some garbage that won't parse</html",
        )
        .unwrap();
        let manager = HistoryManager::open_with(tmp.path(), blocking_options()).unwrap();
        assert!(manager.entries().is_empty());
    }

    #[tokio::test]
    async fn refresh_all_updates_stale_entries_and_skips_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let mut manager = HistoryManager::open_with(
            tmp.path(),
            Options {
                clock: clock.clone(),
                blocking: true,
                ..Options::default()
            },
        )
        .unwrap();

        let mut stale = example("org.example:app", "org.example:app:1.0.0");
        stale.last_refresh_time = clock.now();
        let mut broken = example("org.example:gone", "org.example:gone:1.0.0");
        broken.last_refresh_time = clock.now();
        manager.record(broken);
        manager.record(stale);
        clock.advance(Duration::days(2));

        manager
            .refresh_all(|fragment| async move {
                if fragment.contains("gone") {
                    return Err(comet_fetcher::ResolutionError::NotFound {
                        coordinate: fragment,
                    });
                }
                Ok(Resolution {
                    coordinate: Coordinate::parse("org.example:app:2.0.0").unwrap(),
                    name: "app".to_owned(),
                    description: None,
                    entry: None,
                    features: Vec::new(),
                    module_paths: vec!["app-2.0.0.wasm".into()],
                    refresh_time: Utc::now(),
                })
            })
            .await;

        // The refreshable entry was replaced in place; the failing one was
        // skipped but kept.
        assert_eq!(manager.entries().len(), 2);
        assert_eq!(manager.entries()[0].resolved_artifact, "org.example:app:2.0.0");
        assert_eq!(manager.entries()[0].last_refresh_time, clock.now());
        assert_eq!(manager.entries()[1].resolved_artifact, "org.example:gone:1.0.0");
    }
}
