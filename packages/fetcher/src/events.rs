/// Progress callbacks for the download side of resolution. The CLI drives a
/// terminal progress bar off these; a GUI would drive its own widgets. The
/// fetcher has no dependency on either.
///
/// All methods have empty default bodies so listeners only override what
/// they care about.
pub trait FetchEvents: Send + Sync {
    /// Called exactly once, if we decide we need to do any network transfers
    /// of non-trivial files (metadata probes don't count).
    fn on_started_downloading(&self, _name: &str) {}

    fn on_fetch(&self, _name: &str, _total_bytes_to_download: u64, _total_downloaded_so_far: u64) {}

    /// If `on_started_downloading` was called, this is called when we are
    /// finished or have failed.
    fn on_stopped_downloading(&self) {}
}

/// Listener that ignores everything, for headless callers.
pub struct NullEvents;

impl FetchEvents for NullEvents {}
