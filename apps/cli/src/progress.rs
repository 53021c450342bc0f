use std::sync::Mutex;
use std::time::Instant;

use comet_fetcher::FetchEvents;
use comet_launcher::{LaunchEvents, StartError};
use indicatif::{ProgressBar, ProgressStyle};

/// Drives a terminal progress bar off the launcher's event stream. All the
/// state lives behind a mutex because download callbacks arrive from
/// whatever thread the transfer runs on.
pub struct ProgressReporter {
    bar: Mutex<Option<ProgressBar>>,
    started: Instant,
}

impl ProgressReporter {
    pub fn new() -> Self {
        ProgressReporter {
            bar: Mutex::new(None),
            started: Instant::now(),
        }
    }

    fn take_bar(&self) -> Option<ProgressBar> {
        self.bar.lock().unwrap().take()
    }
}

impl FetchEvents for ProgressReporter {
    fn on_started_downloading(&self, name: &str) {
        let bar = ProgressBar::new(1);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{bar:40.cyan/blue} {bytes}/{total_bytes} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.set_message(name.to_owned());
        *self.bar.lock().unwrap() = Some(bar);
    }

    fn on_fetch(&self, name: &str, total_bytes_to_download: u64, total_downloaded_so_far: u64) {
        if let Some(bar) = &*self.bar.lock().unwrap() {
            // A zero-length range makes the bar misrender, so clamp it.
            bar.set_length(total_bytes_to_download.max(1));
            bar.set_position(total_downloaded_so_far);
            if name.ends_with(".toml") {
                bar.set_message(name.to_owned());
            } else {
                bar.set_message("");
            }
        }
    }

    fn on_stopped_downloading(&self) {}
}

impl LaunchEvents for ProgressReporter {
    fn preparing_to_download(&self) {
        eprint!("Please wait ... ");
    }

    fn about_to_start_app(&self, _out_of_process: bool) {
        if let Some(bar) = self.take_bar() {
            bar.finish_and_clear();
            eprintln!(
                "Downloaded successfully in {:.1} seconds",
                self.started.elapsed().as_secs_f64()
            );
        }
    }

    fn on_error(&self, _error: &StartError) {
        if let Some(bar) = self.take_bar() {
            bar.finish_and_clear();
        }
    }
}
