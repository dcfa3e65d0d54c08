use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::coordinator::{UpdateObserver, UpdateState};

/// Manifest checks, verification and extraction: anything without a byte count.
pub fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("\x1b[33m{spinner}\x1b[0m {wide_msg}")
        .unwrap()
        .tick_strings(&["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"])
}

/// Byte counter for downloads and file replacement.
pub fn bytes_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "\x1b[33m{spinner}\x1b[0m [{bar:30}] {bytes}/{total_bytes} {wide_msg}",
    )
    .unwrap()
    .progress_chars("=> ")
    .tick_strings(&["⣾", "⣽", "⣻", "⢿", "⡿", "⣟", "⣯", "⣷"])
}

/// Final line of a finished check or install, e.g. how many files were replaced.
pub fn ok_style() -> ProgressStyle {
    ProgressStyle::with_template("\x1b[32m✔\x1b[0m {wide_msg}").unwrap()
}

/// Final line of a failed session; the message carries the error kind.
pub fn err_style() -> ProgressStyle {
    ProgressStyle::with_template("\x1b[31m✘\x1b[0m {wide_msg}").unwrap()
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(spinner_style());
    pb.enable_steady_tick(Duration::from_millis(200));
    pb.set_message(msg.to_string());
    pb
}

/// Renders coordinator events on one progress line.
///
/// The bar is shared with the caller (clones of a `ProgressBar` drive the
/// same line) so it can be finished after the session ends.
pub struct BarObserver {
    pb: ProgressBar,
    stage: Option<UpdateState>,
}

impl BarObserver {
    pub fn new(pb: ProgressBar) -> Self {
        BarObserver { pb, stage: None }
    }
}

impl UpdateObserver for BarObserver {
    fn on_status(&mut self, state: UpdateState, message: &str) {
        if self.stage != Some(state) {
            self.stage = Some(state);
            self.pb.set_style(spinner_style());
            self.pb.set_position(0);
            self.pb.unset_length();
        }
        self.pb.set_message(message.to_string());
    }

    fn on_progress(&mut self, done: u64, total: Option<u64>) {
        match total {
            Some(t) => {
                if self.pb.length() != Some(t) {
                    self.pb.set_style(bytes_style());
                    self.pb.set_length(t);
                }
                self.pb.set_position(done);
            }
            None => self.pb.set_position(done),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switches_to_byte_bar_when_total_is_known() {
        let pb = ProgressBar::hidden();
        let mut obs = BarObserver::new(pb.clone());
        obs.on_status(UpdateState::Downloading, "downloading");
        obs.on_progress(10, Some(100));
        assert_eq!(pb.length(), Some(100));
        assert_eq!(pb.position(), 10);

        obs.on_status(UpdateState::Verifying, "verifying");
        assert_eq!(pb.position(), 0);
        assert_eq!(pb.length(), None);
    }
}
