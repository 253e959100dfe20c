//! Spinner shown while contenders are measured.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

pub struct BenchProgress {
    bar: ProgressBar,
}

impl BenchProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// A spinner that draws nothing.
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    /// Callback for [`crate::harness::run_size`].
    pub fn callback(&self) -> impl Fn(&str) + '_ {
        move |msg: &str| self.bar.set_message(msg.to_string())
    }
}
