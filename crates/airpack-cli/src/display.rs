//! Terminal progress reporting
//!
//! A spinner on stderr while a phase runs, one status line per finished
//! phase. When stderr is not a terminal the spinner stays hidden and only
//! the status lines are printed.

use console::{Term, style};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use airpack_core::Progress;

pub struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    pub fn new() -> Self {
        let bar = if Term::stderr().is_term() {
            let bar = ProgressBar::new_spinner();
            let spinner = ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            bar.set_style(spinner);
            bar
        } else {
            ProgressBar::hidden()
        };
        Self { bar }
    }

    fn line(&self, line: String) {
        if self.bar.is_hidden() {
            eprintln!("{}", line);
        } else {
            self.bar.println(line);
        }
    }
}

impl Progress for SpinnerProgress {
    fn start(&self, message: &str) {
        self.bar.set_message(message.to_string());
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    fn update(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    fn success(&self, message: &str) {
        self.line(format!("{} {}", style("✓").green().bold(), message));
        self.bar.set_message(String::new());
    }

    fn fail(&self, message: &str) {
        self.line(format!("{} {}", style("✗").red().bold(), message));
        self.bar.set_message(String::new());
    }
}

impl Drop for SpinnerProgress {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}
