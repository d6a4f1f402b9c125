use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use romvault_core::ProgressReporter;
use std::sync::Mutex;
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// indicatif rendering of core progress events.
///
/// Indeterminate work gets a spinner, bounded phases a bar. Messages and
/// errors are printed above whatever is currently drawn.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(old) = guard.take() {
                old.finish_and_clear();
            }
            *guard = Some(pb);
        }
    }

    fn finish_bar(&self) {
        if let Ok(mut guard) = self.bar.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
    }

    fn println(&self, line: String) {
        match self.bar.lock() {
            Ok(guard) if guard.is_some() => {
                if let Some(pb) = guard.as_ref() {
                    pb.println(line);
                }
            }
            _ => eprintln!("{}", line),
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(TICK_CHARS)
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "  {spinner:.cyan} {msg} [{bar:30.cyan/dim}] {pos}/{len} ({eta} remaining)",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━╸─")
    .tick_chars(TICK_CHARS)
}

impl ProgressReporter for CliReporter {
    fn on_indeterminate(&self, message: &str) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(spinner_style());
        pb.set_message(message.to_string());
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_bounds(&self, min: u64, max: u64) {
        let message = self
            .bar
            .lock()
            .ok()
            .and_then(|g| g.as_ref().map(|pb| pb.message()))
            .unwrap_or_default();
        let pb = ProgressBar::new(max.saturating_sub(min));
        pb.set_style(bar_style());
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn on_progress(&self, value: u64) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.set_position(value);
            }
        }
    }

    fn on_message(&self, message: &str) {
        if let Ok(guard) = self.bar.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.set_message(message.to_string());
                return;
            }
        }
        self.on_indeterminate(message);
    }

    fn on_error(&self, message: &str) {
        self.println(format!("  {} {}", "✗".red(), message));
    }

    fn on_finished(&self, summary: &str) {
        self.finish_bar();
        eprintln!("  {} {}", "✓".green(), summary);
    }
}
