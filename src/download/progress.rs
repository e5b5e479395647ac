//! Download progress tracking and rendering.

use indicatif::{ProgressBar, ProgressStyle};

/// Effect of one progress notification on a [`DownloadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUpdate {
    Advanced { entries_left: u32, total_entries: u32 },
    /// `entries_left` reached zero; reported once per session
    Completed { total_entries: u32 },
    /// Out-of-order or post-completion notification
    Ignored,
}

/// Bookkeeping for one bulk download.
///
/// `entries_left` only ever decreases; the download is complete exactly
/// when it reaches zero.
#[derive(Debug, Clone, Default)]
pub struct DownloadSession {
    total: Option<u32>,
    remaining: Option<u32>,
    complete: bool,
}

impl DownloadSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a progress notification.
    pub fn observe(&mut self, entries_left: u32, total_entries: u32) -> ProgressUpdate {
        if self.complete {
            return ProgressUpdate::Ignored;
        }
        if self.remaining.is_some_and(|remaining| entries_left > remaining) {
            return ProgressUpdate::Ignored;
        }
        let total = *self.total.get_or_insert(total_entries);
        self.remaining = Some(entries_left);

        if entries_left == 0 {
            self.complete = true;
            ProgressUpdate::Completed {
                total_entries: total,
            }
        } else {
            ProgressUpdate::Advanced {
                entries_left,
                total_entries: total,
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Total entries, fixed by the first notification.
    pub fn total(&self) -> Option<u32> {
        self.total
    }

    pub fn remaining(&self) -> Option<u32> {
        self.remaining
    }

    /// Fraction of entries received, 0.0 before the first notification.
    pub fn fraction(&self) -> f64 {
        match (self.total, self.remaining) {
            (Some(0), _) => 1.0,
            (Some(total), Some(left)) => f64::from(total.saturating_sub(left)) / f64::from(total),
            _ => 0.0,
        }
    }
}

/// Receives download progress for rendering.
///
/// Any `FnMut(&str, u32, u32)` closure taking the device address, entries
/// left and total entries is a reporter.
pub trait ProgressReporter: Send {
    fn on_progress(&mut self, address: &str, entries_left: u32, total_entries: u32);

    /// The device's download is over, whether or not it completed.
    fn on_finished(&mut self, _address: &str) {}
}

impl<F> ProgressReporter for F
where
    F: FnMut(&str, u32, u32) + Send,
{
    fn on_progress(&mut self, address: &str, entries_left: u32, total_entries: u32) {
        self(address, entries_left, total_entries)
    }
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {
    fn on_progress(&mut self, _address: &str, _entries_left: u32, _total_entries: u32) {}
}

/// Terminal progress bar, one per device download.
#[derive(Default)]
pub struct BarReporter {
    bar: Option<(String, ProgressBar)>,
}

impl BarReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_bar(address: &str, total: u32) -> ProgressBar {
        let bar = ProgressBar::new(u64::from(total));
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} Progress |{bar:40}| {percent}%")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█░-"),
        );
        bar.set_prefix(address.to_string());
        bar
    }
}

impl ProgressReporter for BarReporter {
    fn on_progress(&mut self, address: &str, entries_left: u32, total_entries: u32) {
        let same_device = matches!(&self.bar, Some((current, _)) if current == address);
        if !same_device {
            if let Some((_, old)) = self.bar.take() {
                old.abandon();
            }
            self.bar = Some((address.to_string(), Self::create_bar(address, total_entries)));
        }
        if let Some((_, bar)) = &self.bar {
            bar.set_position(u64::from(total_entries.saturating_sub(entries_left)));
        }
    }

    fn on_finished(&mut self, address: &str) {
        if let Some((current, bar)) = self.bar.take() {
            if current == address && bar.position() == bar.length().unwrap_or(0) {
                bar.finish();
            } else {
                bar.abandon();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_only_at_zero() {
        let mut session = DownloadSession::new();
        assert_eq!(
            session.observe(500, 500),
            ProgressUpdate::Advanced {
                entries_left: 500,
                total_entries: 500
            }
        );
        assert_eq!(
            session.observe(100, 500),
            ProgressUpdate::Advanced {
                entries_left: 100,
                total_entries: 500
            }
        );
        assert!(!session.is_complete());
        assert_eq!(
            session.observe(0, 500),
            ProgressUpdate::Completed { total_entries: 500 }
        );
        assert!(session.is_complete());
        assert_eq!(session.observe(0, 500), ProgressUpdate::Ignored);
    }

    #[test]
    fn test_increasing_entries_left_is_ignored() {
        let mut session = DownloadSession::new();
        session.observe(300, 500);
        assert_eq!(session.observe(400, 500), ProgressUpdate::Ignored);
        assert_eq!(session.remaining(), Some(300));
        assert!((session.fraction() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_entries_left_above_total_reads_as_no_progress() {
        let mut session = DownloadSession::new();
        session.observe(600, 500);
        assert_eq!(session.total(), Some(500));
        assert_eq!(session.fraction(), 0.0);

        session.observe(250, 500);
        assert!((session.fraction() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_log_completes_immediately() {
        let mut session = DownloadSession::new();
        assert_eq!(
            session.observe(0, 0),
            ProgressUpdate::Completed { total_entries: 0 }
        );
        assert_eq!(session.fraction(), 1.0);
    }

    #[test]
    fn test_total_is_fixed_by_first_notification() {
        let mut session = DownloadSession::new();
        session.observe(500, 500);
        session.observe(200, 480);
        assert_eq!(session.total(), Some(500));
    }

    #[test]
    fn test_closure_reporter() {
        let mut seen = Vec::new();
        {
            let mut reporter = |addr: &str, left: u32, total: u32| {
                seen.push((addr.to_string(), left, total));
            };
            reporter.on_progress("AA:BB:CC:DD:EE:FF", 10, 20);
            ProgressReporter::on_finished(&mut reporter, "AA:BB:CC:DD:EE:FF");
        }
        assert_eq!(seen, vec![("AA:BB:CC:DD:EE:FF".to_string(), 10, 20)]);
    }
}
