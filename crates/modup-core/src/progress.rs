use serde::Serialize;

/// Counters for one kind of work within a check cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackedOperation {
    pub done: usize,
    pub total: usize,
    pub fail: usize,
}

impl TrackedOperation {
    pub fn enqueue(&mut self) {
        self.total += 1;
    }

    /// Record one finished unit. Completions beyond `total` are ignored.
    pub fn complete(&mut self, succeeded: bool) {
        if self.completed() >= self.total {
            return;
        }
        if succeeded {
            self.done += 1;
        } else {
            self.fail += 1;
        }
    }

    #[must_use]
    pub fn completed(&self) -> usize {
        self.done + self.fail
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.completed() == self.total
    }
}

/// Download and install counters for the current cycle.
///
/// Callers hold the pipeline's state lock around every method so that each
/// increment and the drained check that follows it happen together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressTracker {
    pub download: TrackedOperation,
    pub install: TrackedOperation,
}

impl ProgressTracker {
    pub fn queue_download(&mut self) {
        self.download.enqueue();
    }

    /// Finish a download and queue its install. Returns the download fail
    /// count when this was the last outstanding download.
    pub fn download_finished(&mut self, succeeded: bool) -> Option<usize> {
        self.install.enqueue();
        self.download.complete(succeeded);
        self.download
            .is_drained()
            .then_some(self.download.fail)
    }

    /// Finish an install. Returns the install fail count when no download
    /// or install work is left; both counters are reset at that point.
    pub fn install_finished(&mut self, succeeded: bool) -> Option<usize> {
        self.install.complete(succeeded);
        if !(self.install.is_drained() && self.download.is_drained()) {
            return None;
        }
        let failed = self.install.fail;
        *self = Self::default();
        Some(failed)
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.download.total == 0 && self.install.total == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{ProgressTracker, TrackedOperation};

    #[test]
    fn completions_never_exceed_total() {
        let mut op = TrackedOperation::default();
        op.enqueue();
        op.complete(true);
        op.complete(false);

        assert_eq!(op.done, 1);
        assert_eq!(op.fail, 0);
        assert!(op.completed() <= op.total);
    }

    #[test]
    fn downloaded_fires_once_with_fail_count() {
        let mut tracker = ProgressTracker::default();
        tracker.queue_download();
        tracker.queue_download();

        assert_eq!(tracker.download_finished(false), None);
        assert_eq!(tracker.download_finished(true), Some(1));
        assert_eq!(tracker.install.total, 2);
    }

    #[test]
    fn installed_waits_for_outstanding_downloads() {
        let mut tracker = ProgressTracker::default();
        tracker.queue_download();
        tracker.queue_download();

        assert_eq!(tracker.download_finished(true), None);
        // First install drains the install counter while a download is
        // still running.
        assert_eq!(tracker.install_finished(false), None);
        assert_eq!(tracker.download_finished(true), Some(0));
        assert_eq!(tracker.install_finished(true), Some(1));

        assert!(tracker.is_idle());
        assert_eq!(tracker, ProgressTracker::default());
    }

    #[test]
    fn next_cycle_starts_from_zero() {
        let mut tracker = ProgressTracker::default();
        tracker.queue_download();
        tracker.download_finished(false);
        assert_eq!(tracker.install_finished(false), Some(1));

        tracker.queue_download();
        assert_eq!(tracker.download.total, 1);
        assert_eq!(tracker.download.fail, 0);
        assert_eq!(tracker.download_finished(true), Some(0));
        assert_eq!(tracker.install_finished(true), Some(0));
    }
}
