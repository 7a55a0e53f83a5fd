//! Progress delivery for backup operations.
//!
//! Operations report through a [`ProgressReporter`]. Reports are throttled so
//! that a listener only sees a new value when the message or the percentage
//! changed, and percentages never decrease within one operation.

use tokio::sync::watch;

/// A single progress report.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackupProgress {
    /// A short human readable description of the current step.
    pub message: String,

    /// Completion in percent, `None` if the total is unknown.
    pub percent: Option<u8>,
}

/// A trait for receiving progress of backup operations.
///
/// Reports are delivered on the thread that runs the operation, implementations
/// must return quickly.
pub trait ProgressReporter: Send + Sync {
    /// Called whenever the progress changed.
    fn on_progress(&self, progress: &BackupProgress);
}

impl<F> ProgressReporter for F
where
    F: Fn(&BackupProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &BackupProgress) {
        self(progress);
    }
}

/// A reporter that publishes the latest report on a [`watch`] channel.
///
/// Publishing never blocks and never fails, a slow listener simply skips
/// intermediate values and always observes the most recent one, including
/// the final report.
#[derive(Debug)]
pub struct WatchReporter {
    sender: watch::Sender<BackupProgress>,
}

impl WatchReporter {
    /// Creates a reporter and the receiving end of its channel.
    pub fn new() -> (Self, watch::Receiver<BackupProgress>) {
        let (sender, receiver) = watch::channel(BackupProgress::default());
        (Self { sender }, receiver)
    }

    /// Returns another receiver for the same channel.
    pub fn subscribe(&self) -> watch::Receiver<BackupProgress> {
        self.sender.subscribe()
    }
}

impl ProgressReporter for WatchReporter {
    fn on_progress(&self, progress: &BackupProgress) {
        self.sender.send_replace(progress.clone());
    }
}

/// Computes `done * 100 / total`, clamped to 100. `None` when the total is
/// zero.
pub fn percent_of(done: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = u128::from(done.min(total)) * 100 / u128::from(total);
    u8::try_from(percent).ok()
}

/// Filters reports for a single operation.
pub(crate) struct ProgressThrottle<'r> {
    reporter: Option<&'r dyn ProgressReporter>,
    /// The highest percentage reported so far.
    floor: Option<u8>,
    /// The last report that reached the listener.
    last_reported: Option<(String, Option<u8>)>,
}

impl<'r> ProgressThrottle<'r> {
    pub fn new(reporter: Option<&'r dyn ProgressReporter>) -> Self {
        Self {
            reporter,
            floor: None,
            last_reported: None,
        }
    }

    /// Reports unless neither the message nor the percentage changed. A
    /// forced report is always delivered.
    pub fn report(&mut self, message: &str, percent: Option<u8>, force: bool) {
        let Some(reporter) = self.reporter else {
            return;
        };

        // Never go backwards.
        let floor = self.floor;
        let percent = percent.map(|percent| floor.map_or(percent, |floor| percent.max(floor)));

        let unchanged = self
            .last_reported
            .as_ref()
            .is_some_and(|(last_message, last_percent)| {
                last_message == message && *last_percent == percent
            });
        if unchanged && !force {
            return;
        }

        if percent.is_some() {
            self.floor = percent;
        }
        self.last_reported = Some((message.to_owned(), percent));
        reporter.on_progress(&BackupProgress {
            message: message.to_owned(),
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex;

    #[rstest]
    #[case(0, 100, Some(0))]
    #[case(50, 100, Some(50))]
    #[case(99, 100, Some(99))]
    #[case(150, 100, Some(100))]
    #[case(1, 3, Some(33))]
    #[case(u64::MAX, u64::MAX, Some(100))]
    #[case(0, 0, None)]
    fn test_percent_of(#[case] done: u64, #[case] total: u64, #[case] expected: Option<u8>) {
        assert_eq!(percent_of(done, total), expected);
    }

    #[test]
    fn test_throttle() {
        let seen = Mutex::new(Vec::new());
        let reporter = |progress: &BackupProgress| {
            seen.lock().unwrap().push((progress.message.clone(), progress.percent));
        };
        let mut throttle = ProgressThrottle::new(Some(&reporter));
        throttle.report("Exporting", Some(0), true);
        throttle.report("Exporting", Some(0), false);
        throttle.report("Exporting", Some(10), false);
        throttle.report("Exporting", Some(5), false);
        throttle.report("Applying", None, false);
        throttle.report("Applying", None, false);
        throttle.report("Done", Some(100), true);
        throttle.report("Done", Some(100), true);
        drop(throttle);

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![
                (String::from("Exporting"), Some(0)),
                (String::from("Exporting"), Some(10)),
                (String::from("Applying"), None),
                (String::from("Done"), Some(100)),
                (String::from("Done"), Some(100)),
            ]
        );
    }

    #[test]
    fn test_throttle_unknown_percent_after_known() {
        let seen = Mutex::new(Vec::new());
        let reporter = |progress: &BackupProgress| {
            seen.lock().unwrap().push((progress.message.clone(), progress.percent));
        };
        let mut throttle = ProgressThrottle::new(Some(&reporter));
        throttle.report("Extracting", Some(40), true);
        for _ in 0..5 {
            throttle.report("Applying", None, false);
        }
        // The floor survives reports without a percentage.
        throttle.report("Extracting", Some(20), false);
        drop(throttle);

        assert_eq!(
            seen.into_inner().unwrap(),
            vec![
                (String::from("Extracting"), Some(40)),
                (String::from("Applying"), None),
                (String::from("Extracting"), Some(40)),
            ]
        );
    }

    #[test]
    fn test_watch_reporter_keeps_latest() {
        let (reporter, receiver) = WatchReporter::new();
        for percent in 0..=100 {
            reporter.on_progress(&BackupProgress {
                message: String::from("Exporting"),
                percent: Some(percent),
            });
        }
        assert_eq!(receiver.borrow().percent, Some(100));
    }
}
