//! Progress reporting for long-running engine operations.
//!
//! Engine code drives a [`ProgressTracker`] per phase; the tracker forwards
//! start/step/done to a [`ProgressSink`]. For phases with more than one unit
//! of work, steps are throttled to whole-percent boundaries, so a sink sees
//! at most 100 steps per phase and each step is one percent. A phase with a
//! total of 0 or 1 is indeterminate and receives no steps.

pub mod sinks;

use std::time::Duration;

pub use sinks::{ChannelProgress, ConsoleProgress, NullProgress, ProgressEvent};

/// Receiver of progress notifications.
///
/// Calls arrive in strict order per phase: one `on_start`, any number of
/// `on_step`, then one `on_done`.
pub trait ProgressSink: Send + Sync {
    fn on_start(&self, label: &str, total_steps: u64);
    fn on_step(&self);
    fn on_done(&self);

    /// Free-form line that belongs next to the progress display (findings, tool output).
    fn message(&self, _line: &str) {}
}

/// One phase of progress. Sends `on_done` when finished or dropped.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    total: u64,
    completed: u64,
    percent: u64,
    finished: bool,
}

impl<'a> ProgressTracker<'a> {
    pub fn start(sink: &'a dyn ProgressSink, label: &str, total: u64) -> Self {
        sink.on_start(label, total);
        Self {
            sink,
            total,
            completed: 0,
            percent: 0,
            finished: false,
        }
    }

    /// Record one unit of work.
    pub fn inc(&mut self) {
        self.completed += 1;
        if self.total <= 1 {
            return;
        }
        let percent = (self.completed.min(self.total) * 100) / self.total;
        while self.percent < percent {
            self.percent += 1;
            self.sink.on_step();
        }
    }

    pub fn message(&self, line: &str) {
        self.sink.message(line);
    }

    pub fn finish(mut self) {
        self.done();
    }

    fn done(&mut self) {
        if !self.finished {
            self.finished = true;
            self.sink.on_done();
        }
    }
}

impl Drop for ProgressTracker<'_> {
    fn drop(&mut self) {
        self.done();
    }
}

/// Format bytes as decimal gigabytes, e.g. `1.5 GB`.
pub fn format_gigabytes(bytes: u64) -> String {
    format!("{:.1} GB", bytes as f64 / 1_000_000_000.0)
}

/// Format duration as human-readable string
pub fn format_duration(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(ProgressEvent::Message(_)) => {}
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    #[test]
    fn test_steps_throttled_to_whole_percent() {
        let (sink, mut rx) = ChannelProgress::channel();
        let mut tracker = ProgressTracker::start(&sink, "Scanning", 1000);
        for _ in 0..1000 {
            tracker.inc();
        }
        tracker.finish();

        let events = drain(&mut rx);
        assert_eq!(events.first(), Some(&ProgressEvent::Start { label: "Scanning".into(), total_steps: 1000 }));
        assert_eq!(events.last(), Some(&ProgressEvent::Done));
        let steps = events.iter().filter(|e| **e == ProgressEvent::Step).count();
        assert_eq!(steps, 100);
    }

    #[test]
    fn test_small_total_catches_up_percent() {
        let (sink, mut rx) = ChannelProgress::channel();
        let mut tracker = ProgressTracker::start(&sink, "Few", 3);
        tracker.inc();
        tracker.inc();
        tracker.inc();
        tracker.inc();
        drop(tracker);

        let steps = drain(&mut rx).iter().filter(|e| **e == ProgressEvent::Step).count();
        assert_eq!(steps, 100);
    }

    #[test]
    fn test_indeterminate_phase_has_no_steps() {
        let (sink, mut rx) = ChannelProgress::channel();
        let mut tracker = ProgressTracker::start(&sink, "Running", 1);
        tracker.inc();
        tracker.finish();

        assert_eq!(
            drain(&mut rx),
            vec![
                ProgressEvent::Start { label: "Running".into(), total_steps: 1 },
                ProgressEvent::Done
            ]
        );
    }

    #[test]
    fn test_done_sent_once_on_drop() {
        let (sink, mut rx) = ChannelProgress::channel();
        {
            let _tracker = ProgressTracker::start(&sink, "Aborted", 10);
        }
        let done = drain(&mut rx).iter().filter(|e| **e == ProgressEvent::Done).count();
        assert_eq!(done, 1);
    }

    #[test]
    fn test_format_gigabytes() {
        assert_eq!(format_gigabytes(0), "0.0 GB");
        assert_eq!(format_gigabytes(1_500_000_000), "1.5 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m");
    }
}
