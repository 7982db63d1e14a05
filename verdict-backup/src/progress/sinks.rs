//! Progress sink implementations.

use super::ProgressSink;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Events delivered by [`ChannelProgress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Start { label: String, total_steps: u64 },
    Step,
    Done,
    Message(String),
}

/// Forwards progress to an async consumer (UI task) over an unbounded channel.
///
/// A single channel keeps start/step/done in order. Sends to a closed
/// receiver are dropped.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_start(&self, label: &str, total_steps: u64) {
        let _ = self.tx.send(ProgressEvent::Start {
            label: label.to_string(),
            total_steps,
        });
    }

    fn on_step(&self) {
        let _ = self.tx.send(ProgressEvent::Step);
    }

    fn on_done(&self) {
        let _ = self.tx.send(ProgressEvent::Done);
    }

    fn message(&self, line: &str) {
        let _ = self.tx.send(ProgressEvent::Message(line.to_string()));
    }
}

#[derive(Debug, Default)]
struct ConsoleState {
    total: u64,
    percent: u64,
}

/// Renders progress on stdout: a label line, an in-place percentage, `...done`.
#[derive(Debug, Default)]
pub struct ConsoleProgress {
    state: Mutex<ConsoleState>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_start(&self, label: &str, total_steps: u64) {
        if let Ok(mut state) = self.state.lock() {
            *state = ConsoleState {
                total: total_steps,
                percent: 0,
            };
        }
        let mut out = std::io::stdout().lock();
        if total_steps == 0 {
            let _ = writeln!(out, "{}...done", label);
        } else {
            let _ = writeln!(out, "{}...", label);
        }
    }

    fn on_step(&self) {
        let percent = match self.state.lock() {
            Ok(mut state) => {
                state.percent += 1;
                state.percent
            }
            Err(_) => return,
        };
        let mut out = std::io::stdout().lock();
        let _ = write!(out, "\r{:>3}%", percent);
        let _ = out.flush();
    }

    fn on_done(&self) {
        let (total, percent) = match self.state.lock() {
            Ok(state) => (state.total, state.percent),
            Err(_) => (1, 0),
        };
        if total == 0 {
            return;
        }
        let mut out = std::io::stdout().lock();
        if percent > 0 {
            let _ = writeln!(out, "\r...done        ");
        } else {
            let _ = writeln!(out, "...done");
        }
    }

    fn message(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "\r{}", line);
    }
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_start(&self, _label: &str, _total_steps: u64) {}
    fn on_step(&self) {}
    fn on_done(&self) {}
}
