//! Progress reporting for long-running operations.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Reading and hashing the source tree.
    Hashing,
    /// Storing new or modified content.
    Copying,
    /// Materializing a backup's logical tree.
    Restoring,
}
impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hashing => "hashing",
            Self::Copying => "copying",
            Self::Restoring => "restoring",
        })
    }
}

/// One step of progress: `done` out of `total` items, the latest being `label`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub done: u64,
    pub total: u64,
    pub label: String,
}

/// Receives [`Progress`] updates.
///
/// Implemented for any `Fn(Progress)`, so a closure is usually enough:
///
/// ```
/// use timekeep_backup::progress::{Progress, ProgressSink};
///
/// let sink = |p: Progress| println!("{} {}/{} {}", p.phase, p.done, p.total, p.label);
/// sink.report(Progress { phase: timekeep_backup::progress::Phase::Hashing, done: 1, total: 2, label: "a.txt".into() });
/// ```
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: Progress);
}
impl<F> ProgressSink for F
where
    F: Fn(Progress) + Send + Sync,
{
    fn report(&self, progress: Progress) {
        self(progress)
    }
}

/// Discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;
impl ProgressSink for Silent {
    fn report(&self, _progress: Progress) {}
}

/// Counts items for one phase and forwards each step to a sink.
pub(crate) struct Tracker<'a> {
    sink: &'a dyn ProgressSink,
    phase: Phase,
    done: u64,
    total: u64,
}
impl<'a> Tracker<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, phase: Phase, total: usize) -> Self {
        Self { sink, phase, done: 0, total: total as u64 }
    }

    pub(crate) fn step(&mut self, label: impl Into<String>) {
        self.done += 1;
        self.sink.report(Progress { phase: self.phase, done: self.done, total: self.total, label: label.into() });
    }
}
