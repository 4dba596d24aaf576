use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives progress of long running operations.
///
/// Implemented by the host; called from worker threads.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, current: u64, total: u64, finished: bool);
}

/// A sink that ignores everything
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _current: u64, _total: u64, _finished: bool) {}
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64, bool) + Send + Sync,
{
    fn on_progress(&self, current: u64, total: u64, finished: bool) {
        self(current, total, finished)
    }
}

/// Cooperative cancellation flag shared between a requester and a worker
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Throttles progress callbacks to one per `step` units of work
pub(crate) struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    current: u64,
    total: u64,
    step: u64,
    next_report: u64,
}

impl<'a> ProgressTracker<'a> {
    const DEFAULT_STEP: u64 = 4096;

    pub(crate) fn new(sink: &'a dyn ProgressSink, total: u64) -> Self {
        sink.on_progress(0, total, false);
        ProgressTracker {
            sink,
            current: 0,
            total,
            step: Self::DEFAULT_STEP,
            next_report: Self::DEFAULT_STEP,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_step(mut self, step: u64) -> Self {
        self.step = step.max(1);
        self.next_report = self.current + self.step;
        self
    }

    pub(crate) fn set_total(&mut self, total: u64) {
        self.total = total;
    }

    pub(crate) fn advance(&mut self, n: u64) {
        self.current += n;
        if self.current >= self.next_report {
            self.next_report = self.current + self.step;
            self.sink.on_progress(self.current, self.total, false);
        }
    }

    pub(crate) fn current(&self) -> u64 {
        self.current
    }

    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn finish(self) {
        self.sink
            .on_progress(self.current, self.total.max(self.current), true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_tracker_throttles_and_finishes() {
        let events = Mutex::new(vec![]);
        let sink = |c: u64, t: u64, f: bool| events.lock().unwrap().push((c, t, f));
        let mut tracker = ProgressTracker::new(&sink, 10).with_step(4);
        for _ in 0..10 {
            tracker.advance(1);
        }
        tracker.finish();
        let events = events.into_inner().unwrap();
        assert_eq!(
            events,
            vec![(0, 10, false), (4, 10, false), (8, 10, false), (10, 10, true)]
        );
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
    }
}
