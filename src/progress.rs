//! Progress reporting for long sequential passes (index scans, verification).
//!
//! The core never owns a progress UI; callers inject a reporter. The CLI
//! wires this to an indicatif bar, library users usually pass [`NoProgress`].

/// Receiver for progress updates from a long-running pass.
pub trait Progress {
    /// A pass over `total` units (used blocks) is starting.
    fn start(&mut self, total: u64);
    /// `n` more units have been processed.
    fn advance(&mut self, n: u64);
    /// The pass is complete.
    fn finish(&mut self);
}

/// Reporter that discards all updates.
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _total: u64) {}
    fn advance(&mut self, _n: u64) {}
    fn finish(&mut self) {}
}

/// Batch updates so callers are not notified for every single block.
pub(crate) struct Throttled<'a> {
    inner: &'a mut dyn Progress,
    pending: u64,
}

/// Report at most once per this many units.
const BATCH: u64 = 4096;

impl<'a> Throttled<'a> {
    pub(crate) fn new(inner: &'a mut dyn Progress, total: u64) -> Self {
        inner.start(total);
        Self { inner, pending: 0 }
    }

    pub(crate) fn advance(&mut self, n: u64) {
        self.pending += n;
        if self.pending >= BATCH {
            self.inner.advance(self.pending);
            self.pending = 0;
        }
    }

    pub(crate) fn finish(mut self) {
        if self.pending > 0 {
            self.inner.advance(self.pending);
            self.pending = 0;
        }
        self.inner.finish();
    }
}
