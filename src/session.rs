//! Progress reporting and cooperative cancellation for one import.
//!
//! An [`ImportSession`] is created per import invocation and passed by
//! `&mut` through archive reads and orchestrators. Progress is a fraction in
//! `[0, 1]` that never decreases; cancellation is polled before every
//! tensor decode.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag that requests an import to stop.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type ProgressFn = Box<dyn FnMut(f32) + Send>;

/// Counters, progress sink and cancellation flag for a single import.
pub struct ImportSession {
    progress: Option<ProgressFn>,
    cancel: CancellationToken,
    accessed: usize,
    expected: usize,
    reported: f32,
}

impl Default for ImportSession {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ImportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportSession")
            .field("accessed", &self.accessed)
            .field("expected", &self.expected)
            .field("reported", &self.reported)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ImportSession {
    /// Session without a progress sink.
    pub fn new() -> Self {
        Self {
            progress: None,
            cancel: CancellationToken::new(),
            accessed: 0,
            expected: 0,
            reported: 0.0,
        }
    }

    /// Attach a progress callback receiving fractions in `[0, 1]`.
    pub fn with_progress(mut self, callback: impl FnMut(f32) + Send + 'static) -> Self {
        self.progress = Some(Box::new(callback));
        self
    }

    /// Share an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that cancels this session when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Set the number of tensor reads expected for access-driven progress.
    pub fn expect_accesses(&mut self, expected: usize) {
        self.expected = expected;
        self.accessed = 0;
    }

    /// Number of tensor reads made so far.
    pub fn accessed(&self) -> usize {
        self.accessed
    }

    /// Interrupt hook polled before each tensor decode.
    ///
    /// Counts the access and, when an expected total is known, reports
    /// `0.05 + accessed / expected * 0.95`.
    pub fn poll(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        self.accessed += 1;
        if self.expected > 0 {
            let fraction = 0.05 + (self.accessed as f32 / self.expected as f32) * 0.95;
            self.report(fraction);
        }
        Ok(())
    }

    /// Fail with [`Error::Interrupted`] if cancellation was requested.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Report a fraction; values below the last report are ignored.
    pub fn report(&mut self, fraction: f32) {
        let fraction = fraction.clamp(0.0, 1.0);
        if fraction <= self.reported {
            return;
        }
        self.reported = fraction;
        if let Some(callback) = self.progress.as_mut() {
            callback(fraction);
        }
    }

    /// Report progress as `current / total`.
    pub fn report_count(&mut self, current: usize, total: usize) {
        if total > 0 {
            self.report(current as f32 / total as f32);
        }
    }

    /// Last reported fraction.
    pub fn fraction(&self) -> f32 {
        self.reported
    }

    /// Mark the import complete.
    pub fn finish(&mut self) {
        self.report(1.0);
    }
}
