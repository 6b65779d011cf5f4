// SPDX-License-Identifier: GPL-3.0-only

//! Deferred cleanup jobs run in reverse order of registration

use tracing::warn;

use crate::error::Result;

/// A deferred cleanup step
pub type Cleaner<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum When {
    Always,
    OnError,
    OnSuccess,
}

/// LIFO stack of cleanup jobs.
///
/// The primary error always wins. A cleanup error is only returned when the
/// guarded operation succeeded, and then only the first one; later failures
/// are logged.
#[derive(Default)]
pub struct CleanStack<'a> {
    jobs: Vec<(When, Cleaner<'a>)>,
}

impl<'a> CleanStack<'a> {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Runs on every exit
    pub fn push<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push((When::Always, Box::new(job)));
    }

    /// Runs only when the guarded operation failed
    pub fn push_error_only<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push((When::OnError, Box::new(job)));
    }

    /// Runs only when the guarded operation succeeded
    pub fn push_success_only<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<()> + 'a,
    {
        self.jobs.push((When::OnSuccess, Box::new(job)));
    }

    pub fn push_cleaner(&mut self, cleaner: Cleaner<'a>) {
        self.jobs.push((When::Always, cleaner));
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Drains the stack against the outcome of the guarded operation
    pub fn cleanup<T>(mut self, result: Result<T>) -> Result<T> {
        let failed = result.is_err();
        let mut cleanup_err = None;

        while let Some((when, job)) = self.jobs.pop() {
            let due = match when {
                When::Always => true,
                When::OnError => failed,
                When::OnSuccess => !failed,
            };
            if !due {
                continue;
            }
            if let Err(err) = job() {
                if failed || cleanup_err.is_some() {
                    warn!("cleanup failed: {err}");
                } else {
                    cleanup_err = Some(err);
                }
            }
        }

        match (result, cleanup_err) {
            (Ok(_), Some(err)) => Err(err),
            (result, _) => result,
        }
    }
}
