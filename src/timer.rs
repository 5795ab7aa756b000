// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One-shot timers backed by tokio tasks.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Owned handle to an armed one-shot timer.
///
/// Dropping the handle cancels the timer, so replacing the handle stored in
/// an entry is enough to guarantee a single armed timer per entry. Arming
/// requires a running tokio runtime.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Run `callback` once after `delay`.
    pub fn after<F>(delay: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        Self { handle }
    }

    /// Cancel the timer.
    pub fn cancel(self) {
        drop(self);
    }

    /// Whether the timer has fired or been cancelled.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
