// Copyright (c) The gantry Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use pin_project_lite::pin_project;
use std::{future::Future, pin::Pin, task::Poll, time::Duration};
use tokio::time::{Instant, Sleep};

/// Creates a deadline `timeout` from now. A zero timeout disables the
/// deadline (it fires in the far future).
pub(crate) fn deadline(timeout: Duration) -> Deadline {
    let timeout = if timeout.is_zero() {
        far_future_duration()
    } else {
        timeout
    };
    Deadline {
        sleep: tokio::time::sleep(timeout),
    }
}

pin_project! {
    /// A wrapper around `tokio::time::Sleep` whose deadline can be moved
    /// while an operation races against it.
    #[derive(Debug)]
    pub(crate) struct Deadline {
        #[pin]
        sleep: Sleep,
    }
}

impl Deadline {
    /// Time left until the deadline fires. Zero if it has already passed.
    pub(crate) fn remaining(&self) -> Duration {
        self.sleep.deadline().saturating_duration_since(Instant::now())
    }

    /// Moves the deadline to `timeout` from now. A zero timeout disables
    /// the deadline.
    pub(crate) fn reset(self: Pin<&mut Self>, timeout: Duration) {
        let timeout = if timeout.is_zero() {
            far_future_duration()
        } else {
            timeout
        };
        self.project().sleep.reset(Instant::now() + timeout);
    }
}

impl Future for Deadline {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.project().sleep.poll(cx)
    }
}

/// The outcome of racing an operation against a deadline.
#[derive(Debug)]
#[must_use = "a timed-out operation must be handled"]
pub(crate) enum DeadlineOutcome<T> {
    /// The operation settled first.
    Completed(T),

    /// The deadline fired first. The operation was not cancelled; the
    /// caller stops observing it and its settlement is ignored.
    TimedOut,
}

/// Races `op` against the deadline.
///
/// The deadline is taken as `Pin<&mut _>` so the caller can keep it alive
/// across several races (test body, then teardown) and move it in between.
pub(crate) async fn with_deadline<F: Future>(
    mut deadline: Pin<&mut Deadline>,
    op: F,
) -> DeadlineOutcome<F::Output> {
    tokio::pin!(op);
    tokio::select! {
        out = &mut op => DeadlineOutcome::Completed(out),
        () = &mut deadline => DeadlineOutcome::TimedOut,
    }
}

// Cribbed from tokio: large enough to never fire, small enough not to
// overflow Instant arithmetic on any supported platform.
pub(crate) const fn far_future_duration() -> Duration {
    Duration::from_secs(86400 * 365 * 30)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_before_deadline() {
        let mut dl = std::pin::pin!(deadline(Duration::from_secs(5)));
        let outcome = with_deadline(dl.as_mut(), async { 7 }).await;
        assert!(matches!(outcome, DeadlineOutcome::Completed(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let mut dl = std::pin::pin!(deadline(Duration::from_millis(100)));
        let outcome = with_deadline(dl.as_mut(), std::future::pending::<()>()).await;
        assert!(matches!(outcome, DeadlineOutcome::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_disables() {
        let dl = deadline(Duration::ZERO);
        assert!(dl.remaining() > Duration::from_secs(86400));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_extends_across_teardown() {
        let mut dl = std::pin::pin!(deadline(Duration::from_millis(50)));
        let outcome = with_deadline(dl.as_mut(), std::future::pending::<()>()).await;
        assert!(matches!(outcome, DeadlineOutcome::TimedOut));

        // A second race on the same deadline, after extending it.
        dl.as_mut().reset(Duration::from_secs(10));
        let outcome = with_deadline(dl.as_mut(), async { "done" }).await;
        assert!(matches!(outcome, DeadlineOutcome::Completed("done")));
    }
}
