//! Keep-alive pings and the server-silence watchdog.
//!
//! Both loops count down from their last reset. Outbound traffic resets the
//! ping countdown; inbound traffic resets the watchdog. Pings themselves do
//! not reset the ping countdown, so an idle connection pings exactly once per
//! interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Restart signal for one of the countdowns.
#[derive(Clone, Default)]
pub(crate) struct Activity {
    notify: Arc<Notify>,
}

impl Activity {
    pub(crate) fn reset(&self) {
        self.notify.notify_one();
    }

    pub(super) async fn observed(&self) {
        self.notify.notified().await;
    }
}

/// Outcome of the server timeout watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchdogResult {
    /// Nothing arrived from the server within the timeout.
    TimedOut,
    Cancelled,
}

/// Calls `send_ping` immediately and then every `interval` of outbound
/// silence, until cancelled.
pub(crate) async fn run_ping_loop<F>(
    interval: Duration,
    activity: Activity,
    cancel: CancellationToken,
    mut send_ping: F,
) where
    F: FnMut(),
{
    let mut deadline = Instant::now();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = activity.observed() => deadline = Instant::now() + interval,
            () = time::sleep_until(deadline) => {
                send_ping();
                deadline = Instant::now() + interval;
            }
        }
    }
}

/// Waits until `timeout` passes without any `activity`.
pub(crate) async fn run_server_timeout(
    timeout: Duration,
    activity: Activity,
    cancel: CancellationToken,
) -> WatchdogResult {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return WatchdogResult::Cancelled,
            () = activity.observed() => continue,
            () = time::sleep(timeout) => return WatchdogResult::TimedOut,
        }
    }
}
