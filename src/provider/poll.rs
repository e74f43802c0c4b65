//! Bounded wait for asynchronous vendor state changes
//!
//! Vendor CLIs return as soon as a connect/disconnect has been *requested*,
//! while the tunnel takes seconds to follow. Adapters issue the command
//! (`Initiating`) and then call [`wait_for`], which re-probes the status at a
//! fixed interval (`Polling`) until the condition holds (`Established`) or the
//! wall-clock cap is hit (`TimedOut`). Both end states are normal returns: the
//! caller inspects the final [`Status`], never an error.
//!
//! Dropping the returned future stops polling immediately. The command that was
//! already issued is not retracted.

use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, timeout_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::Status;

/// Poll interval and hard cap for one bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_wait: Duration) -> Self {
        Self { interval, max_wait }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Terminal state of a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Established(Status),
    /// Cap elapsed; carries the last observed status
    TimedOut(Status),
}

impl PollOutcome {
    pub fn is_established(&self) -> bool {
        matches!(self, PollOutcome::Established(_))
    }

    pub fn into_status(self) -> Status {
        match self {
            PollOutcome::Established(status) | PollOutcome::TimedOut(status) => status,
        }
    }
}

/// Probe until `done` holds or `policy.max_wait` elapses.
///
/// The cap also bounds a probe that is still running: it is dropped and the
/// status seen before it is returned. `what` only labels the debug log lines.
pub async fn wait_for<P, Fut, D>(what: &str, policy: PollPolicy, mut probe: P, done: D) -> PollOutcome
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Status>,
    D: Fn(&Status) -> bool,
{
    let deadline = Instant::now() + policy.max_wait;
    let mut ticker = tokio::time::interval(policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut last = Status::disconnected();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let Ok(status) = timeout_at(deadline, probe()).await else {
            debug!("{}: probe still running after {:?}", what, policy.max_wait);
            return PollOutcome::TimedOut(last);
        };
        if done(&status) {
            debug!("{}: condition reached after {} attempt(s)", what, attempt);
            return PollOutcome::Established(status);
        }
        debug!(
            "{}: attempt {}: connected={}, ip={:?}",
            what, attempt, status.connected, status.ip
        );

        tokio::select! {
            biased;
            _ = sleep_until(deadline) => {
                debug!("{}: gave up after {:?}", what, policy.max_wait);
                return PollOutcome::TimedOut(status);
            }
            _ = ticker.tick() => {}
        }
        last = status;
    }
}

/// Wait until the tunnel is up with an IP assigned
pub async fn wait_connected<P, Fut>(what: &str, policy: PollPolicy, probe: P) -> PollOutcome
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Status>,
{
    wait_for(what, policy, probe, Status::is_established).await
}

/// Wait until the tunnel is down and its IP released
pub async fn wait_disconnected<P, Fut>(what: &str, policy: PollPolicy, probe: P) -> PollOutcome
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Status>,
{
    wait_for(what, policy, probe, Status::is_torn_down).await
}
