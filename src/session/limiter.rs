//! Bandwidth limiting for file bodies
// (c) 2025 Ross Younger

use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Sleeps shorter than this are deferred rather than issued; a storm of
/// sub-10ms sleeps costs more in syscalls than it buys in smoothness.
const MIN_SLEEP: Duration = Duration::from_millis(10);

/// A token-bucket style rate limiter for the transfer hot path.
///
/// Call [`limit`](Self::limit) after each chunk of I/O; once the running
/// byte count exceeds the per-interval allowance the calling task sleeps
/// long enough to bring the average rate back to target.
#[derive(Debug)]
pub struct BandwidthLimiter {
    /// Target rate, bits per second
    rate_bps: u64,
    /// Bytes to accumulate before considering a sleep
    thresh: u64,
    /// Bytes transferred in the current accounting window
    accumulated: u64,
    /// Start of the current accounting window
    window_start: Option<Instant>,
}

impl BandwidthLimiter {
    /// Creates a limiter for `limit_kbps` kilobits per second, with the
    /// check interval tied to the I/O block size.
    #[must_use]
    pub fn new(limit_kbps: u64, buflen: usize) -> Self {
        let rate_bps = limit_kbps.saturating_mul(1024);
        // check roughly every block, or every ~100ms of data, whichever is larger
        let thresh = (buflen as u64).max(rate_bps / 8 / 10).max(1);
        Self {
            rate_bps,
            thresh,
            accumulated: 0,
            window_start: None,
        }
    }

    /// How long the window's traffic should have taken at the target rate,
    /// less the time it actually took. `None` means no sleep is due.
    fn required_delay(&self, elapsed: Duration) -> Option<Duration> {
        #[allow(clippy::cast_precision_loss)]
        let target =
            Duration::from_secs_f64((self.accumulated * 8) as f64 / self.rate_bps as f64);
        target.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Accounts for `bytes` just transferred, sleeping if we are ahead of
    /// the target rate.
    pub async fn limit(&mut self, bytes: u64) {
        self.accumulated += bytes;
        let Some(start) = self.window_start else {
            self.window_start = Some(Instant::now());
            return;
        };
        if self.accumulated < self.thresh {
            return;
        }
        match self.required_delay(start.elapsed()) {
            Some(delay) if delay < MIN_SLEEP => {
                // too small to be worth a syscall; widen the window instead
                self.thresh = self.thresh.saturating_mul(2);
            }
            Some(delay) => {
                trace!("bandwidth limiter sleeping {delay:?}");
                tokio::time::sleep(delay).await;
                self.accumulated = 0;
                self.window_start = Some(Instant::now());
            }
            None => {
                // running at or below target; start a fresh window
                self.accumulated = 0;
                self.window_start = Some(Instant::now());
            }
        }
    }
}
