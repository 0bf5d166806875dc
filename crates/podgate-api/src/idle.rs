//! Sliding-window idle shutdown timer.
//!
//! Every unit of request activity calls [`IdleTimer::touch`], which pushes the
//! deadline back by the full window. The service shuts down only after a
//! continuous quiet period of the configured duration.
//!
//! The timer task and the touching request tasks share nothing but an atomic
//! generation counter:
//!
//! - `touch` increments the generation and wakes the timer so it re-arms
//! - when the sleep elapses, the timer tries to swap the generation it armed
//!   with for `EXPIRED`
//! - if the swap fails, a touch raced the firing; the fire is stale and the
//!   timer re-arms
//! - if it succeeds, the window really elapsed and the expiry token fires
//!
//! Once expired, the generation stays `EXPIRED` and touches are no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const EXPIRED: u64 = u64::MAX;

#[derive(Debug)]
struct Shared {
    generation: AtomicU64,
    rearm: Notify,
    duration: Duration,
    stopped: CancellationToken,
}

/// Handle to a running idle timer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct IdleTimer {
    shared: Arc<Shared>,
}

impl IdleTimer {
    /// Arms a timer that cancels `expired` after `duration` without a touch.
    ///
    /// A zero duration means "serve forever": no timer is created and `None`
    /// is returned.
    #[must_use]
    pub fn start(duration: Duration, expired: CancellationToken) -> Option<Self> {
        if duration.is_zero() {
            return None;
        }

        let shared = Arc::new(Shared {
            generation: AtomicU64::new(0),
            rearm: Notify::new(),
            duration,
            stopped: CancellationToken::new(),
        });
        tokio::spawn(run(Arc::clone(&shared), expired));
        Some(Self { shared })
    }

    /// Records activity, extending the window. Returns false if the timer
    /// has already expired or been stopped.
    pub fn touch(&self) -> bool {
        if self.shared.stopped.is_cancelled() {
            return false;
        }
        let touched = self
            .shared
            .generation
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |g| {
                (g != EXPIRED).then(|| g.wrapping_add(1) % EXPIRED)
            })
            .is_ok();
        if touched {
            self.shared.rearm.notify_one();
        }
        touched
    }

    /// Returns true once the window has elapsed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.shared.generation.load(Ordering::Acquire) == EXPIRED
    }

    /// Configured window.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.shared.duration
    }

    /// Disarms the timer without firing it.
    pub fn stop(&self) {
        self.shared.stopped.cancel();
    }
}

async fn run(shared: Arc<Shared>, expired: CancellationToken) {
    loop {
        let armed = shared.generation.load(Ordering::Acquire);
        if armed == EXPIRED {
            return;
        }

        tokio::select! {
            () = shared.stopped.cancelled() => return,
            () = shared.rearm.notified() => {}
            () = tokio::time::sleep(shared.duration) => {
                match shared.generation.compare_exchange(
                    armed,
                    EXPIRED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        tracing::info!(
                            idle_timeout = ?shared.duration,
                            "no activity within idle window, shutting down"
                        );
                        expired.cancel();
                        return;
                    }
                    Err(_) => {
                        tracing::trace!("idle timer fired after activity, re-arming");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn zero_duration_creates_no_timer() {
        let expired = CancellationToken::new();
        assert!(IdleTimer::start(Duration::ZERO, expired.clone()).is_none());
        assert!(!expired.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_quiet_window() {
        let expired = CancellationToken::new();
        let timer = IdleTimer::start(WINDOW, expired.clone()).unwrap();

        tokio::time::sleep(WINDOW / 2).await;
        assert!(!expired.is_cancelled());

        tokio::time::timeout(WINDOW, expired.cancelled())
            .await
            .expect("timer should fire");
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn touches_slide_the_window() {
        let expired = CancellationToken::new();
        let timer = IdleTimer::start(WINDOW, expired.clone()).unwrap();

        for _ in 0..10 {
            tokio::time::sleep(WINDOW * 3 / 4).await;
            assert!(timer.touch());
            assert!(!expired.is_cancelled(), "activity must keep the service alive");
        }

        let start = tokio::time::Instant::now();
        expired.cancelled().await;
        assert!(start.elapsed() >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_after_expiry_is_rejected() {
        let expired = CancellationToken::new();
        let timer = IdleTimer::start(WINDOW, expired.clone()).unwrap();

        expired.cancelled().await;
        assert!(!timer.touch());
        assert!(timer.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires() {
        let expired = CancellationToken::new();
        let timer = IdleTimer::start(WINDOW, expired.clone()).unwrap();
        timer.stop();

        tokio::time::sleep(WINDOW * 3).await;
        assert!(!expired.is_cancelled());
        assert!(!timer.touch());
    }
}
