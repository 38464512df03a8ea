use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// An idle timer guarding a flow.
///
/// [`IdleTimer::reset`] returns `false` once the timer has fired. Callers rely
/// on that to distinguish "still fresh" from "about to be reaped", choosing
/// whether to continue writing or drop the in-flight frame.
#[derive(Clone)]
pub struct IdleTimer {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    notify: Notify,
}

struct State {
    ttl: Duration,
    deadline: Instant,
    fired: bool,
}

impl IdleTimer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    ttl,
                    deadline: Instant::now() + ttl,
                    fired: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Pushes the deadline out by the configured TTL.
    pub fn reset(&self) -> bool {
        let mut state = self.inner.state.lock();

        if state.fired {
            return false;
        }

        state.deadline = Instant::now() + state.ttl;

        true
    }

    /// Changes the TTL and re-arms the deadline, e.g. when a flow becomes
    /// partly closed and only needs to drain.
    pub fn set_ttl(&self, ttl: Duration) {
        {
            let mut state = self.inner.state.lock();

            if state.fired {
                return;
            }

            state.ttl = ttl;
            state.deadline = Instant::now() + ttl;
        }

        // A shorter TTL must interrupt an in-flight sleep.
        self.inner.notify.notify_waiters();
    }

    /// Resolves once the timer fires. Fires at most once.
    pub async fn expired(&self) {
        loop {
            let deadline = {
                let mut state = self.inner.state.lock();

                if state.fired {
                    return;
                }

                if Instant::now() >= state.deadline {
                    state.fired = true;

                    return;
                }

                state.deadline
            };

            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                () = self.inner.notify.notified() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_ttl() {
        let timer = IdleTimer::new(Duration::from_secs(1));

        timer.expired().await;

        assert!(!timer.reset());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_pushes_deadline_out() {
        let timer = IdleTimer::new(Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(timer.reset());
        tokio::time::sleep(Duration::from_secs(6)).await;

        // 12s wall time, but the reset at 6s means we have not expired yet.
        let expiry = tokio::time::timeout(Duration::from_secs(3), timer.expired()).await;
        assert!(expiry.is_err(), "timer must not have fired yet");

        timer.expired().await;
        assert!(!timer.reset());
    }

    #[tokio::test(start_paused = true)]
    async fn shortened_ttl_interrupts_sleep() {
        let timer = IdleTimer::new(Duration::from_secs(3600));

        let waiter = tokio::spawn({
            let timer = timer.clone();
            async move { timer.expired().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.set_ttl(Duration::from_secs(5));

        tokio::time::timeout(Duration::from_secs(10), waiter)
            .await
            .expect("timer must fire with the shortened TTL")
            .unwrap();
    }
}
