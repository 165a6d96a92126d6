//! Idle-timeout supervision
//!
//! A supervised resource owns an [`IdleTimer`] and implements [`IdleClose`].
//! The supervisor task holds only a weak reference, so it never keeps the
//! resource alive and exits once the resource is dropped or closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::logger::log;

/// Last-activity clock with its threshold
#[derive(Debug)]
pub struct IdleTimer {
    origin: Instant,
    last_active_ms: AtomicU64,
    threshold: Duration,
    tick: Duration,
}

impl IdleTimer {
    pub fn new(threshold: Duration, tick: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            threshold,
            tick,
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Reset the idle clock
    pub fn mark_active(&self) {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_active_ms.store(elapsed, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        let last = self.last_active_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() > self.threshold
    }
}

/// A closable resource under idle supervision
pub trait IdleClose: Send + Sync + 'static {
    fn idle_timer(&self) -> &IdleTimer;

    /// False once the resource released its transport
    fn is_open(&self) -> bool;

    fn close(&self);

    fn name(&self) -> &'static str {
        "connection"
    }
}

/// Start the supervisor for `owner`.
///
/// Ticks every `tick`; closes the owner exactly once when idle past the
/// threshold, then ends. Ends early if the owner is dropped or closed.
pub fn open_supervision<T: IdleClose>(owner: &Arc<T>) -> JoinHandle<()> {
    let weak: Weak<T> = Arc::downgrade(owner);
    let tick = owner.idle_timer().tick;
    owner.idle_timer().mark_active();

    tokio::spawn(async move {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(owner) = weak.upgrade() else { break };
            if !owner.is_open() {
                break;
            }
            let timer = owner.idle_timer();
            if timer.is_expired() {
                log::debug!(
                    resource = owner.name(),
                    idle_secs = timer.idle_for().as_secs(),
                    "Idle timeout, closing"
                );
                owner.close();
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct Probe {
        timer: IdleTimer,
        open: AtomicBool,
        closes: AtomicUsize,
    }

    impl Probe {
        fn new(threshold: u64) -> Arc<Self> {
            Arc::new(Self {
                timer: IdleTimer::new(Duration::from_secs(threshold), Duration::from_secs(1)),
                open: AtomicBool::new(true),
                closes: AtomicUsize::new(0),
            })
        }
    }

    impl IdleClose for Probe {
        fn idle_timer(&self) -> &IdleTimer {
            &self.timer
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_resource_closed_exactly_once() {
        let probe = Probe::new(20);
        let handle = open_supervision(&probe);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.await.unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_defers_timeout() {
        let probe = Probe::new(20);
        let _handle = open_supervision(&probe);

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            probe.timer.mark_active();
        }
        assert_eq!(probe.closes.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(22)).await;
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_exits_when_closed_elsewhere() {
        let probe = Probe::new(20);
        let handle = open_supervision(&probe);

        probe.close();
        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.await.unwrap();
        assert_eq!(probe.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_does_not_keep_owner_alive() {
        let probe = Probe::new(20);
        let handle = open_supervision(&probe);
        let weak = Arc::downgrade(&probe);
        drop(probe);

        tokio::time::sleep(Duration::from_secs(2)).await;
        handle.await.unwrap();
        assert!(weak.upgrade().is_none());
    }
}
