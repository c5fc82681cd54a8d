//! Fixed-period flush scheduler.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FlusherError {
    #[error("flush period must be greater than zero")]
    ZeroPeriod,
}

/// Runs a flush callback every `period` on one background task.
///
/// The first tick fires one period after start. Ticks run sequentially; a
/// flush that overruns delays the next tick instead of bursting.
#[derive(Debug)]
pub struct PeriodicFlusher {
    period: Duration,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PeriodicFlusher {
    pub fn start<F, Fut>(period: Duration, mut flush: F) -> Result<Self, FlusherError>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(FlusherError::ZeroPeriod);
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => flush().await,
                }
            }
            debug!("periodic flusher exited");
        });

        Ok(Self {
            period,
            cancel,
            task: Some(task),
        })
    }

    pub(crate) fn period(&self) -> Duration {
        self.period
    }

    /// Admit no further ticks and wait for an in-flight flush to finish.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "periodic flusher task failed");
            }
        }
    }
}

impl Drop for PeriodicFlusher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test]
    async fn zero_period_is_rejected() {
        let err = PeriodicFlusher::start(Duration::ZERO, || async {}).unwrap_err();
        assert_eq!(err, FlusherError::ZeroPeriod);
    }

    #[tokio::test]
    async fn first_tick_waits_one_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut flusher =
            PeriodicFlusher::start(Duration::from_millis(300), counting(&ticks)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 1);
        flusher.stop().await;
    }

    #[tokio::test]
    async fn stop_admits_no_further_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut flusher = PeriodicFlusher::start(Duration::from_millis(20), counting(&ticks)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        flusher.stop().await;
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_flush() {
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let (s, f) = (Arc::clone(&started), Arc::clone(&finished));
        let mut flusher = PeriodicFlusher::start(Duration::from_millis(20), move || {
            let (s, f) = (Arc::clone(&s), Arc::clone(&f));
            async move {
                s.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                f.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();

        while !started.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        flusher.stop().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn slow_flushes_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let mut flusher = PeriodicFlusher::start(Duration::from_millis(10), move || {
            let (a, p) = (Arc::clone(&a), Arc::clone(&p));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        flusher.stop().await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
