//! Jittered scan-loop helper shared by the prober, subscription scheduler,
//! and lease cleaner (spec §9 Design Notes: "a single helper that takes
//! (stopCh, minInterval, jitterRange, fn) and loops; avoids per-component
//! reimplementation and races on timer reset").

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Runs `pass` repeatedly, sleeping `min_interval + U[0, jitter_range)`
/// between passes, until `stop` is cancelled. The sleep is interrupted
/// immediately on cancellation rather than run to completion.
pub async fn scan_loop<F, Fut>(stop: CancellationToken, min_interval: Duration, jitter_range: Duration, mut pass: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        if stop.is_cancelled() {
            return;
        }
        pass().await;
        let jitter = if jitter_range.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..jitter_range)
        };
        let sleep = min_interval + jitter;
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(sleep) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_until_cancelled() {
        let stop = CancellationToken::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        let stop2 = stop.clone();
        let handle = tokio::spawn(async move {
            scan_loop(stop2, Duration::from_millis(1), Duration::from_millis(1), || {
                let c2 = c2.clone();
                async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        handle.await.unwrap();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn stops_immediately_when_cancelled_up_front() {
        let stop = CancellationToken::new();
        stop.cancel();
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        scan_loop(stop, Duration::from_millis(1), Duration::from_millis(1), || {
            let c2 = c2.clone();
            async move {
                c2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
