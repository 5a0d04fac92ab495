/// Token-bucket rate limiting and bounded fan-out
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// Default request rate against the cloud API.
pub const DEFAULT_CLOUD_RPS: f64 = 10.0;

/// Default concurrency for sibling operations inside a reconcile.
pub const DEFAULT_WORKER_POOL: usize = 8;

/// Token bucket. Refills continuously at `rate` tokens per second up to
/// `burst`; `acquire` suspends until a token is available.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Bucket>>,
    rate: f64,
    burst: f64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Bucket {
                tokens: rate_per_sec,
                last_refill: Instant::now(),
            })),
            rate: rate_per_sec,
            burst: rate_per_sec,
        }
    }

    /// Take one token, sleeping as long as needed.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.inner.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - bucket.tokens) / self.rate))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Run a set of futures with at most `limit` in flight, collecting all
/// results. Failures do not cancel siblings; the first error is returned
/// after everything settles so partial work stays observable.
pub async fn run_bounded<T, F>(limit: usize, futures: Vec<F>) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    let semaphore = Arc::new(Semaphore::new(limit));

    let guarded = futures.into_iter().map(|fut| {
        let semaphore = semaphore.clone();
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| anyhow::anyhow!("worker pool closed"))?;
            fut.await
        }
    });

    let results = futures::future::join_all(guarded).await;

    let mut values = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(v) => values.push(v),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_rate_limiter_allows_burst() {
        let limiter = RateLimiter::new(100.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_rate_limiter_throttles() {
        let limiter = RateLimiter::new(10.0);
        // Drain the burst allowance first.
        for _ in 0..10 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        // 5 more tokens at 10/s needs roughly half a second.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_run_bounded_limits_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..16)
            .map(|_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();

        run_bounded(4, futures).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn test_run_bounded_surfaces_first_error() {
        let futures: Vec<_> = (0..4)
            .map(|i| async move {
                if i == 2 {
                    anyhow::bail!("boom {}", i)
                } else {
                    Ok(i)
                }
            })
            .collect();

        let result = run_bounded(2, futures).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("boom"));
    }
}
