/// Token bucket rate limiter for remote kline requests
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

#[derive(Clone)]
pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    bucket: Arc<Mutex<Bucket>>,
}

impl RateLimiter {
    pub fn new(requests_per_second: u32) -> Self {
        Self::with_window(requests_per_second, Duration::from_secs(1))
    }

    /// `capacity` requests per `window`
    pub fn with_window(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1);
        RateLimiter {
            capacity,
            refill_every: window,
            bucket: Arc::new(Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Try to acquire a token, returns true if successful
    pub async fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available, then acquire it
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                (bucket.last_refill + self.refill_every).saturating_duration_since(Instant::now())
            };

            debug!("Rate limit reached, waiting {:?}", wait);
            tokio::time::sleep(wait.max(Duration::from_millis(10))).await;
        }
    }

    /// Get current available tokens
    pub async fn available(&self) -> u32 {
        let mut bucket = self.bucket.lock().await;
        self.refill(&mut bucket);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);

        if elapsed >= self.refill_every {
            let periods = (elapsed.as_secs_f64() / self.refill_every.as_secs_f64()) as u32;
            bucket.tokens = bucket
                .tokens
                .saturating_add(periods.saturating_mul(self.capacity))
                .min(self.capacity);
            bucket.last_refill = now;
        }
    }
}
