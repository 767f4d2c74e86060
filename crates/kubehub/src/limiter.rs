use std::{
    sync::{Mutex, PoisonError},
    time::Duration,
};

use tokio::time::Instant;

/// Token bucket: holds at most `burst` tokens and regains one per `refill`.
/// Starts full. Time comes from tokio so paused-clock tests are exact.
#[derive(Debug)]
pub struct TokenBucket {
    burst: u32,
    refill: Duration,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    /// When the last whole token was credited (or the bucket was last seen full).
    last: Instant,
}

impl TokenBucket {
    pub fn new(burst: u32, refill: Duration) -> Self {
        Self {
            burst,
            refill: refill.max(Duration::from_nanos(1)),
            state: Mutex::new(Bucket { tokens: burst, last: Instant::now() }),
        }
    }

    pub fn burst(&self) -> u32 { self.burst }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let mut bucket = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.advance(&mut bucket);
        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn available(&self) -> u32 {
        let mut bucket = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        self.advance(&mut bucket);
        bucket.tokens
    }

    fn advance(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        if bucket.tokens >= self.burst {
            bucket.last = now;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.last);
        let gained = elapsed.as_nanos() / self.refill.as_nanos();
        if gained == 0 {
            return;
        }
        let missing = u128::from(self.burst - bucket.tokens);
        if gained >= missing {
            bucket.tokens = self.burst;
            bucket.last = now;
        } else {
            // gained < burst here, so it fits in u32
            let gained = gained as u32;
            bucket.tokens += gained;
            bucket.last += self.refill * gained;
        }
    }
}
