use std::time::Instant;

/// Token bucket with continuous refill. Used for CPU-time budgeting, so
/// tokens are milliseconds.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    pub fn consume(&mut self, amount: f64) -> bool {
        self.consume_at(amount, Instant::now())
    }

    pub(crate) fn consume_at(&mut self, amount: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }

    /// Milliseconds until `amount` tokens will be available.
    pub fn wait_time_ms(&mut self, amount: f64) -> u64 {
        self.wait_time_ms_at(amount, Instant::now())
    }

    pub(crate) fn wait_time_ms_at(&mut self, amount: f64, now: Instant) -> u64 {
        self.refill(now);
        if self.tokens >= amount {
            return 0;
        }
        let deficit = amount - self.tokens;
        if self.refill_rate <= 0.0 {
            return u64::MAX;
        }
        (deficit / self.refill_rate * 1_000.0).ceil() as u64
    }
}
