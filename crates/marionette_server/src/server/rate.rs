#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Instant;

use marionette_domain::FriendCode;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct TokenBucket {
	capacity: f64,
	tokens: f64,
	refill_per_sec: f64,
	last: Instant,
}

impl TokenBucket {
	fn new(capacity: u32, refill_per_minute: u32) -> Option<Self> {
		if capacity == 0 || refill_per_minute == 0 {
			return None;
		}
		Some(Self {
			capacity: capacity as f64,
			tokens: capacity as f64,
			refill_per_sec: refill_per_minute as f64 / 60.0,
			last: Instant::now(),
		})
	}

	fn allow(&mut self) -> bool {
		let now = Instant::now();
		let elapsed = now.duration_since(self.last).as_secs_f64();
		if elapsed > 0.0 {
			self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
			self.last = now;
		}
		if self.tokens >= 1.0 {
			self.tokens -= 1.0;
			true
		} else {
			false
		}
	}
}

/// Per-identity token bucket over action requests. A burst or rate of
/// zero disables limiting entirely.
#[derive(Debug)]
pub struct ActionRateLimiter {
	buckets: Mutex<HashMap<FriendCode, TokenBucket>>,
	burst: u32,
	per_minute: u32,
	max_identities: usize,
}

impl ActionRateLimiter {
	pub fn new(burst: u32, per_minute: u32) -> Self {
		Self {
			buckets: Mutex::new(HashMap::new()),
			burst,
			per_minute,
			max_identities: 4096,
		}
	}

	pub fn unlimited() -> Self {
		Self::new(0, 0)
	}

	pub async fn allow(&self, identity: &FriendCode) -> bool {
		let Some(fresh) = TokenBucket::new(self.burst, self.per_minute) else {
			return true;
		};

		let mut buckets = self.buckets.lock().await;

		if buckets.len() >= self.max_identities && !buckets.contains_key(identity) {
			buckets.clear();
		}

		buckets.entry(identity.clone()).or_insert(fresh).allow()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn code(s: &str) -> FriendCode {
		s.parse().expect("friend code")
	}

	#[tokio::test]
	async fn burst_is_consumed_then_denied() {
		let limiter = ActionRateLimiter::new(2, 1);
		let who = code("AAAA-0001");
		assert!(limiter.allow(&who).await);
		assert!(limiter.allow(&who).await);
		assert!(!limiter.allow(&who).await);
	}

	#[tokio::test]
	async fn identities_are_limited_independently() {
		let limiter = ActionRateLimiter::new(1, 1);
		assert!(limiter.allow(&code("AAAA-0001")).await);
		assert!(!limiter.allow(&code("AAAA-0001")).await);
		assert!(limiter.allow(&code("BBBB-0002")).await);
	}

	#[tokio::test]
	async fn zero_config_disables_limiting() {
		let limiter = ActionRateLimiter::unlimited();
		let who = code("AAAA-0001");
		for _ in 0..100 {
			assert!(limiter.allow(&who).await);
		}
	}
}
