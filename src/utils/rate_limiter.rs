// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use leaky_bucket::RateLimiter;
use tracing::warn;

/// Token bucket handing out reservations, backed by a
/// [`leaky_bucket::RateLimiter`].
///
/// The bucket starts full and refills one token every `1s / rate` up to
/// `burst`. A reservation of more than `burst` tokens can never be
/// satisfied and is rejected up front.
pub struct TokenBucket {
    rate: u64,
    burst: u64,
    limiter: RateLimiter,
}

impl TokenBucket {
    pub fn new(rate: u64, burst: u64) -> Self {
        let max = usize::try_from(burst.max(1)).unwrap_or(usize::MAX);
        let limiter = RateLimiter::builder()
            .initial(max)
            .refill(1)
            .interval(refill_interval(rate))
            .max(max)
            .build();
        TokenBucket {
            rate,
            burst,
            limiter,
        }
    }

    /// Bucket whose burst equals its per-second rate.
    pub fn per_second(rate: u64) -> Self {
        Self::new(rate, rate)
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }

    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Reserves `n` tokens.
    ///
    /// Returns `None` if the reservation can never be granted. Otherwise the
    /// returned future completes once the tokens have been taken from the
    /// bucket, immediately when enough are available.
    pub fn reserve(&self, n: u64) -> Option<impl Future<Output = ()> + '_> {
        if self.rate == 0 || n > self.burst {
            return None;
        }
        let permits = usize::try_from(n).ok()?;
        Some(self.limiter.acquire(permits))
    }

    /// Takes `n` tokens only if they are available right now.
    pub fn try_reserve(&self, n: u64) -> bool {
        if self.rate == 0 || n > self.burst {
            return false;
        }
        usize::try_from(n).map_or(false, |permits| self.limiter.try_acquire(permits))
    }

    /// Reserves `n` tokens and waits for them.
    ///
    /// Returns `false` when the reservation was rejected; the caller then
    /// proceeds unregulated.
    pub async fn wait(&self, n: u64) -> bool {
        match self.reserve(n) {
            Some(acquire) => {
                acquire.await;
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("burst", &self.burst)
            .finish()
    }
}

fn refill_interval(rate: u64) -> Duration {
    if rate == 0 {
        return Duration::from_secs(1);
    }
    Duration::from_nanos((1_000_000_000 / rate).max(1))
}

/// Send and receive buckets applied by the message codec.
///
/// Both buckets share the same rate, with a burst equal to the rate. A rate
/// of zero disables throttling entirely.
#[derive(Debug, Default)]
pub struct IoRateLimiter {
    send: Option<TokenBucket>,
    recv: Option<TokenBucket>,
}

impl IoRateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        if bytes_per_sec == 0 {
            return Self::disabled();
        }
        IoRateLimiter {
            send: Some(TokenBucket::per_second(bytes_per_sec)),
            recv: Some(TokenBucket::per_second(bytes_per_sec)),
        }
    }

    pub fn disabled() -> Self {
        IoRateLimiter {
            send: None,
            recv: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.send.is_some() || self.recv.is_some()
    }

    pub async fn throttle_send(&self, bytes: usize) {
        if let Some(bucket) = &self.send {
            if !bucket.wait(bytes as u64).await {
                warn!(
                    bytes,
                    burst = bucket.burst(),
                    "send rate limiter rejected reservation, sending unregulated"
                );
            }
        }
    }

    pub async fn throttle_recv(&self, bytes: usize) {
        if let Some(bucket) = &self.recv {
            if !bucket.wait(bytes as u64).await {
                warn!(
                    bytes,
                    burst = bucket.burst(),
                    "receive rate limiter rejected reservation, reading unregulated"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn full_bucket_grants_immediately() {
        let bucket = TokenBucket::per_second(100);
        assert!(bucket.try_reserve(100));
        assert!(!bucket.try_reserve(1));
    }

    #[tokio::test(start_paused = true)]
    async fn drained_bucket_delays_the_next_reservation() {
        let bucket = TokenBucket::per_second(100);
        let start = Instant::now();
        assert!(bucket.wait(100).await);
        assert_eq!(Instant::now(), start);

        assert!(bucket.wait(50).await);
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_millis(490), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(600), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_reservation_is_rejected() {
        let bucket = TokenBucket::per_second(10);
        assert!(bucket.reserve(11).is_none());
        assert!(!bucket.try_reserve(11));
        let start = Instant::now();
        assert!(!bucket.wait(11).await);
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_rate_rejects_everything() {
        let bucket = TokenBucket::per_second(0);
        assert!(bucket.reserve(0).is_none());
        assert!(!bucket.wait(1).await);
    }

    #[test]
    fn refill_interval_spreads_tokens_over_a_second() {
        assert_eq!(refill_interval(100), Duration::from_millis(10));
        assert_eq!(refill_interval(1_000_000), Duration::from_micros(1));
        assert_eq!(refill_interval(u64::MAX), Duration::from_nanos(1));
    }

    #[tokio::test]
    async fn disabled_limiter_never_throttles() {
        let limiter = IoRateLimiter::new(0);
        assert!(!limiter.is_enabled());
        let start = std::time::Instant::now();
        limiter.throttle_send(10 * 1024 * 1024).await;
        limiter.throttle_recv(10 * 1024 * 1024).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_recv_buckets_are_independent() {
        let limiter = IoRateLimiter::new(1000);
        let start = Instant::now();
        limiter.throttle_send(1000).await;
        limiter.throttle_recv(1000).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_reservation_passes_through() {
        let limiter = IoRateLimiter::new(10);
        let start = Instant::now();
        limiter.throttle_send(11).await;
        limiter.throttle_recv(11).await;
        assert_eq!(Instant::now(), start);
    }
}
