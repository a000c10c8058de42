//! Adaptive token-bucket rate limiter (spec §4.3): a single process-wide
//! instance every worker calls `acquire()` on before hitting the Fetcher.

use std::sync::Mutex;

use rand::Rng;
use tokio::time::Duration;
use tracing::debug;

use crate::clock::now_nanos;
use crate::config::RateLimiterConfig;
use crate::model::RateLimiterState;
use crate::store::{Store, StoreError};

/// Approach factor toward `last_congestion_rate` the success-streak ramp
/// stops short of (spec §4.3: "until it approaches 0.9 · last_congestion_rate").
const CONGESTION_APPROACH_FACTOR: f64 = 0.9;

/// Consecutive successes required before the ramp applies.
const SUCCESS_STREAK_THRESHOLD: u32 = 10;

const CONGESTION_RATE_MULTIPLIER: f64 = 0.5;
const RAMP_RATE_MULTIPLIER: f64 = 1.05;
const JITTER_GROWTH_ON_CONGESTION: f64 = 1.5;

struct Inner {
    tokens: f64,
    rate: f64,
    bucket_size: f64,
    min_rate: f64,
    max_rate: f64,
    last_congestion_rate: Option<f64>,
    jitter: f64,
    last_used_at: i64,
    total_acquired: i64,
    total_congestion_events: i64,
    success_streak: u32,
}

/// Adaptive token bucket, persisted to the Store on every mutation so a
/// restart resumes at the rate it left off at rather than re-warming.
pub struct RateLimiter {
    store: Store,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    /// Load persisted state, or seed from `config` on first run.
    pub async fn load(store: Store, config: &RateLimiterConfig) -> Result<Self, StoreError> {
        let inner = match store.load_rate_limiter_state().await? {
            Some(state) => Inner {
                tokens: state.tokens,
                rate: state.rate,
                bucket_size: state.bucket_size,
                min_rate: config.min_rate,
                max_rate: config.max_rate,
                last_congestion_rate: state.last_congestion_rate,
                jitter: state.jitter,
                last_used_at: state.last_used_at,
                total_acquired: state.total_acquired,
                total_congestion_events: state.total_congestion_events,
                success_streak: 0,
            },
            None => Inner {
                tokens: config.bucket_size,
                rate: config.initial_rate,
                bucket_size: config.bucket_size,
                min_rate: config.min_rate,
                max_rate: config.max_rate,
                last_congestion_rate: None,
                jitter: config.jitter,
                last_used_at: now_nanos(),
                total_acquired: 0,
                total_congestion_events: 0,
                success_streak: 0,
            },
        };
        let limiter = Self {
            store,
            inner: Mutex::new(inner),
        };
        limiter.persist().await?;
        Ok(limiter)
    }

    /// Spec §4.3 `acquire()`: refill, consume one token, sleep the jitter
    /// window; loop with a computed wait if the bucket is dry.
    pub async fn acquire(&self) {
        loop {
            let (took_token, sleep_for) = {
                let mut state = self.inner.lock().expect("rate limiter mutex poisoned");
                let now = now_nanos();
                let elapsed_secs = (now - state.last_used_at).max(0) as f64 / 1_000_000_000.0;
                state.tokens = (state.tokens + elapsed_secs * state.rate).min(state.bucket_size);
                state.last_used_at = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    state.total_acquired += 1;
                    let jitter_sleep = if state.jitter > 0.0 {
                        rand::thread_rng().gen_range(0.0..state.jitter)
                    } else {
                        0.0
                    };
                    (true, jitter_sleep)
                } else {
                    let wait = (1.0 - state.tokens) / state.rate;
                    (false, wait)
                }
            };

            if sleep_for > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(sleep_for)).await;
            }

            if took_token {
                if let Err(e) = self.persist().await {
                    debug!(error = %e, "failed to persist rate limiter state after acquire");
                }
                return;
            }
        }
    }

    /// Spec §4.3 `on_response(status)`: congestion backoff or success ramp.
    pub async fn on_response(&self, status: u16, connection_congested: bool) {
        let is_congestion = status == 429 || status == 503 || connection_congested;
        {
            let mut state = self.inner.lock().expect("rate limiter mutex poisoned");
            if is_congestion {
                state.last_congestion_rate = Some(state.rate);
                state.rate = (state.rate * CONGESTION_RATE_MULTIPLIER).max(state.min_rate);
                state.jitter *= JITTER_GROWTH_ON_CONGESTION;
                state.total_congestion_events += 1;
                state.success_streak = 0;
            } else {
                state.success_streak += 1;
                if state.success_streak >= SUCCESS_STREAK_THRESHOLD {
                    let ceiling = state
                        .last_congestion_rate
                        .map(|r| r * CONGESTION_APPROACH_FACTOR)
                        .unwrap_or(state.max_rate);
                    if state.rate < ceiling {
                        state.rate = (state.rate * RAMP_RATE_MULTIPLIER).min(ceiling).min(state.max_rate);
                    }
                }
            }
        }
        if let Err(e) = self.persist().await {
            debug!(error = %e, "failed to persist rate limiter state after on_response");
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let snapshot = {
            let state = self.inner.lock().expect("rate limiter mutex poisoned");
            RateLimiterState {
                tokens: state.tokens,
                rate: state.rate,
                bucket_size: state.bucket_size,
                last_congestion_rate: state.last_congestion_rate,
                jitter: state.jitter,
                last_used_at: state.last_used_at,
                total_acquired: state.total_acquired,
                total_congestion_events: state.total_congestion_events,
            }
        };
        self.store.save_rate_limiter_state(&snapshot).await
    }

    pub fn current_rate(&self) -> f64 {
        self.inner.lock().expect("rate limiter mutex poisoned").rate
    }
}
