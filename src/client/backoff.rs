/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use rand::Rng;
use std::{sync::Mutex, time::Duration};

/// A uniform sampler over an inclusive range, injectable so backoff sequences
/// are deterministic under test.
pub(crate) type JitterSampler = Box<dyn Fn(f64, f64) -> f64 + Send + Sync>;

fn thread_rng_sampler() -> JitterSampler {
    Box::new(|lo, hi| rand::rng().random_range(lo..=hi))
}

#[derive(Clone)]
pub(crate) struct BackoffConfig {
    /// The amount of time to backoff after the first failure.
    pub base_delay: Duration,

    /// The factor with which to multiply backoffs after a failed retry.
    /// Should ideally be greater than 1.
    pub multiplier: f64,

    /// The factor with which backoffs are randomized.
    pub jitter: f64,

    /// The upper bound of backoff delay.
    pub max_delay: Duration,
}

/// This is a backoff configuration with the default values specified
/// at https://github.com/grpc/grpc/blob/master/doc/connection-backoff.md.
pub(crate) const DEFAULT_EXPONENTIAL_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

/// Delays are kept within a 31-bit millisecond range so downstream timer
/// arithmetic cannot overflow.
const MAX_BACKOFF_MILLIS: u128 = i32::MAX as u128;

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        // 0 <= base_delay <= max_delay
        if self.base_delay > self.max_delay {
            Err("base_delay must not be greater than max_delay")?;
        }
        // 1 <= multiplier
        if self.multiplier < 1.0 {
            Err("multiplier must be greater than 1.0")?;
        }
        // 0 <= jitter <= 1
        if self.jitter < 0.0 {
            Err("jitter must be greater than or equal to 0")?;
        }
        if self.jitter > 1.0 {
            Err("jitter must be less than or equal to 1")?
        }
        Ok(())
    }
}

/// Exponential backoff: the delay starts at `base_delay`, is multiplied by
/// `multiplier` per call, capped at `max_delay`, and perturbed by uniform
/// jitter in `±jitter × current`.
pub(crate) struct ExponentialBackoff {
    config: BackoffConfig,
    sampler: JitterSampler,

    /// The delay for the next retry, without the random jitter.  Stored as
    /// f64 to avoid rounding errors.
    next_delay_secs: Mutex<f64>,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        Self::with_sampler(config, thread_rng_sampler())
    }

    pub fn with_sampler(config: BackoffConfig, sampler: JitterSampler) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            sampler,
            next_delay_secs: Mutex::new(next_delay_secs),
        })
    }

    /// Returns the delay to `base_delay`, typically after a connection
    /// becomes ready.
    pub fn reset(&self) {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        *next_delay = self.config.base_delay.as_secs_f64();
    }

    pub fn backoff_duration(&self) -> Duration {
        let mut next_delay = self.next_delay_secs.lock().unwrap();
        let jitter = self.config.jitter;
        let cur_delay = *next_delay * (1.0 + (self.sampler)(-jitter, jitter));
        *next_delay = self
            .config
            .max_delay
            .as_secs_f64()
            .min(*next_delay * self.config.multiplier);
        clamp_millis(Duration::from_secs_f64(cur_delay.max(0.0)))
    }
}

fn clamp_millis(d: Duration) -> Duration {
    if d.as_millis() > MAX_BACKOFF_MILLIS {
        Duration::from_millis(MAX_BACKOFF_MILLIS as u64)
    } else {
        d
    }
}
