// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Poisson sampling of allocation sizes (§4.N), the same scheme heapprofd's
//! original C++ runtime uses: track bytes remaining until the next sample
//! point, drawn from an exponential distribution with mean `interval`, and
//! decrement it by each allocation's size. A sampled allocation is weighted
//! by `max(size, interval)` so the sampled total stays an unbiased estimate
//! of the true live-heap size.

pub struct PoissonSampler {
    interval: u64,
    bytes_until_next_sample: i64,
}

impl PoissonSampler {
    pub fn new(interval: u64) -> Self {
        let interval = interval.max(1);
        let mut sampler = PoissonSampler { interval, bytes_until_next_sample: 0 };
        sampler.bytes_until_next_sample = sampler.draw_interval();
        sampler
    }

    fn draw_interval(&self) -> i64 {
        let u: f64 = rand::random::<f64>().max(f64::MIN_POSITIVE);
        (-u.ln() * self.interval as f64) as i64
    }

    /// Called once per allocation of `size` bytes. Returns the sampled
    /// weight to attribute if this allocation should be recorded, `None`
    /// otherwise.
    pub fn sample(&mut self, size: u64) -> Option<u64> {
        self.bytes_until_next_sample -= size as i64;
        if self.bytes_until_next_sample > 0 {
            return None;
        }
        self.bytes_until_next_sample = self.draw_interval();
        Some(size.max(self.interval))
    }

    #[cfg(test)]
    fn with_countdown(interval: u64, countdown: i64) -> Self {
        PoissonSampler { interval: interval.max(1), bytes_until_next_sample: countdown }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_smaller_than_countdown_is_not_sampled() {
        let mut sampler = PoissonSampler::with_countdown(1024, 10_000);
        assert_eq!(sampler.sample(100), None);
    }

    #[test]
    fn allocation_exhausting_the_countdown_is_sampled_and_weighted() {
        let mut sampler = PoissonSampler::with_countdown(1024, 50);
        let sampled = sampler.sample(100).unwrap();
        assert_eq!(sampled, 1024);
    }

    #[test]
    fn sampled_weight_is_never_below_the_interval() {
        let mut sampler = PoissonSampler::with_countdown(1024, 0);
        let sampled = sampler.sample(2048).unwrap();
        assert_eq!(sampled, 2048);
    }

    #[test]
    fn repeated_small_allocations_eventually_sample() {
        let mut sampler = PoissonSampler::new(64);
        let mut sampled_any = false;
        for _ in 0..10_000 {
            if sampler.sample(8).is_some() {
                sampled_any = true;
                break;
            }
        }
        assert!(sampled_any);
    }
}
