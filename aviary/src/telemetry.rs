//! Passive performance taps: rate and value samplers consulted by the
//! dispatcher and the worker pool. Nothing here emits anything; a health
//! monitor reads the registry when it cares.

use std::{collections::VecDeque, time::Duration};

use dashmap::DashMap;
use faststr::FastStr;
use parking_lot::Mutex;
use tokio::time::Instant;

const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

/// Sliding-window event counter; `avg` is events per second over the
/// window.
pub struct RateSampler {
    window: Duration,
    ticks: Mutex<VecDeque<Instant>>,
}

impl RateSampler {
    pub fn new(window: Duration) -> Self {
        RateSampler {
            window,
            ticks: Mutex::new(VecDeque::new()),
        }
    }

    pub fn tick(&self) {
        let now = Instant::now();
        let mut ticks = self.ticks.lock();
        Self::prune(&mut ticks, now, self.window);
        ticks.push_back(now);
    }

    pub fn avg(&self) -> f64 {
        let now = Instant::now();
        let mut ticks = self.ticks.lock();
        Self::prune(&mut ticks, now, self.window);
        ticks.len() as f64 / self.window.as_secs_f64()
    }

    fn prune(ticks: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = ticks.front() {
            if now.saturating_duration_since(*front) > window {
                ticks.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateSampler {
    fn default() -> Self {
        RateSampler::new(DEFAULT_WINDOW)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SampleStats {
    pub count: usize,
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Sliding-window aggregate of sampled values, e.g. response times in
/// milliseconds keyed by outcome.
pub struct ValueSampler {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl ValueSampler {
    pub fn new(window: Duration) -> Self {
        ValueSampler {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn sample(&self, value: f64) {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window);
        samples.push_back((now, value));
    }

    pub fn stats(&self) -> Option<SampleStats> {
        let now = Instant::now();
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, now, self.window);
        if samples.is_empty() {
            return None;
        }
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for (_, v) in samples.iter() {
            min = min.min(*v);
            max = max.max(*v);
            sum += *v;
        }
        Some(SampleStats {
            count: samples.len(),
            min,
            avg: sum / samples.len() as f64,
            max,
        })
    }

    fn prune(samples: &mut VecDeque<(Instant, f64)>, now: Instant, window: Duration) {
        while let Some((at, _)) = samples.front() {
            if now.saturating_duration_since(*at) > window {
                samples.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for ValueSampler {
    fn default() -> Self {
        ValueSampler::new(DEFAULT_WINDOW)
    }
}

/// Name-keyed registry of samplers; names follow the
/// `interface.<name>.response_time.<outcome>` convention.
pub struct Performance {
    window: Duration,
    rates: DashMap<FastStr, RateSampler>,
    values: DashMap<FastStr, ValueSampler>,
}

impl Performance {
    pub fn new(window: Duration) -> Self {
        Performance {
            window,
            rates: DashMap::new(),
            values: DashMap::new(),
        }
    }

    pub fn event(&self, name: impl Into<FastStr>) {
        self.rates
            .entry(name.into())
            .or_insert_with(|| RateSampler::new(self.window))
            .tick();
    }

    pub fn sample(&self, name: impl Into<FastStr>, value: f64) {
        self.values
            .entry(name.into())
            .or_insert_with(|| ValueSampler::new(self.window))
            .sample(value);
    }

    pub fn rate(&self, name: &str) -> f64 {
        self.rates.get(name).map(|s| s.avg()).unwrap_or(0.0)
    }

    pub fn stats(&self, name: &str) -> Option<SampleStats> {
        self.values.get(name).and_then(|s| s.stats())
    }
}

impl Default for Performance {
    fn default() -> Self {
        Performance::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_decays_outside_window() {
        let sampler = RateSampler::new(Duration::from_secs(10));
        for _ in 0..20 {
            sampler.tick();
        }
        assert_eq!(sampler.avg(), 2.0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(sampler.avg(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn value_stats_aggregate() {
        let sampler = ValueSampler::new(Duration::from_secs(10));
        assert!(sampler.stats().is_none());
        sampler.sample(10.0);
        sampler.sample(30.0);
        let stats = sampler.stats().unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.min, 10.0);
        assert_eq!(stats.avg, 20.0);
        assert_eq!(stats.max, 30.0);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_creates_on_first_use() {
        let perf = Performance::default();
        assert_eq!(perf.rate("interface.http_1.request_rate"), 0.0);
        perf.event("interface.http_1.request_rate");
        assert!(perf.rate("interface.http_1.request_rate") > 0.0);

        perf.sample("interface.http_1.response_time.success", 12.0);
        assert_eq!(
            perf.stats("interface.http_1.response_time.success")
                .unwrap()
                .count,
            1
        );
    }
}
