use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Packet-level counters and a latency histogram for the whole network.
#[derive(Clone, Debug)]
pub struct NetworkMetrics {
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    latencies: Histogram<u64>,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            packets_sent: 0,
            packets_delivered: 0,
            packets_dropped: 0,
            latencies: Histogram::new(3).expect("3 significant figures is a valid precision"),
        }
    }
}

impl NetworkMetrics {
    pub fn record_sent(&mut self) {
        self.packets_sent += 1;
    }

    pub fn record_delivered(&mut self, latency_us: u64) {
        self.packets_delivered += 1;
        self.latencies.saturating_record(latency_us);
    }

    pub fn record_dropped(&mut self) {
        self.packets_dropped += 1;
    }

    pub fn min_latency_us(&self) -> Option<u64> {
        (!self.latencies.is_empty()).then(|| self.latencies.min())
    }

    pub fn max_latency_us(&self) -> Option<u64> {
        (!self.latencies.is_empty()).then(|| self.latencies.max())
    }

    pub fn mean_latency_us(&self) -> f64 {
        if self.latencies.is_empty() {
            return 0.0;
        }
        self.latencies.mean()
    }

    pub fn percentile_us(&self, p: f64) -> Option<u64> {
        (!self.latencies.is_empty()).then(|| self.latencies.value_at_percentile(p))
    }

    pub fn drop_rate(&self) -> f64 {
        if self.packets_sent == 0 {
            return 0.0;
        }
        self.packets_dropped as f64 / self.packets_sent as f64
    }

    pub fn summary(&self) -> NetworkSummary {
        NetworkSummary {
            packets_sent: self.packets_sent,
            packets_delivered: self.packets_delivered,
            packets_dropped: self.packets_dropped,
            min_latency_us: self.min_latency_us(),
            max_latency_us: self.max_latency_us(),
            mean_latency_us: self.mean_latency_us(),
            p99_latency_us: self.percentile_us(99.0),
        }
    }

    pub fn reset(&mut self) {
        self.packets_sent = 0;
        self.packets_delivered = 0;
        self.packets_dropped = 0;
        self.latencies.reset();
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSummary {
    pub packets_sent: u64,
    pub packets_delivered: u64,
    pub packets_dropped: u64,
    pub min_latency_us: Option<u64>,
    pub max_latency_us: Option<u64>,
    pub mean_latency_us: f64,
    pub p99_latency_us: Option<u64>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct StepPoint {
    pub step: u64,
    pub sim_time_us: u64,
    pub emitted: u32,
    pub delivered: u32,
    pub dropped: u32,
    pub wall_us: u64,
    pub delivered_per_s: f32,
}

/// Bounded per-step history with a smoothed delivery rate.
pub struct MetricsCollector {
    pub history: VecDeque<StepPoint>,
    pub max_points: usize,
    last_sample_time_us: u64,
    current_delivered_per_s: f32,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MetricsCollector {
    pub fn new(max_points: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(max_points.min(1024)),
            max_points,
            last_sample_time_us: 0,
            current_delivered_per_s: 0.0,
        }
    }

    pub fn update(
        &mut self,
        step: u64,
        sim_time_us: u64,
        emitted: u32,
        delivered: u32,
        dropped: u32,
        wall_us: u64,
    ) {
        let delta_t_s = sim_time_us.saturating_sub(self.last_sample_time_us) as f32 / 1_000_000.0;
        if delta_t_s > 0.0 {
            let raw_rate = delivered as f32 / delta_t_s;
            let alpha = 0.1;
            self.current_delivered_per_s =
                self.current_delivered_per_s * (1.0 - alpha) + raw_rate * alpha;
        }

        self.history.push_back(StepPoint {
            step,
            sim_time_us,
            emitted,
            delivered,
            dropped,
            wall_us,
            delivered_per_s: self.current_delivered_per_s,
        });

        if self.history.len() > self.max_points {
            self.history.pop_front();
        }

        self.last_sample_time_us = sim_time_us;
    }

    pub fn reset(&mut self) {
        self.history.clear();
        self.last_sample_time_us = 0;
        self.current_delivered_per_s = 0.0;
    }
}
