// Windowed end-to-end latency estimator fed by message finishes.
use crate::message::now_nanos;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Keeps the most recent latency samples and answers percentile queries
/// over that window. Samples are nanoseconds from original publication to
/// acknowledgement.
#[derive(Debug)]
pub struct LatencyEstimator {
    window: usize,
    samples: Mutex<VecDeque<u64>>,
}

impl LatencyEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: Mutex::new(VecDeque::with_capacity(window.max(1))),
        }
    }

    /// Records one finished message by its publish timestamp.
    pub fn insert(&self, publish_ts: i64) {
        let latency = now_nanos().saturating_sub(publish_ts).max(0) as u64;
        metrics::histogram!("channel_e2e_latency_ns").record(latency as f64);
        let mut samples = self.samples.lock().expect("latency lock");
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(latency);
    }

    /// The latency at percentile `p` (0–100) over the current window, or
    /// `None` before any sample arrives.
    pub fn percentile(&self, p: f64) -> Option<u64> {
        let samples = self.samples.lock().expect("latency lock");
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = ((p.clamp(0.0, 100.0) / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.saturating_sub(1)])
    }

    pub fn len(&self) -> usize {
        self.samples.lock().expect("latency lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
