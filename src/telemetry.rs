//! Process-wide request counters: totals as atomics, per-model stats and
//! the sliding one-minute window behind a mutex, purged lazily on read.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelStats {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

pub struct Telemetry {
    started_at: Instant,
    total_requests: AtomicU64,
    total_input_tokens: AtomicU64,
    total_output_tokens: AtomicU64,
    request_times: Mutex<Vec<Instant>>,
    model_stats: Mutex<HashMap<String, ModelStats>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub uptime: String,
    pub total_requests: u64,
    pub rpm: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub avg_input_tokens: u64,
    pub avg_output_tokens: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub model_stats: HashMap<String, ModelStats>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            total_requests: AtomicU64::new(0),
            total_input_tokens: AtomicU64::new(0),
            total_output_tokens: AtomicU64::new(0),
            request_times: Mutex::new(Vec::new()),
            model_stats: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_request(&self, input_tokens: u64, output_tokens: u64, model: &str) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_input_tokens.fetch_add(input_tokens, Ordering::Relaxed);
        self.total_output_tokens.fetch_add(output_tokens, Ordering::Relaxed);

        self.request_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());

        if !model.is_empty() {
            let mut stats = self.model_stats.lock().unwrap_or_else(|e| e.into_inner());
            let entry = stats.entry(model.to_string()).or_default();
            entry.requests += 1;
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
        }
    }

    /// Requests in the last 60 seconds. Purges stale timestamps in place.
    pub fn rpm(&self) -> usize {
        let cutoff = Instant::now() - Duration::from_secs(60);
        let mut times = self.request_times.lock().unwrap_or_else(|e| e.into_inner());
        times.retain(|t| *t > cutoff);
        times.len()
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let total_input = self.total_input_tokens.load(Ordering::Relaxed);
        let total_output = self.total_output_tokens.load(Ordering::Relaxed);
        let (avg_input, avg_output) = if total_requests > 0 {
            (total_input / total_requests, total_output / total_requests)
        } else {
            (0, 0)
        };

        let model_stats = self
            .model_stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        TelemetrySnapshot {
            uptime: format_uptime(self.started_at.elapsed()),
            total_requests,
            rpm: self.rpm(),
            total_input_tokens: total_input,
            total_output_tokens: total_output,
            avg_input_tokens: avg_input,
            avg_output_tokens: avg_output,
            model_stats,
        }
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    let seconds = secs % 60;

    if days > 0 {
        format!("{}d{:02}h{:02}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
