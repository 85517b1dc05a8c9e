//! Per-element and aggregate run metrics (spec §3's Metrics).
//!
//! No direct precedent in the reference CLI (it has no metrics module);
//! shaped directly off spec §3 with counter-accumulation style borrowed
//! from `fiddler`'s `MetricEntry`.

use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ElementMetrics {
    pub stage_id: String,
    pub items_in: u64,
    pub items_out: u64,
    pub errors: u64,
    #[serde(with = "duration_as_secs_f64")]
    pub elapsed: Duration,
}

impl ElementMetrics {
    pub fn new(stage_id: impl Into<String>) -> Self {
        ElementMetrics {
            stage_id: stage_id.into(),
            ..Default::default()
        }
    }
}

/// Accumulates per-element counters and wall-clock elapsed time for one
/// edge of the pipeline. The executor owns one of these per stage and
/// updates it as items cross the stage's boundary (spec §4.7).
pub struct ElementMetricsTracker {
    metrics: ElementMetrics,
    last_emit: Option<Instant>,
}

impl ElementMetricsTracker {
    pub fn new(stage_id: impl Into<String>) -> Self {
        ElementMetricsTracker {
            metrics: ElementMetrics::new(stage_id),
            last_emit: None,
        }
    }

    pub fn record_in(&mut self) {
        self.metrics.items_in += 1;
    }

    pub fn record_out(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            self.metrics.elapsed += now.duration_since(last);
        }
        self.last_emit = Some(now);
        self.metrics.items_out += 1;
    }

    pub fn record_error(&mut self) {
        self.metrics.errors += 1;
    }

    pub fn finish(self) -> ElementMetrics {
        self.metrics
    }

    /// Reads the counters without consuming the tracker, for the rare case
    /// the executor can't take sole ownership back after join.
    pub fn snapshot(&self) -> ElementMetrics {
        self.metrics.clone()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    #[serde(with = "duration_as_secs_f64")]
    pub duration: Duration,
    pub total_items_processed: u64,
    pub throughput: f64,
    pub element_metrics: Vec<ElementMetrics>,
}

impl RunStats {
    pub fn finalize(started_at: Instant, element_metrics: Vec<ElementMetrics>, total_items_processed: u64) -> Self {
        let duration = started_at.elapsed();
        let throughput = if duration.as_secs_f64() > 0.0 {
            total_items_processed as f64 / duration.as_secs_f64()
        } else {
            total_items_processed as f64
        };
        RunStats {
            duration,
            total_items_processed,
            throughput,
            element_metrics,
        }
    }
}

mod duration_as_secs_f64 {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_conservation_on_linear_chain() {
        let mut tracker = ElementMetricsTracker::new("conduit.Identity");
        for _ in 0..5 {
            tracker.record_in();
            tracker.record_out();
        }
        let metrics = tracker.finish();
        assert_eq!(metrics.items_in, metrics.items_out);
        assert_eq!(metrics.items_in, 5);
    }

    #[test]
    fn run_stats_throughput_is_non_negative() {
        let stats = RunStats::finalize(Instant::now(), vec![], 10);
        assert!(stats.throughput >= 0.0);
        assert_eq!(stats.total_items_processed, 10);
    }
}
