use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Pipeline stages with recorded durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Capture,
    Segmentation,
    Classification,
    Translation,
}

impl Stage {
    fn label(self) -> &'static str {
        match self {
            Stage::Capture => "capture",
            Stage::Segmentation => "segmentation",
            Stage::Classification => "classification",
            Stage::Translation => "translation",
        }
    }
}

/// Metrics collector shared by the pipeline, the network client and the API.
///
/// Cheap to clone; all clones record into the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Remote calls (vision, translation)
    remote_calls_total: AtomicUsize,
    remote_calls_success: AtomicUsize,
    remote_calls_failed: AtomicUsize,
    remote_latency_ms: RwLock<Vec<u64>>,

    // Translation cache
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    cache_size: AtomicUsize,

    // Stage durations
    capture_ms: RwLock<Vec<u64>>,
    segmentation_ms: RwLock<Vec<u64>>,
    classification_ms: RwLock<Vec<u64>>,
    translation_ms: RwLock<Vec<u64>>,

    // Pipeline outcomes
    pipelines_completed: AtomicUsize,
    pipelines_failed: AtomicUsize,
    segmentation_fallbacks: AtomicUsize,
    words_saved: AtomicUsize,

    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                remote_calls_total: AtomicUsize::new(0),
                remote_calls_success: AtomicUsize::new(0),
                remote_calls_failed: AtomicUsize::new(0),
                remote_latency_ms: RwLock::new(Vec::new()),
                cache_hits: AtomicUsize::new(0),
                cache_misses: AtomicUsize::new(0),
                cache_size: AtomicUsize::new(0),
                capture_ms: RwLock::new(Vec::new()),
                segmentation_ms: RwLock::new(Vec::new()),
                classification_ms: RwLock::new(Vec::new()),
                translation_ms: RwLock::new(Vec::new()),
                pipelines_completed: AtomicUsize::new(0),
                pipelines_failed: AtomicUsize::new(0),
                segmentation_fallbacks: AtomicUsize::new(0),
                words_saved: AtomicUsize::new(0),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_remote_call(&self, success: bool, duration: Duration) {
        self.inner.remote_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.remote_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.remote_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.remote_latency_ms.write().push(duration.as_millis() as u64);
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn update_cache_size(&self, size: usize) {
        self.inner.cache_size.store(size, Ordering::Relaxed);
    }

    pub fn record_stage(&self, stage: Stage, duration: Duration) {
        let bucket = match stage {
            Stage::Capture => &self.inner.capture_ms,
            Stage::Segmentation => &self.inner.segmentation_ms,
            Stage::Classification => &self.inner.classification_ms,
            Stage::Translation => &self.inner.translation_ms,
        };
        bucket.write().push(duration.as_millis() as u64);
    }

    pub fn record_pipeline(&self, success: bool) {
        if success {
            self.inner.pipelines_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.pipelines_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_segmentation_fallback(&self) {
        self.inner.segmentation_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_word_saved(&self) {
        self.inner.words_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let latency = self.inner.remote_latency_ms.read();
        let remote_latency_avg_ms = avg(&latency);
        let remote_latency_p50_ms = percentile(&latency, 0.5);
        let remote_latency_p95_ms = percentile(&latency, 0.95);
        drop(latency);

        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let cache_total = cache_hits + cache_misses;
        let cache_hit_rate = if cache_total > 0 {
            cache_hits as f64 / cache_total as f64
        } else {
            0.0
        };

        let mut endpoint_requests: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        endpoint_requests.sort();

        MetricsSnapshot {
            remote_calls_total: self.inner.remote_calls_total.load(Ordering::Relaxed),
            remote_calls_success: self.inner.remote_calls_success.load(Ordering::Relaxed),
            remote_calls_failed: self.inner.remote_calls_failed.load(Ordering::Relaxed),
            remote_latency_avg_ms,
            remote_latency_p50_ms,
            remote_latency_p95_ms,
            cache_hits,
            cache_misses,
            cache_hit_rate,
            cache_size: self.inner.cache_size.load(Ordering::Relaxed),
            capture_avg_ms: avg(&self.inner.capture_ms.read()),
            segmentation_avg_ms: avg(&self.inner.segmentation_ms.read()),
            classification_avg_ms: avg(&self.inner.classification_ms.read()),
            translation_avg_ms: avg(&self.inner.translation_ms.read()),
            pipelines_completed: self.inner.pipelines_completed.load(Ordering::Relaxed),
            pipelines_failed: self.inner.pipelines_failed.load(Ordering::Relaxed),
            segmentation_fallbacks: self.inner.segmentation_fallbacks.load(Ordering::Relaxed),
            words_saved: self.inner.words_saved.load(Ordering::Relaxed),
            endpoint_requests,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = format!(
            r#"# HELP remote_calls_total Total remote vision/translation calls
# TYPE remote_calls_total counter
remote_calls_total {{}} {}

# HELP remote_calls_success Successful remote calls
# TYPE remote_calls_success counter
remote_calls_success {{}} {}

# HELP remote_calls_failed Failed remote calls
# TYPE remote_calls_failed counter
remote_calls_failed {{}} {}

# HELP remote_latency_avg_ms Average remote call latency in milliseconds
# TYPE remote_latency_avg_ms gauge
remote_latency_avg_ms {{}} {}

# HELP translation_cache_hit_rate Translation cache hit rate (0.0 to 1.0)
# TYPE translation_cache_hit_rate gauge
translation_cache_hit_rate {{}} {}

# HELP translation_cache_size Current translation cache size
# TYPE translation_cache_size gauge
translation_cache_size {{}} {}

# HELP pipelines_completed_total Capture pipelines that produced a result
# TYPE pipelines_completed_total counter
pipelines_completed_total {{}} {}

# HELP pipelines_failed_total Capture pipelines that ended in an error
# TYPE pipelines_failed_total counter
pipelines_failed_total {{}} {}

# HELP segmentation_fallbacks_total Runs that fell back to the raw frame
# TYPE segmentation_fallbacks_total counter
segmentation_fallbacks_total {{}} {}

# HELP words_saved_total Words persisted to the store
# TYPE words_saved_total counter
words_saved_total {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}

# HELP stage_avg_duration_ms Average pipeline stage duration in milliseconds
# TYPE stage_avg_duration_ms gauge
"#,
            s.remote_calls_total,
            s.remote_calls_success,
            s.remote_calls_failed,
            s.remote_latency_avg_ms,
            s.cache_hit_rate,
            s.cache_size,
            s.pipelines_completed,
            s.pipelines_failed,
            s.segmentation_fallbacks,
            s.words_saved,
            s.uptime_seconds,
        );
        for (stage, value) in [
            (Stage::Capture, s.capture_avg_ms),
            (Stage::Segmentation, s.segmentation_avg_ms),
            (Stage::Classification, s.classification_avg_ms),
            (Stage::Translation, s.translation_avg_ms),
        ] {
            out.push_str(&format!(
                "stage_avg_duration_ms {{stage=\"{}\"}} {}\n",
                stage.label(),
                value
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub remote_calls_total: usize,
    pub remote_calls_success: usize,
    pub remote_calls_failed: usize,
    pub remote_latency_avg_ms: u64,
    pub remote_latency_p50_ms: u64,
    pub remote_latency_p95_ms: u64,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub capture_avg_ms: u64,
    pub segmentation_avg_ms: u64,
    pub classification_avg_ms: u64,
    pub translation_avg_ms: u64,
    pub pipelines_completed: usize,
    pub pipelines_failed: usize,
    pub segmentation_fallbacks: usize,
    pub words_saved: usize,
    pub endpoint_requests: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_remote_call(true, Duration::from_millis(100));
        metrics.record_remote_call(false, Duration::from_millis(50));
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_stage(Stage::Segmentation, Duration::from_millis(40));
        metrics.record_stage(Stage::Segmentation, Duration::from_millis(60));
        metrics.record_pipeline(true);
        metrics.record_segmentation_fallback();
        metrics.record_endpoint_request("/capture");
        metrics.record_endpoint_request("/capture");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.remote_calls_total, 2);
        assert_eq!(snapshot.remote_calls_success, 1);
        assert_eq!(snapshot.remote_calls_failed, 1);
        assert_eq!(snapshot.remote_latency_avg_ms, 75);
        assert_eq!(snapshot.cache_hit_rate, 0.5);
        assert_eq!(snapshot.segmentation_avg_ms, 50);
        assert_eq!(snapshot.pipelines_completed, 1);
        assert_eq!(snapshot.segmentation_fallbacks, 1);
        assert_eq!(snapshot.endpoint_requests, vec![("/capture".to_string(), 2)]);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_remote_call(true, Duration::from_millis(100));
        metrics.record_stage(Stage::Translation, Duration::from_millis(30));

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("remote_calls_total {} 1"));
        assert!(prometheus.contains("stage_avg_duration_ms {stage=\"translation\"} 30"));
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_word_saved();
        assert_eq!(metrics.snapshot().words_saved, 1);
    }
}
