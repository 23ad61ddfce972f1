use std::sync::{Arc, OnceLock};

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Process-wide metrics for scheduling, decode, and pipeline stages.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,
    scheduler_pending_items: GaugeVec,
    scheduler_assigned_items: GaugeVec,
    scheduler_completed_items: GaugeVec,
    scheduler_retries: CounterVec,
    decode_bytes_read: CounterVec,
    decode_frames: CounterVec,
    save_bytes_written: CounterVec,
    stage_time_seconds: HistogramVec,
    pool_bytes_in_use: GaugeVec,
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();
        let scheduler_pending_items = GaugeVec::new(
            Opts::new("kino_scheduler_pending_items", "Pending IO items per job"),
            &["job"],
        )
        .expect("metric definition");
        let scheduler_assigned_items = GaugeVec::new(
            Opts::new("kino_scheduler_assigned_items", "Assigned IO items per job"),
            &["job"],
        )
        .expect("metric definition");
        let scheduler_completed_items = GaugeVec::new(
            Opts::new(
                "kino_scheduler_completed_items",
                "Completed IO items per job",
            ),
            &["job"],
        )
        .expect("metric definition");
        let scheduler_retries = CounterVec::new(
            Opts::new("kino_scheduler_retries_total", "IO item retries per job"),
            &["job"],
        )
        .expect("metric definition");
        let decode_bytes_read = CounterVec::new(
            Opts::new(
                "kino_decode_bytes_read_total",
                "Encoded bytes read for partial video decode",
            ),
            &["table"],
        )
        .expect("metric definition");
        let decode_frames = CounterVec::new(
            Opts::new(
                "kino_decode_frames_total",
                "Frames decoded, split by whether they were requested or codec context",
            ),
            &["table", "kind"],
        )
        .expect("metric definition");
        let save_bytes_written = CounterVec::new(
            Opts::new(
                "kino_save_bytes_written_total",
                "Output column bytes written, post-compression",
            ),
            &["table", "codec"],
        )
        .expect("metric definition");
        let stage_time_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kino_stage_time_seconds",
                "Wall time per pipeline stage per work entry",
            ),
            &["stage"],
        )
        .expect("metric definition");
        let pool_bytes_in_use = GaugeVec::new(
            Opts::new(
                "kino_pool_bytes_in_use",
                "Buffer pool bytes tracked against each device budget",
            ),
            &["device"],
        )
        .expect("metric definition");

        registry
            .register(Box::new(scheduler_pending_items.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(scheduler_assigned_items.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(scheduler_completed_items.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(scheduler_retries.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(decode_bytes_read.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(decode_frames.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(save_bytes_written.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(stage_time_seconds.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(pool_bytes_in_use.clone()))
            .expect("metric registration");

        Self {
            registry,
            scheduler_pending_items,
            scheduler_assigned_items,
            scheduler_completed_items,
            scheduler_retries,
            decode_bytes_read,
            decode_frames,
            save_bytes_written,
            stage_time_seconds,
            pool_bytes_in_use,
        }
    }
}

impl MetricsRegistry {
    /// Create a standalone registry (tests, embedded runtimes).
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// Update per-job scheduler item gauges.
    pub fn set_scheduler_items(&self, job: &str, pending: u64, assigned: u64, completed: u64) {
        self.inner
            .scheduler_pending_items
            .with_label_values(&[job])
            .set(pending as f64);
        self.inner
            .scheduler_assigned_items
            .with_label_values(&[job])
            .set(assigned as f64);
        self.inner
            .scheduler_completed_items
            .with_label_values(&[job])
            .set(completed as f64);
    }

    /// Count one IO item retry.
    pub fn inc_scheduler_retries(&self, job: &str) {
        self.inner
            .scheduler_retries
            .with_label_values(&[job])
            .inc();
    }

    /// Record one partial decode: bytes read plus valid/context frame counts.
    pub fn record_decode(&self, table: &str, bytes: u64, valid_frames: u64, context_frames: u64) {
        self.inner
            .decode_bytes_read
            .with_label_values(&[table])
            .inc_by(bytes as f64);
        self.inner
            .decode_frames
            .with_label_values(&[table, "valid"])
            .inc_by(valid_frames as f64);
        self.inner
            .decode_frames
            .with_label_values(&[table, "context"])
            .inc_by(context_frames as f64);
    }

    /// Record bytes written for one saved column.
    pub fn record_save(&self, table: &str, codec: &str, bytes: u64) {
        self.inner
            .save_bytes_written
            .with_label_values(&[table, codec])
            .inc_by(bytes as f64);
    }

    /// Observe wall time for one stage invocation.
    pub fn observe_stage(&self, stage: &str, secs: f64) {
        self.inner
            .stage_time_seconds
            .with_label_values(&[stage])
            .observe(secs.max(0.0));
    }

    /// Update the tracked byte gauge for one device class.
    pub fn set_pool_bytes(&self, device: &str, bytes: u64) {
        self.inner
            .pool_bytes_in_use
            .with_label_values(&[device])
            .set(bytes as f64);
    }

    /// Underlying Prometheus registry, for exporters.
    #[must_use]
    pub fn prometheus_registry(&self) -> &Registry {
        &self.inner.registry
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Return the process-global metrics registry.
pub fn global_metrics() -> &'static MetricsRegistry {
    static METRICS: OnceLock<MetricsRegistry> = OnceLock::new();
    METRICS.get_or_init(MetricsRegistry::new)
}
