//! Prometheus metrics for the controller

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Controller metrics, registered in their own registry
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,

    /// Operation cycles by outcome (noop, progressed, terminal, error)
    pub operations_total: IntCounterVec,

    /// Workflow phase transitions by target phase
    pub phase_transitions_total: IntCounterVec,

    /// Archive writes by outcome
    pub archive_writes_total: IntCounterVec,

    /// Archive records removed by the garbage collector
    pub gc_deleted_total: IntCounter,

    /// Items waiting per queue
    pub queue_depth: IntGaugeVec,

    /// Operation cycle duration
    pub operation_duration_seconds: Histogram,
}

impl ControllerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("strand".to_string()), None)?;

        let operations_total = IntCounterVec::new(
            Opts::new("operations_total", "Workflow operation cycles"),
            &["outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let phase_transitions_total = IntCounterVec::new(
            Opts::new("phase_transitions_total", "Workflow phase transitions"),
            &["phase"],
        )?;
        registry.register(Box::new(phase_transitions_total.clone()))?;

        let archive_writes_total = IntCounterVec::new(
            Opts::new("archive_writes_total", "Workflow archive writes"),
            &["outcome"],
        )?;
        registry.register(Box::new(archive_writes_total.clone()))?;

        let gc_deleted_total = IntCounter::new(
            "archive_gc_deleted_total",
            "Archived workflows removed by garbage collection",
        )?;
        registry.register(Box::new(gc_deleted_total.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Items waiting in a work queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let operation_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "operation_duration_seconds",
                "Workflow operation cycle duration",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(operation_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            phase_transitions_total,
            archive_writes_total,
            gc_deleted_total,
            queue_depth,
            operation_duration_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
