use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use tracing::info;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0,
        500.0, 1000.0,
    ]
}

/// Installs the global meter provider. Without it every instrument is a
/// no-op, which is what tests and `enable_metrics: false` get.
pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<Option<SdkMeterProvider>> {
    if !enable_metrics {
        return Ok(None);
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "screencast"))
        .with_attribute(KeyValue::new("service.name", "screencast-server"))
        .with_attribute(KeyValue::new("screencast.instance.id", instance_id.to_string()))
        .with_attribute(KeyValue::new("service.version", service_version.to_string()))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider.clone());
    info!("exporting metrics every {:?}", interval);
    Ok(Some(provider))
}

pub mod upload_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use super::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub chunks_received: Counter<u64>,
        pub chunk_bytes: Counter<u64>,
        pub duplicate_chunks: Counter<u64>,
        pub finalizations: Counter<u64>,
        pub finalize_duration: Histogram<f64>,
        pub artifact_bytes: Counter<u64>,
        pub sessions_swept: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("screencast-uploads");
            let chunks_received = meter
                .u64_counter("screencast.chunks_received")
                .with_description("number of chunks stored")
                .build();
            let chunk_bytes = meter
                .u64_counter("screencast.chunk_bytes")
                .with_description("bytes written to the chunk store")
                .build();
            let duplicate_chunks = meter
                .u64_counter("screencast.duplicate_chunks")
                .with_description("chunk submissions for an index that was already received")
                .build();
            let finalizations = meter
                .u64_counter("screencast.finalizations")
                .with_description("finalize attempts, labelled by outcome")
                .build();
            let finalize_duration = meter
                .f64_histogram("screencast.finalize_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time spent reassembling and persisting an artifact")
                .build();
            let artifact_bytes = meter
                .u64_counter("screencast.artifact_bytes")
                .with_description("bytes written to final artifacts")
                .build();
            let sessions_swept = meter
                .u64_counter("screencast.sessions_swept")
                .with_description("idle sessions removed by the sweep")
                .build();
            Metrics {
                chunks_received,
                chunk_bytes,
                duplicate_chunks,
                finalizations,
                finalize_duration,
                artifact_bytes,
                sessions_swept,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}
