use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;
use std::collections::HashSet;

pub struct Metrics {
    request_counter: Counter<u64>,
    frames_uploaded: Counter<u64>,
    reconstruction_duration: Histogram<u64>,
    archive_frames: Gauge<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("mocap_playback");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of requests")
            .build();

        let frames_uploaded = meter
            .u64_counter("frames_uploaded_total")
            .with_description("Total number of frames received through uploads")
            .build();

        let boundaries = generate_boundaries((100, 500, 1000, 5000, 60000));

        let reconstruction_duration = meter
            .u64_histogram("reconstruction_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of video reconstructions in milliseconds")
            .build();

        let archive_frames = meter
            .u64_gauge("archive_frames")
            .with_description("Frames held in the preprocessed archive")
            .build();

        Ok(Metrics {
            request_counter,
            frames_uploaded,
            reconstruction_duration,
            archive_frames,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = vec![KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_frames_uploaded(&self, count: u64) {
        self.frames_uploaded.add(count, &[]);
    }

    pub fn record_reconstruction(&self, duration_ms: u64, succeeded: bool) {
        let attributes = vec![KeyValue::new("succeeded", succeeded)];
        self.reconstruction_duration.record(duration_ms, &attributes);
    }

    pub fn record_archive_frames(&self, frames: u64, source: &str) {
        let attributes = vec![KeyValue::new("source", source.to_string())];
        self.archive_frames.record(frames, &attributes);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 100;
    let middle_step: usize = 250;
    let end_step: usize = 1000;
    let tail_step: usize = 15000;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_boundaries() {
        let parts = (100, 300, 800, 2800, 20000);
        let get = generate_boundaries(parts);
        let expected = vec![
            100.0, 200.0, 300.0, 550.0, 800.0, 1800.0, 2800.0, 17800.0,
        ];

        assert_eq!(get, expected);
    }
}
