//! Bootstrap instruments and span helpers.

use opentelemetry::global::{self, BoxedSpan};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::{Span, Status, Tracer};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Duration;

const SCOPE: &str = "clusterboot";

struct BootstrapInstruments {
    wait_duration_seconds: Histogram<f64>,
    wait_polls: Counter<u64>,
    wait_bypasses: Counter<u64>,
    resolutions: Counter<u64>,
    directory_writes: Counter<u64>,
}

fn instruments() -> &'static BootstrapInstruments {
    static INSTRUMENTS: OnceLock<BootstrapInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter(SCOPE);
        BootstrapInstruments {
            wait_duration_seconds: meter
                .f64_histogram("clusterboot.wait.duration")
                .with_description("Time a wait barrier spent polling, by outcome")
                .with_unit("s")
                .init(),
            wait_polls: meter
                .u64_counter("clusterboot.wait.polls")
                .with_description("Readiness polls issued by wait barriers")
                .init(),
            wait_bypasses: meter
                .u64_counter("clusterboot.wait.bypasses")
                .with_description("Waits opened without polling, by reason")
                .init(),
            resolutions: meter
                .u64_counter("clusterboot.resolve.outcomes")
                .with_description("Address resolutions by the step that answered")
                .init(),
            directory_writes: meter
                .u64_counter("clusterboot.directory.writes")
                .with_description("Self-registration writes sent to the directory")
                .init(),
        }
    })
}

/// Span under the clusterboot tracer; the caller ends it.
pub fn start_span(name: &'static str, attributes: Vec<KeyValue>) -> BoxedSpan {
    let mut span = global::tracer(SCOPE).start(name);
    span.set_attributes(attributes);
    span
}

/// End `span` with an error status.
pub fn fail_span(mut span: BoxedSpan, message: String) {
    span.set_status(Status::error(message));
    span.end();
}

pub fn record_wait(service: &str, outcome: &'static str, waited: Duration) {
    instruments().wait_duration_seconds.record(
        waited.as_secs_f64(),
        &[
            KeyValue::new("service", service.to_string()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

pub fn record_poll(service: &str) {
    instruments()
        .wait_polls
        .add(1, &[KeyValue::new("service", service.to_string())]);
}

pub fn record_bypass(service: &str, reason: &'static str) {
    instruments().wait_bypasses.add(
        1,
        &[
            KeyValue::new("service", service.to_string()),
            KeyValue::new("reason", reason),
        ],
    );
}

pub fn record_resolution(role: &'static str, step: &'static str) {
    instruments().resolutions.add(
        1,
        &[KeyValue::new("role", role), KeyValue::new("step", step)],
    );
}

pub fn record_directory_write(kind: &'static str) {
    instruments()
        .directory_writes
        .add(1, &[KeyValue::new("kind", kind)]);
}
