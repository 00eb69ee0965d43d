//! Logging and OpenTelemetry setup for the clusterboot binary
//!
//! Logs are JSON lines on stderr. Spans and instruments from [`instruments`]
//! are recorded against SDK providers installed as the process globals; with
//! recording off, spans are sampled out.

pub mod instruments;

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const ENV_ENABLED: &str = "CLUSTERBOOT_TELEMETRY_ENABLED";
const ENV_RUN_ID: &str = "CLUSTERBOOT_TELEMETRY_RUN_ID";
const ENV_SAMPLE_RATIO: &str = "CLUSTERBOOT_TELEMETRY_SAMPLE_RATIO";
const ENV_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
const ENV_RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";

/// Settings read from `CLUSTERBOOT_TELEMETRY_*` and the standard `OTEL_*`
/// resource variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySettings {
    pub service_name: String,
    /// Sample spans at all
    pub recording: bool,
    /// Share of root spans kept while recording
    pub sample_ratio: f64,
    /// Correlates the output of every node in one provisioning pass
    pub run_id: Option<String>,
    /// Node being provisioned
    pub node: Option<String>,
    /// Extra resource attributes, sorted by key
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySettings {
    pub fn from_env(default_service_name: &str, node: Option<&str>) -> Result<Self> {
        Self::from_lookup(default_service_name, node, |key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(default_service_name: &str, node: Option<&str>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let service_name = match trimmed(lookup(ENV_SERVICE_NAME)) {
            Some(name) => name,
            None if lookup(ENV_SERVICE_NAME).is_some() => {
                return Err(Error::Config(format!("{ENV_SERVICE_NAME} cannot be empty")));
            }
            None => default_service_name.to_string(),
        };

        let recording = match trimmed(lookup(ENV_ENABLED)) {
            Some(raw) => flag(ENV_ENABLED, &raw)?,
            None => false,
        };
        let sample_ratio = match trimmed(lookup(ENV_SAMPLE_RATIO)) {
            Some(raw) => ratio(&raw)?,
            None => 1.0,
        };
        let attributes = match lookup(ENV_RESOURCE_ATTRIBUTES) {
            Some(raw) => attribute_pairs(&raw)?,
            None => BTreeMap::new(),
        };

        Ok(Self {
            service_name,
            recording,
            sample_ratio,
            run_id: trimmed(lookup(ENV_RUN_ID)),
            node: node.map(str::to_string),
            attributes,
        })
    }

    fn sampler(&self) -> Sampler {
        if !self.recording {
            Sampler::AlwaysOff
        } else if self.sample_ratio >= 1.0 {
            Sampler::ParentBased(Box::new(Sampler::AlwaysOn))
        } else {
            Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(self.sample_ratio)))
        }
    }

    /// Resource attributes: user-supplied pairs first, then the fixed keys,
    /// which always win.
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        let mut attrs = self.attributes.clone();
        attrs
            .entry("service.namespace".to_string())
            .or_insert_with(|| "clusterboot".to_string());
        attrs.insert("service.name".to_string(), self.service_name.clone());
        if let Some(run_id) = &self.run_id {
            attrs.insert("clusterboot.run_id".to_string(), run_id.clone());
        }
        if let Some(node) = &self.node {
            attrs.insert("clusterboot.node".to_string(), node.clone());
        }
        attrs.into_iter().map(|(k, v)| KeyValue::new(k, v)).collect()
    }
}

/// Owns the SDK providers; dropping it flushes and shuts them down.
pub struct Telemetry {
    settings: TelemetrySettings,
    tracer_provider: TracerProvider,
    meter_provider: SdkMeterProvider,
}

impl Telemetry {
    /// Install the log subscriber and the global tracer and meter providers.
    pub fn init_for_component(
        default_service_name: &str,
        node: Option<&str>,
        log_level: &str,
    ) -> Result<Self> {
        let settings = TelemetrySettings::from_env(default_service_name, node)?;
        let level = parse_log_level(log_level)?;

        // stdout is reserved for the variable bag
        FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_writer(std::io::stderr)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to initialize log subscriber: {e}")))?;

        let resource = Resource::default().merge(&Resource::new(settings.resource_attributes()));
        let tracer_provider = TracerProvider::builder()
            .with_config(
                trace::Config::default()
                    .with_sampler(settings.sampler())
                    .with_resource(resource.clone()),
            )
            .build();
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();

        let _ = global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TraceContextPropagator::new());

        info!(
            service_name = %settings.service_name,
            recording = settings.recording,
            sample_ratio = settings.sample_ratio,
            run_id = %settings.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self {
            settings,
            tracer_provider,
            meter_provider,
        })
    }

    pub fn settings(&self) -> &TelemetrySettings {
        &self.settings
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let _ = self.meter_provider.shutdown();
        let _ = self.tracer_provider.shutdown();
    }
}

pub fn parse_log_level(raw: &str) -> Result<Level> {
    raw.trim()
        .parse::<Level>()
        .map_err(|_| Error::Config(format!("invalid log level '{}'", raw.trim())))
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn flag(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name} is not a boolean: '{raw}'"))),
    }
}

fn ratio(raw: &str) -> Result<f64> {
    match raw.parse::<f64>() {
        Ok(value) if (0.0..=1.0).contains(&value) => Ok(value),
        _ => Err(Error::Config(format!(
            "{ENV_SAMPLE_RATIO} must be a number in [0,1], got '{raw}'"
        ))),
    }
}

/// `key=value,key=value`; blank entries are skipped.
fn attribute_pairs(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut pairs = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                pairs.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_RESOURCE_ATTRIBUTES} entry '{entry}' is not key=value"
                )));
            }
        }
    }
    Ok(pairs)
}
