//! Exporting run events as telemetry.

use anyhow::Result;
use opentelemetry::trace::{Span, Tracer as _};
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{self, Tracer},
    Resource,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tonic::metadata::MetadataMap;
use tracing::{debug, warn};

use crate::config::CollectorConfig;
use crate::events::AgentEvent;

/// OTLP exporter turning agent events into spans.
pub struct OtlpExporter {
    tracer: Tracer,
}

impl OtlpExporter {
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let mut metadata = MetadataMap::new();
        for (key, value) in &config.headers {
            let (Ok(key), Ok(value)) = (
                key.parse::<tonic::metadata::MetadataKey<tonic::metadata::Ascii>>(),
                value.parse(),
            ) else {
                warn!(header = %key, "Skipping invalid collector header");
                continue;
            };
            metadata.insert(key, value);
        }

        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(&config.endpoint)
            .with_timeout(Duration::from_secs(10))
            .with_metadata(metadata);

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(trace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sandbox-analyzer-agent"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        Ok(Self { tracer })
    }

    /// Export one event as a span.
    pub fn export_event(&self, event: &AgentEvent) {
        let mut span = self.tracer.start(event.name());

        match event {
            AgentEvent::ProcessAnnounced { pid } => {
                span.set_attribute(KeyValue::new("process.pid", i64::from(*pid)));
            }
            AgentEvent::ProcessInjected { announced, tracked } => {
                span.set_attribute(KeyValue::new("process.pid", i64::from(*announced)));
                span.set_attribute(KeyValue::new("process.tracked", format!("{tracked:?}")));
            }
            AgentEvent::InjectionFailed { pid, reason } => {
                span.set_attribute(KeyValue::new("process.pid", i64::from(*pid)));
                span.set_attribute(KeyValue::new("error.message", reason.clone()));
            }
            AgentEvent::FileAnnounced { path } => {
                span.set_attribute(KeyValue::new("file.path", path.display().to_string()));
            }
            AgentEvent::MalformedCommand { len } => {
                span.set_attribute(KeyValue::new("message.size", *len as i64));
            }
            AgentEvent::ProcessesExited { remaining } => {
                span.set_attribute(KeyValue::new("process.remaining", *remaining as i64));
            }
            AgentEvent::StateChanged { state } => {
                span.set_attribute(KeyValue::new("run.state", state.clone()));
            }
        }

        span.end();
    }

    /// Flush pending spans.
    pub fn shutdown(self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

/// Spawn the task draining the event channel.
///
/// Without an exporter the events are only logged. The task ends once every
/// sender has been dropped.
pub fn spawn_event_task(
    mut event_rx: mpsc::Receiver<AgentEvent>,
    exporter: Option<OtlpExporter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!(event = event.name(), detail = ?event, "Agent event");
            if let Some(exporter) = &exporter {
                exporter.export_event(&event);
            }
        }

        if let Some(exporter) = exporter {
            exporter.shutdown();
        }
    })
}
