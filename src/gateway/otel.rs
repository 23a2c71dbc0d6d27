use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{KeyValue, global};
use opentelemetry_otlp::SpanExporter;
use opentelemetry_otlp::WithExportConfig as _;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use super::config::RelayConfig;

const SERVICE_NAME: &str = "ditto-relay";

/// Flushes buffered spans when dropped. Keep it alive until the relay has shut down.
#[derive(Debug)]
pub struct TelemetryGuard {
    provider: SdkTracerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Err(err) = self.provider.shutdown() {
            eprintln!("otel shutdown failed: {err}");
        }
    }
}

/// Resource attributes describing this relay instance. The admin token is never included.
pub fn relay_resource_attributes(config: &RelayConfig) -> Vec<KeyValue> {
    vec![
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        KeyValue::new("relay.listen", config.listen.clone()),
        KeyValue::new("relay.store.backend", config.store.backend.as_str()),
        KeyValue::new("relay.upstream.base_url", config.upstream.base_url.clone()),
        KeyValue::new("relay.external_model_id", config.external_model_id.clone()),
        KeyValue::new("relay.admin_enabled", config.admin_token.is_some()),
    ]
}

/// Installs the relay's fmt layer plus an OTLP/HTTP span exporter.
///
/// `endpoint` falls back to the exporter's environment defaults when unset.
pub fn init_tracing(
    config: &RelayConfig,
    endpoint: Option<&str>,
) -> Result<TelemetryGuard, Box<dyn std::error::Error + Send + Sync>> {
    let mut exporter = SpanExporter::builder().with_http();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_string());
    }
    let exporter = exporter.build()?;

    let resource = Resource::builder_empty()
        .with_service_name(SERVICE_NAME)
        .with_attributes(relay_resource_attributes(config))
        .build();
    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME));
    tracing_subscriber::registry()
        .with(super::log_filter())
        .with(super::fmt_layer(config.json_logs))
        .with(otel_layer)
        .try_init()?;

    Ok(TelemetryGuard { provider })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::StoreBackend;

    fn attribute(attributes: &[KeyValue], key: &str) -> Option<String> {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    #[test]
    fn resource_describes_the_relay_without_secrets() {
        let mut config = RelayConfig::default();
        config.listen = "0.0.0.0:9000".to_string();
        config.store.backend = StoreBackend::Sqlite;
        config.admin_token = Some("adm-secret".to_string());

        let attributes = relay_resource_attributes(&config);
        assert_eq!(attribute(&attributes, "relay.listen").as_deref(), Some("0.0.0.0:9000"));
        assert_eq!(attribute(&attributes, "relay.store.backend").as_deref(), Some("sqlite"));
        assert_eq!(attribute(&attributes, "relay.admin_enabled").as_deref(), Some("true"));
        assert!(
            attributes
                .iter()
                .all(|kv| !kv.value.to_string().contains("adm-secret"))
        );
    }
}
