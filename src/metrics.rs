use actix_web::{get, HttpResponse};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, TextEncoder};

static WS_ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new(
        "clinic_messaging_ws_active_connections",
        "Authenticated realtime connections currently open",
    )
    .expect("failed to create clinic_messaging_ws_active_connections");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register clinic_messaging_ws_active_connections");
    gauge
});

static EVENTS_RELAYED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "clinic_messaging_events_relayed_total",
            "Committed-change events relayed to conversation rooms",
        ),
        &["kind"],
    )
    .expect("failed to create clinic_messaging_events_relayed_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register clinic_messaging_events_relayed_total");
    counter
});

static LIFECYCLE_OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "clinic_messaging_lifecycle_operations_total",
            "Conversation lifecycle operations by outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("failed to create clinic_messaging_lifecycle_operations_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register clinic_messaging_lifecycle_operations_total");
    counter
});

pub fn connection_opened() {
    WS_ACTIVE_CONNECTIONS.inc();
}

pub fn connection_closed() {
    WS_ACTIVE_CONNECTIONS.dec();
}

pub fn record_relayed(kind: &str) {
    EVENTS_RELAYED_TOTAL.with_label_values(&[kind]).inc();
}

/// `outcome` is "ok" or the error code of the failure
pub fn record_operation(operation: &str, outcome: &str) {
    LIFECYCLE_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

#[get("/metrics")]
pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
