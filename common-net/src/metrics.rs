use std::net::SocketAddr;

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use once_cell::sync::OnceCell;
use prometheus::{
    register_gauge, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder,
    Gauge, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::BoxError;
use crate::message::ControlKind;
use crate::shutdown::{self, ShutdownReceiver};

/// Control-plane metrics for any node that runs sessions.
pub struct SignalingMetrics {
    pub active_sessions: IntGauge,
    pub messages_routed_total: IntCounterVec,
    pub decode_errors_total: IntCounter,
    pub sessions_closed_total: IntCounterVec,
}

impl SignalingMetrics {
    pub fn set_active_sessions(&self, sessions: usize) {
        self.active_sessions.set(sessions as i64);
    }

    pub fn inc_routed(&self, kind: ControlKind) {
        self.messages_routed_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    pub fn inc_decode_errors(&self) {
        self.decode_errors_total.inc();
    }

    pub fn inc_closed(&self, reason: &str) {
        self.sessions_closed_total
            .with_label_values(&[reason])
            .inc();
    }
}

pub struct MediaMetrics {
    pub units_sent_total: IntCounter,
    pub units_dropped_total: IntCounter,
    pub latency_ms: Gauge,
}

impl MediaMetrics {
    pub fn inc_sent(&self, units: u64) {
        self.units_sent_total.inc_by(units);
    }

    pub fn inc_dropped(&self, units: u64) {
        self.units_dropped_total.inc_by(units);
    }

    pub fn set_latency_ms(&self, latency_ms: f64) {
        self.latency_ms.set(latency_ms);
    }
}

static SIGNALING_METRICS: OnceCell<SignalingMetrics> = OnceCell::new();
static MEDIA_METRICS: OnceCell<MediaMetrics> = OnceCell::new();

pub fn signaling_metrics() -> &'static SignalingMetrics {
    SIGNALING_METRICS.get_or_init(|| SignalingMetrics {
        active_sessions: register_int_gauge!(
            "signaling_active_sessions",
            "Peer sessions currently held by the registry"
        )
        .expect("register signaling_active_sessions"),
        messages_routed_total: register_int_counter_vec!(
            "signaling_messages_routed_total",
            "Control messages routed, by kind",
            &["kind"]
        )
        .expect("register signaling_messages_routed_total"),
        decode_errors_total: register_int_counter!(
            "signaling_decode_errors_total",
            "Inbound control units that failed to decode"
        )
        .expect("register signaling_decode_errors_total"),
        sessions_closed_total: register_int_counter_vec!(
            "signaling_sessions_closed_total",
            "Sessions closed, by reason",
            &["reason"]
        )
        .expect("register signaling_sessions_closed_total"),
    })
}

pub fn media_metrics() -> &'static MediaMetrics {
    MEDIA_METRICS.get_or_init(|| MediaMetrics {
        units_sent_total: register_int_counter!(
            "media_units_sent_total",
            "Media units handed to peers"
        )
        .expect("register media_units_sent_total"),
        units_dropped_total: register_int_counter!(
            "media_units_dropped_total",
            "Media units discarded by drop-oldest queues"
        )
        .expect("register media_units_dropped_total"),
        latency_ms: register_gauge!(
            "media_latency_smoothed_ms",
            "Latest smoothed end-to-end latency in milliseconds"
        )
        .expect("register media_latency_smoothed_ms"),
    })
}

pub fn metrics_router(metrics_path: &'static str) -> Router {
    Router::new().route(metrics_path, get(metrics_handler))
}

pub async fn serve_metrics(
    listener: TcpListener,
    metrics_path: &'static str,
    shutdown_rx: ShutdownReceiver,
) -> Result<(), BoxError> {
    // Touch both sets so every series is exported from the first scrape.
    signaling_metrics();
    media_metrics();

    axum::serve(listener, metrics_router(metrics_path))
        .with_graceful_shutdown(shutdown::wait(shutdown_rx))
        .await
        .map_err(|err| Box::new(err) as BoxError)
}

pub fn spawn_metrics_exporter(
    addr: SocketAddr,
    metrics_path: &'static str,
    service: &'static str,
    shutdown_rx: ShutdownReceiver,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(service, %addr, path = metrics_path, "metrics exporter listening");
                if let Err(err) = serve_metrics(listener, metrics_path, shutdown_rx).await {
                    error!(%err, service, %addr, "metrics exporter stopped unexpectedly");
                }
            }
            Err(err) => {
                error!(%err, service, %addr, "metrics exporter could not bind");
            }
        }
    })
}

async fn metrics_handler() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(%err, "metrics encode failed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    match String::from_utf8(buffer) {
        Ok(body) => ([(header::CONTENT_TYPE, encoder.format_type().to_owned())], body).into_response(),
        Err(err) => {
            error!(%err, "metrics output is not UTF-8");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
