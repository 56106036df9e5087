//! Prometheus metrics and health endpoints

use crate::error::ControllerError;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Controller metrics, registered once at startup
#[derive(Debug)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    reconcile_errors: IntCounterVec,
    ready: AtomicBool,
}

impl Metrics {
    /// Creates and registers all counters
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new(
                "microvm_controller_reconciliations_total",
                "Reconciliation passes per resource kind",
            ),
            &["kind"],
        )?;
        let reconcile_errors = IntCounterVec::new(
            Opts::new(
                "microvm_controller_reconcile_errors_total",
                "Failed reconciliation passes per resource kind",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_errors,
            ready: AtomicBool::new(false),
        })
    }

    /// Counts a reconciliation pass of `kind`
    pub fn reconciled(&self, kind: &str) {
        self.reconciliations.with_label_values(&[kind]).inc();
    }

    /// Counts a failed reconciliation pass of `kind`
    pub fn failed(&self, kind: &str) {
        self.reconcile_errors.with_label_values(&[kind]).inc();
    }

    /// Passes counted for `kind`
    pub fn reconciliations(&self, kind: &str) -> u64 {
        self.reconciliations.with_label_values(&[kind]).get()
    }

    /// Failures counted for `kind`
    pub fn errors(&self, kind: &str) -> u64 {
        self.reconcile_errors.with_label_values(&[kind]).get()
    }

    /// Flags the controllers as running
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, ControllerError> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    if metrics.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

/// Router serving `/metrics`, `/healthz` and `/readyz`
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(metrics)
}

/// Serves the router on `addr` until the process exits
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>) -> Result<(), ControllerError> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ControllerError::InvalidConfig(format!("cannot bind {}: {}", addr, e)))?;
    info!("Serving metrics and health probes on {}", addr);
    axum::serve(listener, router(metrics))
        .await
        .map_err(|e| ControllerError::Watch(format!("metrics server failed: {}", e)))
}
