//! Metrics exporter (ambient, spec §6): `/metrics` in Prometheus text
//! format, plus `/live` and `/ready` returning `ok`.
//!
//! Two independent instances run per process lifetime — the `liquidator`
//! binary binds `PROM_PORT` (default 9464), `arb-fabric` binds
//! `FABRIC_PROM_PORT` (default 9470). Grounded in
//! `bayeloone-mev-templates/rust` (the one pack repo with
//! `metrics-exporter-prometheus` for an MEV-style bot — the teacher itself
//! has no exporter). `hyper`'s `http1` connection builder is used directly
//! rather than pulling in a web framework, since the surface is three
//! fixed routes.

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Installs the global Prometheus recorder for this process and returns a
/// handle used to render `/metrics`. Each binary calls this exactly once,
/// at startup, before any `metrics::counter!`/`metrics::gauge!` call sites
/// run (spec §5 "Metrics registry: process-wide, write-many").
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new().install_recorder().expect("failed to install Prometheus recorder")
}

/// Serves `/metrics`, `/live`, `/ready` on `port` until the process exits
/// or the bind fails. `/live` and `/ready` both return `ok` unconditionally
/// (spec §6) — this crate has no deeper readiness probe than "the process
/// came up and installed its recorder".
pub async fn serve(handle: PrometheusHandle, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, error = %e, "metrics: failed to bind listener");
            return;
        }
    };
    info!(port, "metrics: listening");
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "metrics: accept failed");
                continue;
            }
        };
        let handle = handle.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| respond(req, handle.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                warn!(error = %e, "metrics: connection error");
            }
        });
    }
}

async fn respond(req: Request<Incoming>, handle: PrometheusHandle) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let body = match req.uri().path() {
        "/metrics" => handle.render(),
        "/live" | "/ready" => "ok".to_string(),
        _ => "not found".to_string(),
    };
    Ok(Response::new(Full::new(Bytes::from(body))))
}
