//! HTTP/1.1 serve loop.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use super::listener::BoundListener;
use super::shutdown::ShutdownHandle;
use crate::app::{Application, Response, Scope};

/// Pause after a failed accept (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How the serve loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownKind {
    /// Every in-flight connection finished within the grace period.
    Graceful,
    /// The grace period ran out or a second stop request arrived.
    Forced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServeSummary {
    pub connections: u64,
    pub shutdown: ShutdownKind,
}

/// Accept connections until a stop is requested, then drain.
///
/// The listener is dropped as soon as the stop request is seen, so no
/// connection is accepted afterwards.
pub async fn serve(
    listener: BoundListener,
    app: Arc<dyn Application>,
    shutdown: ShutdownHandle,
    grace_period: Duration,
) -> ServeSummary {
    let local_addr = listener.local_addr();
    let graceful = GracefulShutdown::new();
    let mut tasks = JoinSet::new();
    let mut connections = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.requested() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                };
                connections += 1;

                let app = Arc::clone(&app);
                let service = service_fn(move |req| handle(Arc::clone(&app), req, peer, local_addr));
                let conn = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .serve_connection(TokioIo::new(stream), service);
                let conn = graceful.watch(conn);
                tasks.spawn(async move {
                    if let Err(e) = conn.await {
                        tracing::debug!(peer = %peer, "Connection error: {}", e);
                    }
                });
            }
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    drop(listener);
    tracing::info!(in_flight = tasks.len(), grace_ms = grace_period.as_millis() as u64, "Draining connections");

    let kind = if shutdown.is_forced() {
        ShutdownKind::Forced
    } else {
        tokio::select! {
            _ = graceful.shutdown() => ShutdownKind::Graceful,
            _ = tokio::time::sleep(grace_period) => ShutdownKind::Forced,
            _ = shutdown.forced() => ShutdownKind::Forced,
        }
    };

    if kind == ShutdownKind::Forced {
        tracing::warn!(aborted = tasks.len(), "Aborting in-flight connections");
        tasks.abort_all();
    }
    while tasks.join_next().await.is_some() {}

    ServeSummary {
        connections,
        shutdown: kind,
    }
}

async fn handle(
    app: Arc<dyn Application>,
    req: Request<Incoming>,
    peer: SocketAddr,
    local_addr: SocketAddr,
) -> Result<hyper::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::debug!(peer = %peer, "Failed to read request body: {}", e);
            return Ok(into_hyper(Response::text(
                StatusCode::BAD_REQUEST,
                "failed to read request body",
            )));
        }
    };

    let scope = Scope {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        headers: parts.headers,
        client: Some(peer),
        server: local_addr,
    };
    let method = scope.method.clone();
    let path = scope.path.clone();

    let response = app.call(scope, body).await;
    tracing::debug!(method = %method, path = %path, status = response.status.as_u16(), "Handled request");
    Ok(into_hyper(response))
}

fn into_hyper(response: Response) -> hyper::Response<Full<Bytes>> {
    let mut builder = hyper::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(Full::new(response.body)).unwrap_or_else(|e| {
        tracing::warn!("Application returned an invalid response: {}", e);
        let mut fallback = hyper::Response::new(Full::new(Bytes::from_static(b"invalid response")));
        *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        fallback
    })
}
