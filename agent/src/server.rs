//! Local exposition server
//!
//! Serves `/metrics` (latest snapshot plus a fresh registry gather),
//! `/healthz` and `/metrics/agent` (the agent's own metrics).

use crate::error::AgentError;
use crate::metrics;
use crate::registry::Registry;
use async_trait::async_trait;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_shared::render;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Serves exposed snapshots until cancelled
#[async_trait]
pub trait ExpositionServer: Send {
    async fn run(self: Box<Self>, cancel: CancellationToken);
}

struct State {
    latest: RwLock<String>,
    registry: Arc<Registry>,
}

impl State {
    fn latest(&self) -> String {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store(&self, snapshot: String) {
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }
}

pub struct HttpExpositionServer {
    listener: TcpListener,
    snapshots: mpsc::Receiver<String>,
    registry: Arc<Registry>,
}

impl HttpExpositionServer {
    /// Bind `addr` now so a busy port fails the generation at startup
    pub fn bind(
        addr: SocketAddr,
        snapshots: mpsc::Receiver<String>,
        registry: Arc<Registry>,
    ) -> Result<Self, AgentError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            snapshots,
            registry,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

#[async_trait]
impl ExpositionServer for HttpExpositionServer {
    async fn run(self: Box<Self>, cancel: CancellationToken) {
        let Self {
            listener,
            mut snapshots,
            registry,
        } = *self;

        let state = Arc::new(State {
            latest: RwLock::new(String::new()),
            registry,
        });

        let drain_state = state.clone();
        let drain_cancel = cancel.clone();
        let drain = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = drain_cancel.cancelled() => break,
                    snapshot = snapshots.recv() => match snapshot {
                        Some(snapshot) => drain_state.store(snapshot),
                        None => break,
                    },
                }
            }
        });

        let addr = listener.local_addr().ok();
        let builder = match Server::from_tcp(listener) {
            Ok(builder) => builder,
            Err(e) => {
                error!("Exposition server failed to start: {}", e);
                drain.abort();
                return;
            }
        };

        let make_svc = make_service_fn(move |_| {
            let state = state.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |req: Request<Body>| {
                    let state = state.clone();
                    async move { handle(req, &state).await }
                }))
            }
        });

        if let Some(addr) = addr {
            info!("Exposition server listening on {}", addr);
        }

        let shutdown = cancel.clone();
        let server = builder
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = server.await {
            error!("Exposition server error: {}", e);
        }

        if let Err(e) = drain.await {
            warn!("Snapshot drain task failed: {}", e);
        }
        info!("Exposition server stopped");
    }
}

async fn handle(req: Request<Body>, state: &State) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path();
    debug!("{} {}", req.method(), path);

    let response = match path {
        "/metrics" => {
            let mut body = state.latest();
            match state.registry.gather().await {
                Ok(gathered) => match render(&gathered) {
                    Ok(text) => body.push_str(&text),
                    Err(e) => warn!("Failed to render registry metrics: {}", e),
                },
                Err(e) => warn!("{:#}", anyhow::Error::from(e)),
            }
            text(StatusCode::OK, body)
        }

        "/healthz" => text(StatusCode::OK, "ok\n".to_string()),

        "/metrics/agent" => match metrics::encode_metrics() {
            Ok(body) => text(StatusCode::OK, body),
            Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
        },

        _ => text(StatusCode::NOT_FOUND, "not found\n".to_string()),
    };

    Ok(response)
}

fn text(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_FORMAT));
    response
}
