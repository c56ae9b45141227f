use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use super::MetricsCollector;
use crate::progress::ProgressStore;

struct Observed {
    progress: ProgressStore,
    metrics: MetricsCollector,
}

/// Serves the live progress store and step metrics to polling observers.
pub struct StatusServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl StatusServer {
    pub fn start(
        listen: SocketAddr,
        progress: ProgressStore,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let observed = Arc::new(Observed { progress, metrics });

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build status server runtime")?;

        let thread = std::thread::spawn(move || {
            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let observed = observed.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let observed = observed.clone();
                            async move { handle_request(req, observed).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(err.to_string())).ok();
                        return;
                    }
                };
                let addr = builder.local_addr();
                addr_tx.send(Ok(addr)).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Status server error");
                }
            });
        });

        let address = addr_rx
            .recv()
            .map_err(|_| anyhow!("Status server exited before binding"))?
            .map_err(|err| anyhow!("Failed to bind status server on {listen}: {err}"))?;

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    observed: Arc<Observed>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/status.json") => {
            let body = serde_json::to_vec(&observed.progress.snapshot())
                .unwrap_or_else(|_| b"{}".to_vec());
            json_response(body)
        }
        (&Method::GET, "/metrics") => {
            Response::new(Body::from(observed.metrics.snapshot().to_prometheus()))
        }
        (&Method::GET, "/metrics.json") => {
            let body = serde_json::to_vec(&observed.metrics.snapshot())
                .unwrap_or_else(|_| b"{}".to_vec());
            json_response(body)
        }
        _ => {
            let mut response = Response::new(Body::from(Bytes::from_static(b"Not Found")));
            *response.status_mut() = StatusCode::NOT_FOUND;
            response
        }
    };
    Ok(response)
}

fn json_response(body: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
