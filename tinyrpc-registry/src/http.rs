//! Registry HTTP endpoint.
//!
//! - `GET <path>`: 200 with the alive servers in the `X-Gorpc-Servers` header
//! - `POST <path>` with `X-Gorpc-Server`: records a heartbeat
//! - any other method: 405, any other path: 404

use crate::error::RegistryError;
use crate::registry::Registry;
use crate::{SERVERS_HEADER, SERVER_HEADER};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Serves the registry on `path` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    path: impl Into<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), RegistryError> {
    let path: Arc<str> = Arc::from(path.into());
    tracing::info!(
        "Registry listening on http://{}{}",
        listener.local_addr()?,
        path
    );

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let registry = registry.clone();
                        let path = path.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let response = respond(&req, &registry, &path);
                                async move { response }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Registry connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Registry accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Registry shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn respond<B>(
    req: &Request<B>,
    registry: &Registry,
    path: &str,
) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    if req.uri().path() != path {
        return status(StatusCode::NOT_FOUND);
    }

    match *req.method() {
        Method::GET => Response::builder()
            .status(StatusCode::OK)
            .header(SERVERS_HEADER, registry.alive_servers().join(","))
            .body(Full::new(Bytes::new())),
        Method::POST => {
            let addr = req
                .headers()
                .get(SERVER_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .unwrap_or_default();
            if addr.is_empty() {
                tracing::warn!("Registry: heartbeat without {} header", SERVER_HEADER);
                return status(StatusCode::INTERNAL_SERVER_ERROR);
            }
            registry.put_server(addr);
            status(StatusCode::OK)
        }
        _ => status(StatusCode::METHOD_NOT_ALLOWED),
    }
}

fn status(code: StatusCode) -> Result<Response<Full<Bytes>>, hyper::http::Error> {
    Response::builder().status(code).body(Full::new(Bytes::new()))
}
