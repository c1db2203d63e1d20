//! Inbound side of the gossip transport: an HTTP/2 server answering peer
//! RPCs.
//!
//! Reads are served straight from the local store. Writes are decoded,
//! checked against the URL token, and handed to the registered
//! [`GenListener`](super::GenListener); the server never decides on a
//! transition itself.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::error::{ErrorBody, ErrorKind, GossipError, GossipResult};
use super::messages::{ProposeRequest, Route, TxRequest};
use super::transport::GossipTransport;
use super::GenListener;
use crate::error::GenerationResult;
use crate::generation::GenerationStore;
use crate::metrics::{encode_metrics, record_inbound};
use crate::types::{Generation, Token};

/// Shared by every connection the server accepts.
struct ServerState {
    port: u16,
    store: Arc<dyn GenerationStore>,
    transport: Arc<GossipTransport>,
}

/// HTTP/2 server for the peer RPC surface.
pub struct GossipServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    max_concurrent_streams: u32,
    shutdown_tx: broadcast::Sender<()>,
}

impl GossipServer {
    /// Bind the server to `addr`, e.g. `0.0.0.0:7000`.
    pub async fn bind(
        addr: &str,
        store: Arc<dyn GenerationStore>,
        transport: Arc<GossipTransport>,
        max_concurrent_streams: u32,
    ) -> GossipResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GossipError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| GossipError::Bind {
                addr: addr.to_string(),
                source,
            })?
            .port();
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(addr = %addr, port, "Gossip server listening");

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                port,
                store,
                transport,
            }),
            max_concurrent_streams,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Initiate graceful shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        info!("Gossip server shutdown signal sent");
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> GossipResult<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Gossip server shutting down");
                    return Ok(());
                }
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!(peer_addr = %addr, "Gossip connection accepted");
                            let _ = stream.set_nodelay(true);
                            let state = self.state.clone();
                            let mut conn_shutdown = self.shutdown_tx.subscribe();
                            let builder = {
                                let mut builder = http2::Builder::new(TokioExecutor::new());
                                builder.max_concurrent_streams(self.max_concurrent_streams);
                                builder
                            };

                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { Ok::<_, Infallible>(handle(&state, req).await) }
                                });
                                let connection = builder.serve_connection(TokioIo::new(stream), service);
                                tokio::select! {
                                    result = connection => {
                                        if let Err(e) = result {
                                            debug!(peer_addr = %addr, error = %e, "Gossip connection ended with error");
                                        }
                                    }
                                    _ = conn_shutdown.recv() => {
                                        debug!(peer_addr = %addr, "Gossip connection dropped on shutdown");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = ?e, "Failed to accept gossip connection");
                        }
                    }
                }
            }
        }
    }
}

type HttpResponse = Response<Full<Bytes>>;

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn json_response<T: Serialize>(value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => response(StatusCode::OK, "application/json", body),
        Err(e) => error_response(&ErrorBody::internal(e)),
    }
}

fn error_response(body: &ErrorBody) -> HttpResponse {
    let status =
        StatusCode::from_u16(body.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let payload = serde_json::to_vec(body).unwrap_or_default();
    response(status, "application/json", payload)
}

fn ok_response() -> HttpResponse {
    response(StatusCode::OK, "application/json", Bytes::new())
}

async fn decode<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, ErrorBody> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(ErrorBody::malformed)?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(ErrorBody::malformed)
}

fn check_token(token: Token, generation: &Generation) -> Result<(), ErrorBody> {
    if generation.start != token {
        return Err(ErrorBody::malformed(format!(
            "generation starts at {}, url names {}",
            generation.start, token
        )));
    }
    Ok(())
}

fn write_response(result: GenerationResult<()>) -> HttpResponse {
    match result {
        Ok(()) => ok_response(),
        Err(e) => {
            debug!(error = %e, "Inbound generation write refused");
            error_response(&ErrorBody::from(&e))
        }
    }
}

/// Decode a write request and hand it to the listener.
///
/// The outer error is a request the listener never saw; the inner result is
/// the listener's verdict.
async fn dispatch_write(
    listener: &dyn GenListener,
    route: Route,
    req: Request<Incoming>,
) -> Result<GenerationResult<()>, ErrorBody> {
    match route {
        Route::Propose(token) => {
            let body: ProposeRequest = decode(req).await?;
            check_token(token, &body.generation)?;
            Ok(listener
                .on_remote_set_as_proposed(body.generation, body.expected_tx)
                .await)
        }
        Route::Accept(token) => {
            let generation: Generation = decode(req).await?;
            check_token(token, &generation)?;
            Ok(listener.on_remote_set_as_accepted(generation).await)
        }
        Route::Commit(token) => {
            let body: TxRequest = decode(req).await?;
            Ok(listener.on_remote_set_as_committed(token, body.tx).await)
        }
        Route::Cancel(token) => {
            let body: TxRequest = decode(req).await?;
            Ok(listener.on_remote_set_as_cancelled(token, body.tx).await)
        }
        Route::CatchUp(token) => {
            let body: ProposeRequest = decode(req).await?;
            check_token(token, &body.generation)?;
            Ok(listener
                .on_remote_catch_up(body.generation, body.expected_tx)
                .await)
        }
        other => Err(ErrorBody::malformed(format!(
            "{} is not a write route",
            other.as_label()
        ))),
    }
}

async fn handle(state: &ServerState, req: Request<Incoming>) -> HttpResponse {
    let route = Route::parse(req.method(), req.uri().path());
    let response = route_request(state, route, req).await;
    record_inbound(route.as_label(), response.status().as_u16());
    response
}

async fn route_request(state: &ServerState, route: Route, req: Request<Incoming>) -> HttpResponse {
    match route {
        Route::Status => response(
            StatusCode::OK,
            "text/plain",
            format!("Peer listening on {}\n", state.port),
        ),
        Route::Metrics => match encode_metrics() {
            Ok(text) => response(StatusCode::OK, "text/plain; version=0.0.4", text),
            Err(e) => error_response(&ErrorBody::internal(e)),
        },
        Route::GetGenerations(token) => json_response(&state.store.get(token)),
        Route::BadToken => error_response(&ErrorBody::malformed("token is not an integer")),
        Route::NotFound => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
        write => {
            let listener = match state.transport.listener() {
                Ok(listener) => listener,
                Err(e) => return error_response(&ErrorBody::new(ErrorKind::Unavailable, e.to_string())),
            };
            let result = dispatch_write(listener.as_ref(), write, req).await;
            match result {
                Ok(written) => write_response(written),
                Err(body) => error_response(&body),
            }
        }
    }
}
