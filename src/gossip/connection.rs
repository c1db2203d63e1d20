//! One multiplexed HTTP/2 connection per peer.
//!
//! The connection is dialled lazily on first use and re-dialled when hyper
//! reports it closed. Every request is an independent HTTP/2 stream, so
//! concurrent callers share the session and responses are correlated by
//! stream rather than by issue order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http2::{self, SendRequest};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info};

use super::error::{GossipError, GossipResult};
use crate::metrics::PEER_CONNECTIONS;
use crate::types::Ordinal;

/// Deadlines applied to every peer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerTimeouts {
    /// TCP connect plus HTTP/2 handshake.
    pub connect: Duration,
    /// One request/response round trip, body included.
    pub request: Duration,
}

impl Default for PeerTimeouts {
    fn default() -> Self {
        Self {
            connect: crate::constants::DEFAULT_CONNECT_TIMEOUT,
            request: crate::constants::DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Keeps the live-connection gauge accurate even when the driver task is
/// aborted.
struct ConnectionGauge;

impl ConnectionGauge {
    fn acquire() -> Self {
        PEER_CONNECTIONS.inc();
        ConnectionGauge
    }
}

impl Drop for ConnectionGauge {
    fn drop(&mut self) {
        PEER_CONNECTIONS.dec();
    }
}

/// Lazily established connection to one peer.
pub struct PeerConnection {
    ordinal: Ordinal,
    address: String,
    timeouts: PeerTimeouts,
    sender: tokio::sync::Mutex<Option<SendRequest<Full<Bytes>>>>,
    driver: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl PeerConnection {
    pub fn new(ordinal: Ordinal, address: impl Into<String>, timeouts: PeerTimeouts) -> Self {
        Self {
            ordinal,
            address: address.into(),
            timeouts,
            sender: tokio::sync::Mutex::new(None),
            driver: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn ordinal(&self) -> Ordinal {
        self.ordinal
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the session down. Calls in flight on it fail as unreachable and
    /// later calls are refused.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
        info!(ordinal = %self.ordinal, address = %self.address, "Peer connection closed");
    }

    fn unreachable(&self, reason: impl std::fmt::Display) -> GossipError {
        GossipError::Unreachable {
            ordinal: self.ordinal,
            reason: reason.to_string(),
        }
    }

    /// Dial the peer and spawn the task driving the HTTP/2 session.
    async fn connect(&self) -> GossipResult<SendRequest<Full<Bytes>>> {
        let handshake = async {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|e| self.unreachable(e))?;
            stream.set_nodelay(true).map_err(|e| self.unreachable(e))?;
            http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
                .await
                .map_err(|e| self.unreachable(e))
        };
        let (sender, connection) = timeout(self.timeouts.connect, handshake)
            .await
            .map_err(|_| GossipError::Timeout {
                ordinal: self.ordinal,
                after: self.timeouts.connect,
            })??;

        let ordinal = self.ordinal;
        let driver = tokio::spawn(async move {
            let _gauge = ConnectionGauge::acquire();
            if let Err(e) = connection.await {
                debug!(ordinal = %ordinal, error = %e, "Peer connection ended with error");
            }
        });

        let previous = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(driver.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        if self.is_closed() {
            driver.abort();
            return Err(self.unreachable("connection closed"));
        }

        debug!(ordinal = %self.ordinal, address = %self.address, "Peer connection established");
        Ok(sender)
    }

    /// A handle on the live session, dialling if there is none.
    async fn session(&self) -> GossipResult<SendRequest<Full<Bytes>>> {
        if self.is_closed() {
            return Err(self.unreachable("connection closed"));
        }
        let mut guard = self.sender.lock().await;
        if let Some(sender) = guard.as_ref().filter(|s| !s.is_closed()) {
            return Ok(sender.clone());
        }
        let sender = self.connect().await?;
        *guard = Some(sender.clone());
        Ok(sender)
    }

    /// Issue one request and collect the full response body.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> GossipResult<(StatusCode, Bytes)> {
        let mut sender = self.session().await?;
        let request = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.address, path))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| GossipError::Encoding(e.to_string()))?;

        let exchange = async {
            sender.ready().await?;
            let response = sender.send_request(request).await?;
            let status = response.status();
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, hyper::Error>((status, body))
        };

        match timeout(self.timeouts.request, exchange).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(self.unreachable(e)),
            Err(_) => Err(GossipError::Timeout {
                ordinal: self.ordinal,
                after: self.timeouts.request,
            }),
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(driver) = self
            .driver
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
    }
}
