//! Request bodies and URL routes of the peer RPC surface.
//!
//! ```text
//! GET  /status                       liveness probe
//! GET  /metrics                      Prometheus text
//! GET  /generations/{token}          [committed, proposed]
//! POST /generations/{token}          { generation, expectedTx }
//! POST /generations/{token}/accept   Generation
//! POST /generations/{token}/commit   { tx }
//! POST /generations/{token}/cancel   { tx }
//! POST /generations/{token}/catchup  { generation, expectedTx }
//! ```

use hyper::Method;
use serde::{Deserialize, Serialize};

use crate::types::{Generation, Token, TransactionId};

pub const STATUS_PATH: &str = "/status";
pub const METRICS_PATH: &str = "/metrics";
const GENERATIONS_PREFIX: &str = "/generations/";

/// Body of `POST /generations/{token}` and of the catch-up route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeRequest {
    pub generation: Generation,
    pub expected_tx: Option<TransactionId>,
}

/// Body of the commit and cancel routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxRequest {
    pub tx: TransactionId,
}

pub fn generations_path(token: Token) -> String {
    format!("{GENERATIONS_PREFIX}{token}")
}

pub fn accept_path(token: Token) -> String {
    format!("{GENERATIONS_PREFIX}{token}/accept")
}

pub fn commit_path(token: Token) -> String {
    format!("{GENERATIONS_PREFIX}{token}/commit")
}

pub fn cancel_path(token: Token) -> String {
    format!("{GENERATIONS_PREFIX}{token}/cancel")
}

pub fn catch_up_path(token: Token) -> String {
    format!("{GENERATIONS_PREFIX}{token}/catchup")
}

/// A request routed by method and path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Status,
    Metrics,
    GetGenerations(Token),
    Propose(Token),
    Accept(Token),
    Commit(Token),
    Cancel(Token),
    CatchUp(Token),
    /// The path names a generation route but the token does not parse.
    BadToken,
    NotFound,
}

impl Route {
    pub fn parse(method: &Method, path: &str) -> Route {
        match (method, path) {
            (&Method::GET, STATUS_PATH) => return Route::Status,
            (&Method::GET, METRICS_PATH) => return Route::Metrics,
            _ => {}
        }

        let Some(rest) = path.strip_prefix(GENERATIONS_PREFIX) else {
            return Route::NotFound;
        };
        let (token, action) = match rest.split_once('/') {
            Some((token, action)) => (token, Some(action)),
            None => (rest, None),
        };
        let Ok(token) = token.parse::<Token>() else {
            return Route::BadToken;
        };

        match (method, action) {
            (&Method::GET, None) => Route::GetGenerations(token),
            (&Method::POST, None) => Route::Propose(token),
            (&Method::POST, Some("accept")) => Route::Accept(token),
            (&Method::POST, Some("commit")) => Route::Commit(token),
            (&Method::POST, Some("cancel")) => Route::Cancel(token),
            (&Method::POST, Some("catchup")) => Route::CatchUp(token),
            _ => Route::NotFound,
        }
    }

    /// Returns a low-cardinality label for metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            Route::Status => "status",
            Route::Metrics => "metrics",
            Route::GetGenerations(_) => "get_generations",
            Route::Propose(_) => "propose",
            Route::Accept(_) => "accept",
            Route::Commit(_) => "commit",
            Route::Cancel(_) => "cancel",
            Route::CatchUp(_) => "catch_up",
            Route::BadToken => "bad_token",
            Route::NotFound => "not_found",
        }
    }
}
