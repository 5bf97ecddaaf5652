//! Single-shot HTTP/1.1 JSON exchanges over a [`Connector`] stream.
//!
//! Only what pairing and alert delivery need: one `POST` per connection with
//! `Connection: close`. Framing is left to hyper's HTTP/1 client, driven over
//! whatever stream the connector hands back.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::Request;
use hyper::header::{ACCEPT, CONNECTION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper_util::rt::TokioIo;
use log::debug;
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;

use crate::transport::{Connector, FailureClass, TransportError};

/// Responses larger than this are rejected rather than buffered.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

const AGENT: &str = concat!("companion-core/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("malformed HTTP response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// POST `body` as JSON to `https://host:port/path`, bounded by the connector's request timeout.
pub async fn post_json<T: Serialize + ?Sized>(
    connector: &dyn Connector,
    host: &str,
    port: u16,
    path: &str,
    body: &T,
) -> Result<HttpResponse, HttpError> {
    let payload = serde_json::to_vec(body).map_err(|e| HttpError::Malformed(e.to_string()))?;
    let request = build_post_request(host, path, payload)?;
    let budget = connector.request_timeout();
    let started = Instant::now();

    match timeout(budget, exchange(connector, host, port, request, budget)).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Transport(TransportError::failed(
            FailureClass::LateTimeout,
            started.elapsed(),
            format!("request to {}{} exceeded {:?}", host, path, budget),
        ))),
    }
}

pub fn build_post_request(host: &str, path: &str, payload: Vec<u8>) -> Result<Request<Full<Bytes>>, HttpError> {
    Request::post(path)
        .header(HOST, host)
        .header(USER_AGENT, AGENT)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCEPT, "application/json")
        .header(CONNECTION, "close")
        .body(Full::new(Bytes::from(payload)))
        .map_err(|e| HttpError::Malformed(format!("bad request target {:?}: {}", path, e)))
}

async fn exchange(
    connector: &dyn Connector,
    host: &str,
    port: u16,
    request: Request<Full<Bytes>>,
    budget: Duration,
) -> Result<HttpResponse, HttpError> {
    let started = Instant::now();
    let conn = connector.connect(host, port).await?;

    let failure = |e: hyper::Error| {
        if e.is_parse() || e.is_parse_status() {
            return HttpError::Malformed(e.to_string());
        }
        let elapsed = started.elapsed();
        HttpError::Transport(TransportError::failed(
            FailureClass::from_elapsed(elapsed, budget),
            elapsed,
            e.to_string(),
        ))
    };

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(conn))
        .await
        .map_err(failure)?;
    let host_label = host.to_string();
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("HTTP connection to {} ended: {}", host_label, e);
        }
    });

    let response = sender.send_request(request).await.map_err(failure)?;
    let status = response.status().as_u16();
    let body = Limited::new(response.into_body(), MAX_RESPONSE_BYTES)
        .collect()
        .await
        .map_err(|e| HttpError::Malformed(format!("response body: {}", e)))?
        .to_bytes()
        .to_vec();

    debug!("POST {} -> {} ({} bytes)", host, status, body.len());
    Ok(HttpResponse { status, body })
}
