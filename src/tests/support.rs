//! In-memory network plumbing shared by the wire-level tests.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::pairing::SessionTokens;
use crate::transport::{Connection, Connector, FailureClass, TransportError};

type ServerTask = Box<dyn FnOnce(DuplexStream) -> BoxFuture<'static, ()> + Send>;

/// Connector whose connections are served, in order, by scripted server tasks.
/// With no script left, connects fail as refused.
#[derive(Default)]
pub struct DuplexConnector {
    servers: Mutex<VecDeque<ServerTask>>,
    attempts: Mutex<Vec<String>>,
}

impl DuplexConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve<F, Fut>(&self, server: F)
    where
        F: FnOnce(DuplexStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.servers
            .lock()
            .unwrap()
            .push_back(Box::new(move |stream| Box::pin(server(stream))));
    }

    /// Hosts passed to `connect`, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self, host: &str, _port: u16) -> Result<Connection, TransportError> {
        self.attempts.lock().unwrap().push(host.to_string());
        let server = self.servers.lock().unwrap().pop_front();
        match server {
            Some(server) => {
                let (client, far) = tokio::io::duplex(256 * 1024);
                tokio::spawn(server(far));
                Ok(Box::new(client))
            }
            None => Err(TransportError::failed(
                FailureClass::EarlyNetwork,
                Duration::ZERO,
                "connection refused",
            )),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(2)
    }
}

/// Read one HTTP request; returns the head and the body.
pub async fn read_http_request(stream: &mut DuplexStream) -> (String, Vec<u8>) {
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while raw.len() - header_end < length {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        raw.extend_from_slice(&buf[..n]);
    }
    (head, raw[header_end..header_end + length].to_vec())
}

pub async fn write_http_response(stream: &mut DuplexStream, status: u16, body: &str) {
    let response = format!(
        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
}

/// Serve one HTTP exchange with a fixed reply; the request body lands in the returned slot.
pub fn serve_http(connector: &DuplexConnector, status: u16, body: &str) -> Arc<Mutex<Option<serde_json::Value>>> {
    let seen = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&seen);
    let body = body.to_string();
    connector.serve(move |mut stream| async move {
        let (_, request) = read_http_request(&mut stream).await;
        *slot.lock().unwrap() = serde_json::from_slice(&request).ok();
        write_http_response(&mut stream, status, &body).await;
    });
    seen
}

pub fn token_body(access: &str) -> String {
    format!(
        r#"{{"access_token":"{}","refresh_token":"refresh-{}","token_type":"bearer"}}"#,
        access, access
    )
}

pub fn tokens(access: &str) -> SessionTokens {
    SessionTokens {
        access_token: access.to_string(),
        refresh_token: format!("refresh-{}", access),
        token_type: "bearer".to_string(),
    }
}
