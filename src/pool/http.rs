//! HTTP/1.1 downstream connector.
//!
//! Each pooled connection is a hyper `SendRequest` bound to one TCP stream;
//! payloads are POSTed to the server's configured path. 5xx responses are
//! downstream failures, everything else is handed back as the response body.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::config::ServerConfig;
use crate::pool::connector::{ConnectError, Connector, DownstreamFailure};

/// Connects to one HTTP backend.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    address: String,
    path: String,
}

impl HttpConnector {
    pub fn new(address: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
        }
    }

    pub fn from_config(server: &ServerConfig) -> Self {
        Self::new(server.address.clone(), server.path.clone())
    }
}

impl Connector for HttpConnector {
    type Connection = SendRequest<Full<Bytes>>;

    async fn connect(&self) -> Result<Self::Connection, ConnectError> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(address = %address, error = %e, "Downstream connection closed with error");
            }
        });

        Ok(sender)
    }

    async fn call(&self, sender: &mut Self::Connection, payload: Bytes) -> Result<Bytes, DownstreamFailure> {
        sender.ready().await.map_err(transport)?;

        let request = Request::builder()
            .method(Method::POST)
            .uri(self.path.as_str())
            .header(HOST, self.address.as_str())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(payload))
            .map_err(|e| DownstreamFailure::Transport(e.to_string()))?;

        let response = sender.send_request(request).await.map_err(transport)?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(transport)?
            .to_bytes();

        if status.is_server_error() {
            return Err(DownstreamFailure::Status(status.as_u16()));
        }
        Ok(body)
    }

    fn is_reusable(&self, sender: &Self::Connection) -> bool {
        !sender.is_closed()
    }
}

fn transport(e: hyper::Error) -> DownstreamFailure {
    DownstreamFailure::Transport(e.to_string())
}
