// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use analytics::{intake::IntakeHandler, metrics::Registry, server::IntakeServer};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Intake server bound to an ephemeral local port
pub struct RunningServer {
    pub port: u16,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl RunningServer {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("server did not shut down")
            .expect("server task failed");
    }
}

/// Start an intake server on 127.0.0.1 with an OS assigned port
pub async fn start_server(handler: Arc<IntakeHandler>, registry: Registry) -> RunningServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("unable to bind test listener");
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();
    let server = IntakeServer::new(handler, registry);
    let server_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        server
            .serve(listener, server_cancel)
            .await
            .expect("server failed");
    });
    RunningServer {
        port,
        cancel,
        handle,
    }
}

/// Send an HTTP request over TCP and return the response
pub async fn send_tcp_request(
    port: u16,
    uri: &str,
    method: &str,
    headers: &[(&str, &str)],
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(
        Duration::from_secs(2),
        tokio::net::TcpStream::connect(format!("127.0.0.1:{}", port)),
    )
    .await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let mut request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Content-Type", "application/json");
    for (name, value) in headers {
        request_builder = request_builder.header(*name, *value);
    }

    let body = body.unwrap_or_default();
    let request = request_builder
        .header("Content-Length", body.len().to_string())
        .body(Full::new(Bytes::from(body)))?;
    let response = timeout(Duration::from_secs(2), sender.send_request(request)).await??;

    Ok(response)
}

/// Read a response body to a JSON value
pub async fn body_json(response: Response<hyper::body::Incoming>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).expect("response body is not JSON")
}

/// Seconds since the Unix epoch
pub fn epoch_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
