// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::http_utils::{create_json_response, log_and_create_http_response, HttpResponse};
use crate::intake::{IntakeHandler, ANALYTICS_PATH};
use crate::metrics::Registry;

pub const INFO_PATH: &str = "/info";

/// How long open connections get to finish after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct IntakeServer {
    handler: Arc<IntakeHandler>,
    registry: Registry,
}

impl IntakeServer {
    pub fn new(handler: Arc<IntakeHandler>, registry: Registry) -> Self {
        Self { handler, registry }
    }

    /// Serves HTTP/1 on `listener` until `cancel` fires.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let handler = self.handler.clone();
        let registry = self.registry.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            let registry = registry.clone();
            async move { Self::route(&handler, &registry, req).await }
        });

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        if let Ok(addr) = listener.local_addr() {
            debug!("Analytics intake listening on {}", addr);
        }

        loop {
            let conn = tokio::select! {
                () = cancel.cancelled() => break,
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while joinset.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                "Closing {} analytics intake connections still open after shutdown",
                joinset.len()
            );
            joinset.shutdown().await;
        }
        debug!("Analytics intake stopped");
        Ok(())
    }

    async fn route(
        handler: &IntakeHandler,
        registry: &Registry,
        req: Request<Incoming>,
    ) -> http::Result<HttpResponse> {
        match (req.method(), req.uri().path()) {
            (_, ANALYTICS_PATH) => handler.handle(req).await,
            (&Method::GET, INFO_PATH) => Self::info(registry),
            (method, path) => log_and_create_http_response(
                &format!("{method} {path} not found"),
                StatusCode::NOT_FOUND,
            ),
        }
    }

    fn info(registry: &Registry) -> http::Result<HttpResponse> {
        let body = json!({
            "endpoints": [ANALYTICS_PATH, INFO_PATH],
            "metrics": registry.snapshot(),
        });
        create_json_response(&body, StatusCode::OK)
    }
}
