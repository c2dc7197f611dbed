// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use analytics::{
    intake::IntakeHandler,
    metrics::Registry,
    server::IntakeServer,
    shipper::Shipper,
    sink::{NullSink, Sink},
    spool::FileSpoolSink,
    stream::HttpStreamClient,
};

use crate::config::AgentConfig;

#[tokio::main]
pub async fn main() {
    let config = match AgentConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading analytics agent configuration: {e}");
            return;
        }
    };

    let env_filter = format!(
        "h2=off,hyper=off,rustls=off,reqwest=off,{}",
        config.log_level
    );

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let registry = Registry::new();
    let sink = match build_sink(&config, &registry) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Error creating analytics sink: {e}");
            return;
        }
    };
    if let Err(e) = sink.start().await {
        error!("Error starting analytics sink: {e}");
        return;
    }

    let listener = match TcpListener::bind(config.listen_addr()).await {
        Ok(l) => l,
        Err(e) => {
            error!("Unable to bind {}: {e}", config.listen_addr());
            sink.stop().await;
            return;
        }
    };
    info!("Analytics intake listening on {}", config.listen_addr());

    let handler = Arc::new(IntakeHandler::new(
        Arc::clone(&sink),
        config.intake.clone(),
        &registry,
    ));
    let server = IntakeServer::new(handler, registry);
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = server.serve(listener, server_cancel).await {
            error!("Analytics intake server failed: {e}");
        }
    });

    wait_for_shutdown().await;
    info!("Shutting down analytics agent");

    cancel.cancel();
    if let Err(e) = server_task.await {
        error!("Analytics intake task failed: {e}");
    }
    sink.stop().await;
    info!("Analytics agent stopped");
}

fn build_sink(
    config: &AgentConfig,
    registry: &Registry,
) -> Result<Arc<dyn Sink>, Box<dyn std::error::Error>> {
    if let Some(stream) = &config.stream {
        info!("Shipping analytics events to {}", stream.base_url);
        let client = Arc::new(HttpStreamClient::new(stream.clone())?);
        let shipper = Shipper::new(
            client,
            config.shipper.clone(),
            &registry.scope("analytics.shipper"),
        )?;
        return Ok(Arc::new(shipper));
    }
    if let Some(spool) = &config.spool {
        info!("Spooling analytics events to {}", spool.root.display());
        return Ok(Arc::new(FileSpoolSink::new(
            spool.clone(),
            &registry.scope("analytics.spool"),
        )));
    }
    warn!("No stream URL or spool path configured, analytics events will be discarded");
    Ok(Arc::new(NullSink))
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            error!("Failed to listen for Ctrl+C: {e}");
                        }
                    }
                    _ = sigterm.recv() => debug!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => error!("Failed to listen for SIGTERM: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {e}");
    }
}
