// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tracing::{error, info};

use crate::errors::SinkError;
use crate::event::Event;

/// Destination for accepted events.
///
/// A sink is started once, receives any number of `write_events` calls and is
/// stopped once. `stop` drains whatever the sink still buffers before it
/// returns. `write_events` never reports errors to the caller; problems are
/// observable through metrics and logs only.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn start(&self) -> Result<(), SinkError>;

    async fn stop(&self);

    async fn write_events(&self, events: Vec<Event>);
}

/// Accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl Sink for NullSink {
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn write_events(&self, _events: Vec<Event>) {}
}

/// Logs every event as its JSON encoding at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugSink;

#[async_trait]
impl Sink for DebugSink {
    async fn start(&self) -> Result<(), SinkError> {
        info!("Debug analytics sink started");
        Ok(())
    }

    async fn stop(&self) {
        info!("Debug analytics sink stopped");
    }

    async fn write_events(&self, events: Vec<Event>) {
        for event in &events {
            match serde_json::to_string(event) {
                Ok(json) => info!("{} event: {}", event.category(), json),
                Err(e) => error!("Failed to encode {} event: {}", event.category(), e),
            }
        }
    }
}
