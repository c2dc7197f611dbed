// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock sinks for testing

use analytics::{errors::SinkError, event::Event, sink::Sink};
use std::sync::Mutex;

/// Sink that keeps every event it is handed
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Sink for RecordingSink {
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn write_events(&self, events: Vec<Event>) {
        self.events.lock().unwrap().extend(events);
    }
}
