// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client event intake.
//!
//! Decodes a JSON batch of raw client events, corrects their timestamps for
//! client clock skew, enriches them with the device and app descriptors carried
//! in request headers and forwards the valid ones to a [`Sink`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::{http, HeaderMap, Method, Request, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::Timestamp;
use crate::event::{mangle_event_name, ClientEvent, Event};
use crate::http_utils::{log_and_create_http_response, verify_request_content_length, HttpResponse};
use crate::metrics::{Counter, Registry};
use crate::sink::Sink;

pub const ANALYTICS_PATH: &str = "/v1/event/client";
pub const METRICS_SCOPE: &str = "analytics.event.client";

pub const DEFAULT_INVALID_TIME_THRESHOLD: Duration = Duration::from_secs(30 * 24 * 60 * 60);
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 10 * 1024 * 1024;

/// `platform;platform_version`, e.g. `iOS;7.1.1`.
pub const OS_HEADER: &str = "s-os";
/// `app_type;app_env;app_version;app_build`, e.g. `Patient;Feature;0.9.0;000105`.
pub const VERSION_HEADER: &str = "s-version";
/// `device_type;device_model;screen_width;screen_height;screen_resolution`,
/// e.g. `Phone;iPhone6,1;640;1136;2.0`.
pub const DEVICE_HEADER: &str = "s-device";
pub const DEVICE_ID_HEADER: &str = "s-device-id";

#[derive(Debug, Clone)]
pub struct IntakeConfig {
    /// Events older than this, after skew correction, are dropped.
    pub invalid_time_threshold: Duration,
    pub max_request_bytes: usize,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            invalid_time_threshold: DEFAULT_INVALID_TIME_THRESHOLD,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct IntakeRequest {
    /// The client's clock at send time, in seconds since the epoch.
    #[serde(default)]
    pub current_time: f64,
    #[serde(default)]
    pub events: Vec<IntakeRecord>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IntakeRecord {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

/// Device and app descriptors supplied by the caller. Informational only.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnrichmentHeaders {
    pub platform: String,
    pub platform_version: String,
    pub app_type: String,
    pub app_env: String,
    pub app_version: String,
    pub app_build: String,
    pub device_type: String,
    pub device_model: String,
    pub screen_width: i64,
    pub screen_height: i64,
    pub screen_resolution: String,
    pub device_id: String,
}

fn header_parts<'a>(headers: &'a HeaderMap, name: &str) -> Vec<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').map(str::trim).collect())
        .unwrap_or_default()
}

fn part(parts: &[&str], i: usize) -> String {
    parts.get(i).map(|s| s.to_string()).unwrap_or_default()
}

impl EnrichmentHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let os = header_parts(headers, OS_HEADER);
        let version = header_parts(headers, VERSION_HEADER);
        let device = header_parts(headers, DEVICE_HEADER);
        let dimension = |i: usize| device.get(i).and_then(|s| s.parse().ok()).unwrap_or(0);

        Self {
            platform: part(&os, 0),
            platform_version: part(&os, 1),
            app_type: part(&version, 0),
            app_env: part(&version, 1),
            app_version: part(&version, 2),
            app_build: part(&version, 3),
            device_type: part(&device, 0),
            device_model: part(&device, 1),
            screen_width: dimension(2),
            screen_height: dimension(3),
            screen_resolution: part(&device, 4),
            device_id: headers
                .get(DEVICE_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        }
    }

    fn apply(&self, ev: &mut ClientEvent) {
        ev.platform.clone_from(&self.platform);
        ev.platform_version.clone_from(&self.platform_version);
        ev.app_type.clone_from(&self.app_type);
        ev.app_env.clone_from(&self.app_env);
        ev.app_version.clone_from(&self.app_version);
        ev.app_build.clone_from(&self.app_build);
        ev.device_type.clone_from(&self.device_type);
        ev.device_model.clone_from(&self.device_model);
        ev.screen_width = self.screen_width;
        ev.screen_height = self.screen_height;
        ev.screen_resolution.clone_from(&self.screen_resolution);
        ev.device_id.clone_from(&self.device_id);
    }
}

fn take_string(props: &mut Map<String, Value>, key: &str) -> String {
    match props.remove(key) {
        Some(Value::String(s)) => s,
        Some(v @ (Value::Number(_) | Value::Bool(_))) => v.to_string(),
        _ => String::new(),
    }
}

fn take_id(props: &mut Map<String, Value>, key: &str) -> i64 {
    match props.remove(key) {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

fn take_f64(props: &mut Map<String, Value>, key: &str) -> Option<f64> {
    match props.remove(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_millis() as f64 / 1000.0
}

pub struct IntakeHandler {
    sink: Arc<dyn Sink>,
    config: IntakeConfig,
    received: Arc<Counter>,
    dropped: Arc<Counter>,
}

impl IntakeHandler {
    pub fn new(sink: Arc<dyn Sink>, config: IntakeConfig, registry: &Registry) -> Self {
        let registry = registry.scope(METRICS_SCOPE);
        Self {
            sink,
            config,
            received: registry.counter("events/received"),
            dropped: registry.counter("events/dropped"),
        }
    }

    /// Turns a decoded request into the events to forward, counting every
    /// received and dropped event.
    pub fn process(
        &self,
        request: IntakeRequest,
        headers: &EnrichmentHeaders,
        now: DateTime<Utc>,
    ) -> Vec<Event> {
        self.received.inc(request.events.len() as u64);

        let now_secs = epoch_secs(now);
        let skew = if request.current_time > 0.0 {
            now_secs - request.current_time
        } else {
            0.0
        };
        let oldest = now_secs - self.config.invalid_time_threshold.as_secs_f64();

        let mut events = Vec::with_capacity(request.events.len());
        for record in request.events {
            match self.build_event(record, headers, skew, oldest) {
                Some(ev) => events.push(Event::Client(ev)),
                None => self.dropped.inc(1),
            }
        }
        events
    }

    fn build_event(
        &self,
        record: IntakeRecord,
        headers: &EnrichmentHeaders,
        skew: f64,
        oldest: f64,
    ) -> Option<ClientEvent> {
        if record.event.is_empty() {
            return None;
        }
        let mut props = record.properties?;
        let name = match mangle_event_name(&record.event) {
            Ok(name) => name,
            Err(e) => {
                debug!("Dropping event {:?}: {}", record.event, e);
                return None;
            }
        };

        let time = take_f64(&mut props, "time").unwrap_or(0.0) + skew;
        if time.is_nan() || time < oldest {
            debug!("Dropping event {} with time {} older than {}", name, time, oldest);
            return None;
        }
        let time = Timestamp::from_secs_f64(time)?;

        let mut ev = ClientEvent::new(name, time);
        ev.error = take_string(&mut props, "error");
        ev.session_id = take_string(&mut props, "session_id");
        ev.account_id = take_id(&mut props, "account_id");
        ev.patient_id = take_id(&mut props, "patient_id");
        ev.doctor_id = take_id(&mut props, "doctor_id");
        ev.case_id = take_id(&mut props, "case_id");
        ev.visit_id = take_id(&mut props, "visit_id");
        ev.screen_id = take_string(&mut props, "screen_id");
        ev.question_id = take_string(&mut props, "question_id");
        ev.time_spent = take_f64(&mut props, "time_spent");
        headers.apply(&mut ev);

        let extra: BTreeMap<&String, &Value> = props
            .iter()
            .filter(|(_, v)| matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)))
            .collect();
        if !extra.is_empty() {
            ev.extra_json = serde_json::to_string(&extra).unwrap_or_default();
        }
        Some(ev)
    }

    pub async fn handle<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: hyper::body::Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.method() != Method::POST {
            return log_and_create_http_response(
                &format!("Method {} not allowed on {}", req.method(), ANALYTICS_PATH),
                StatusCode::NOT_FOUND,
            );
        }
        if let Some(response) = verify_request_content_length(
            req.headers(),
            self.config.max_request_bytes,
            "Error processing analytics events",
        ) {
            return response;
        }

        let (parts, body) = req.into_parts();
        let body = match Limited::new(body, self.config.max_request_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return log_and_create_http_response(
                    "Error processing analytics events: Payload too large",
                    StatusCode::PAYLOAD_TOO_LARGE,
                );
            }
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Error reading request body: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let request: IntakeRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Unable to decode analytics events: {e}"),
                    StatusCode::BAD_REQUEST,
                );
            }
        };

        let headers = EnrichmentHeaders::from_headers(&parts.headers);
        let received = request.events.len();
        let events = self.process(request, &headers, Utc::now());
        let accepted = events.len();
        if !events.is_empty() {
            self.sink.write_events(events).await;
        }

        log_and_create_http_response(
            &format!("Accepted {accepted} of {received} analytics events"),
            StatusCode::OK,
        )
    }
}
