// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Canonical analytics event records.
//!
//! Every event belongs to exactly one category, which selects the downstream
//! stream it is shipped to. Events serialize to flat JSON objects with
//! snake_case field names. Zero-valued optional fields are omitted; the event
//! name (or service for web requests) and the time are always present.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::errors::EventNameError;

pub const CLIENT_CATEGORY: &str = "client";
pub const SERVER_CATEGORY: &str = "server";
pub const WEB_REQUEST_CATEGORY: &str = "webrequest";

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Serializes as the bare variant object; the category is implied by the
/// stream the record lands in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Client(ClientEvent),
    Server(ServerEvent),
    WebRequest(WebRequestEvent),
}

impl Event {
    pub fn category(&self) -> &'static str {
        match self {
            Event::Client(_) => CLIENT_CATEGORY,
            Event::Server(_) => SERVER_CATEGORY,
            Event::WebRequest(_) => WEB_REQUEST_CATEGORY,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            Event::Client(ev) => ev.time,
            Event::Server(ev) => ev.time,
            Event::WebRequest(ev) => ev.time,
        }
    }
}

impl From<ClientEvent> for Event {
    fn from(ev: ClientEvent) -> Self {
        Event::Client(ev)
    }
}

impl From<ServerEvent> for Event {
    fn from(ev: ServerEvent) -> Self {
        Event::Server(ev)
    }
}

impl From<WebRequestEvent> for Event {
    fn from(ev: WebRequestEvent) -> Self {
        Event::WebRequest(ev)
    }
}

/// An event reported by a client application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    pub event: String,
    pub time: Timestamp,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub account_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub patient_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub doctor_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub case_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub visit_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub screen_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub question_id: String,
    /// Seconds spent, as reported by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<f64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_env: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_build: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub platform_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_model: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub screen_width: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub screen_height: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub screen_resolution: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra_json: String,
}

impl ClientEvent {
    pub fn new(event: impl Into<String>, time: Timestamp) -> Self {
        Self {
            event: event.into(),
            time,
            error: String::new(),
            session_id: String::new(),
            device_id: String::new(),
            account_id: 0,
            patient_id: 0,
            doctor_id: 0,
            case_id: 0,
            visit_id: 0,
            screen_id: String::new(),
            question_id: String::new(),
            time_spent: None,
            app_type: String::new(),
            app_env: String::new(),
            app_version: String::new(),
            app_build: String::new(),
            platform: String::new(),
            platform_version: String::new(),
            device_type: String::new(),
            device_model: String::new(),
            screen_width: 0,
            screen_height: 0,
            screen_resolution: String::new(),
            extra_json: String::new(),
        }
    }
}

/// An event emitted by backend code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub event: String,
    pub time: Timestamp,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub account_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub patient_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub doctor_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub visit_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub case_id: i64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub treatment_plan_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extra_json: String,
}

impl ServerEvent {
    pub fn new(event: impl Into<String>, time: Timestamp) -> Self {
        Self {
            event: event.into(),
            time,
            account_id: 0,
            patient_id: 0,
            doctor_id: 0,
            visit_id: 0,
            case_id: 0,
            treatment_plan_id: 0,
            role: String::new(),
            extra_json: String::new(),
        }
    }
}

/// One served HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebRequestEvent {
    pub service: String,
    pub path: String,
    pub time: Timestamp,
    pub request_id: u64,
    pub status_code: u16,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub referrer: String,
    /// Microseconds.
    pub response_time: i64,
    pub server: String,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub account_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

/// Returns true if `name` is non-empty and matches `^[A-Za-z0-9_\-\.]+$`.
pub fn is_valid_event_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

/// Rewrites `name` into the valid event name alphabet by replacing every run of
/// disallowed characters with a single `-`.
///
/// Fails if `name` contains no allowed character at all.
pub fn mangle_event_name(name: &str) -> Result<String, EventNameError> {
    if is_valid_event_name(name) {
        return Ok(name.to_string());
    }
    if !name.chars().any(is_name_char) {
        return Err(EventNameError::NoValidCharacters);
    }

    let mut mangled = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if is_name_char(c) {
            mangled.push(c);
            in_run = false;
        } else if !in_run {
            mangled.push('-');
            in_run = true;
        }
    }
    Ok(mangled)
}
