// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downstream delivery stream abstraction.
//!
//! The hosted stream service is reached through [`BatchSink::put_batch`], which
//! writes an ordered list of records onto a named stream. A call either fails as
//! a whole ([`PutBatchError`]) or returns one [`RecordStatus`] per record, in
//! request order, some of which may report a per-record failure.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use data_encoding::BASE64;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{PutBatchError, SinkError};

/// Hard ceiling on records per `put_batch` call imposed by the stream service.
pub const MAX_BATCH: usize = 500;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One record envelope of a bulk put.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Record {
    /// A single JSON-encoded event followed by a newline.
    pub data: BytesMut,
    pub partition_key: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct RecordStatus {
    #[serde(default)]
    pub sequence_number: String,
    #[serde(default)]
    pub error_code: String,
    #[serde(default)]
    pub error_message: String,
}

impl RecordStatus {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(code: &str, message: &str) -> Self {
        Self {
            sequence_number: String::new(),
            error_code: code.to_string(),
            error_message: message.to_string(),
        }
    }

    /// A record succeeded iff the service reported no error message for it.
    pub fn is_success(&self) -> bool {
        self.error_message.is_empty()
    }
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn put_batch(
        &self,
        stream: &str,
        records: &[Record],
    ) -> Result<Vec<RecordStatus>, PutBatchError>;
}

#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Base URL of the stream service, e.g. `https://streams.example.com`.
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl StreamClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Serialize)]
struct PutRecordsEntry<'a> {
    data: String,
    partition_key: &'a str,
}

#[derive(Serialize)]
struct PutRecordsRequest<'a> {
    records: Vec<PutRecordsEntry<'a>>,
}

#[derive(Deserialize)]
struct PutRecordsResponse {
    #[serde(default)]
    failed_record_count: u64,
    #[serde(default)]
    records: Vec<RecordStatus>,
}

/// [`BatchSink`] speaking JSON over HTTP to the hosted stream service.
///
/// `POST {base_url}/v1/streams/{stream}/records` with the record payloads base64
/// encoded. Any non-2xx answer, transport error or a response whose record list
/// does not line up with the request is a whole-call failure.
pub struct HttpStreamClient {
    client: reqwest::Client,
    base_url: Url,
    config: StreamClientConfig,
}

impl HttpStreamClient {
    pub fn new(config: StreamClientConfig) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| SinkError::Startup(format!("failed to build stream client: {e}")))?;
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            SinkError::Startup(format!("invalid stream URL {}: {e}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SinkError::Startup(format!(
                "invalid stream URL {}: not a base URL",
                config.base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    /// Builds the records URL with `stream` percent-encoded as one path segment.
    fn records_url(&self, stream: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v1", "streams", stream, "records"]);
        }
        url
    }
}

#[async_trait]
impl BatchSink for HttpStreamClient {
    async fn put_batch(
        &self,
        stream: &str,
        records: &[Record],
    ) -> Result<Vec<RecordStatus>, PutBatchError> {
        let body = PutRecordsRequest {
            records: records
                .iter()
                .map(|r| PutRecordsEntry {
                    data: BASE64.encode(&r.data),
                    partition_key: &r.partition_key,
                })
                .collect(),
        };

        let mut request = self.client.post(self.records_url(stream)).json(&body);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PutBatchError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PutBatchError::Status(status, text));
        }

        let parsed: PutRecordsResponse = response
            .json()
            .await
            .map_err(|e| PutBatchError::MalformedResponse(e.to_string()))?;

        if parsed.records.len() != records.len() {
            return Err(PutBatchError::MalformedResponse(format!(
                "expected {} record results, got {}",
                records.len(),
                parsed.records.len()
            )));
        }

        debug!(
            "Put {} records on stream {}, {} failed",
            records.len(),
            stream,
            parsed.failed_record_count
        );
        Ok(parsed.records)
    }
}
