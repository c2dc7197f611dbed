// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use analytics::event::{CLIENT_CATEGORY, SERVER_CATEGORY, WEB_REQUEST_CATEGORY};
use analytics::intake::IntakeConfig;
use analytics::shipper::ShipperConfig;
use analytics::spool::FileSpoolConfig;
use analytics::stream::StreamClientConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Parses `category:stream` pairs separated by commas or whitespace. A pair
/// with an empty category sets the default stream.
pub fn parse_stream_map(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        name: "ANALYTICS_STREAMS",
        reason,
    };

    let mut streams = HashMap::new();
    for pair in value.replace(',', " ").split_whitespace() {
        let Some((category, stream)) = pair.split_once(':') else {
            return Err(invalid(format!("expected category:stream, got {pair:?}")));
        };
        if stream.is_empty() {
            return Err(invalid(format!("empty stream name for {category:?}")));
        }
        streams.insert(category.to_string(), stream.to_string());
    }
    if streams.is_empty() {
        return Err(invalid("no streams configured".to_string()));
    }
    Ok(streams)
}

fn default_streams() -> HashMap<String, String> {
    [CLIENT_CATEGORY, SERVER_CATEGORY, WEB_REQUEST_CATEGORY]
        .into_iter()
        .map(|c| (c.to_string(), c.to_string()))
        .collect()
}

fn read_var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    read_var(name)
        .map(|v| {
            v.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_secs(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(parse_var::<u64>(name)?.map(Duration::from_secs))
}

#[derive(Debug)]
pub struct AgentConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub intake: IntakeConfig,
    pub shipper: ShipperConfig,
    /// Set when events go to the hosted stream service.
    pub stream: Option<StreamClientConfig>,
    /// Set when events are spooled to local files instead.
    pub spool: Option<FileSpoolConfig>,
}

impl AgentConfig {
    pub fn from_env() -> Result<AgentConfig, ConfigError> {
        let host = read_var("ANALYTICS_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = parse_var("ANALYTICS_PORT")?.unwrap_or(DEFAULT_PORT);
        let log_level = read_var("ANALYTICS_LOG_LEVEL")
            .map(|v| v.to_lowercase())
            .unwrap_or_else(|| "info".to_string());

        let mut intake = IntakeConfig::default();
        if let Some(threshold) = parse_secs("ANALYTICS_INVALID_TIME_THRESHOLD_SECS")? {
            intake.invalid_time_threshold = threshold;
        }
        if let Some(max) = parse_var("ANALYTICS_MAX_REQUEST_BYTES")? {
            intake.max_request_bytes = max;
        }

        let streams = match read_var("ANALYTICS_STREAMS") {
            Some(value) => parse_stream_map(&value)?,
            None => default_streams(),
        };
        let mut shipper = ShipperConfig::new(streams);
        if let Some(size) = parse_var("ANALYTICS_MAX_BATCH_SIZE")? {
            shipper.max_batch_size = size;
        }
        if let Some(duration) = parse_secs("ANALYTICS_MAX_BATCH_DURATION_SECS")? {
            shipper.max_batch_duration = duration;
        }
        if let Some(buffer) = parse_var("ANALYTICS_EVENT_BUFFER_SIZE")? {
            shipper.event_buffer_size = buffer;
        }
        if let Some(lossy) = parse_var::<bool>("ANALYTICS_LOSSY")? {
            shipper.lossy = lossy;
        }

        let stream = read_var("ANALYTICS_STREAM_URL").map(|url| {
            let mut config = StreamClientConfig::new(url);
            config.api_key = read_var("ANALYTICS_STREAM_API_KEY");
            config
        });

        let spool = match read_var("ANALYTICS_SPOOL_PATH") {
            Some(root) => {
                let mut config = FileSpoolConfig::new(PathBuf::from(root));
                if let Some(max) = parse_var("ANALYTICS_SPOOL_MAX_EVENTS")? {
                    config.max_events_per_file = max;
                }
                if let Some(age) = parse_secs("ANALYTICS_SPOOL_MAX_AGE_SECS")? {
                    config.max_file_age = age;
                }
                Some(config)
            }
            None => None,
        };

        Ok(AgentConfig {
            host,
            port,
            log_level,
            intake,
            shipper,
            stream,
            spool,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
