// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::StatusCode;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimestampError {
    #[error("bad timestamp: {0:?}")]
    BadTimestamp(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventNameError {
    #[error("event name has no valid characters")]
    NoValidCharacters,
}

/// Errors surfaced by the sink lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("sink already started")]
    AlreadyStarted,

    #[error("sink not started")]
    NotStarted,

    #[error("failed to start sink: {0}")]
    Startup(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Construction-time configuration errors of the shipper.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ShipperError {
    #[error("category to stream map is empty")]
    EmptyStreamMap,

    #[error("stream name for category {0:?} is empty")]
    EmptyStreamName(String),
}

/// Whole-call failure of a batch put. Per-record failures are reported through
/// [`crate::stream::RecordStatus`] instead.
#[derive(Debug, thiserror::Error)]
pub enum PutBatchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("{0}: {1}")]
    Status(StatusCode, String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}
