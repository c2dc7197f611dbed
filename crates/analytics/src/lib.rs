// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Analytics event intake and shipping.
//!
//! Client applications POST batches of raw events to the intake endpoint. The
//! [`intake::IntakeHandler`] validates and enriches them and hands the survivors
//! to a [`sink::Sink`]. The main sink is the [`shipper::Shipper`], which groups
//! events by category into per-stream batches and ships them to a hosted
//! delivery stream through a [`stream::BatchSink`]. When no stream is
//! configured, [`spool::FileSpoolSink`] writes events to rotating JSON-lines
//! files instead.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod clock;
pub mod errors;
pub mod event;
pub mod http_utils;
pub mod intake;
pub mod metrics;
pub mod pool;
pub mod server;
pub mod shipper;
pub mod sink;
pub mod spool;
pub mod stream;
