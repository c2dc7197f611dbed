// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline self-observability.
//!
//! A [`Registry`] hands out named counters, gauges and histograms. Scoped
//! registries share storage with their parent and prefix every name with the
//! scope, so `registry.scope("analytics.event.client").counter("events/dropped")`
//! is reported as `analytics.event.client/events/dropped`. Updates are lock-free
//! for counters and gauges; histograms take a short internal lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use serde::Serialize;

/// Size of the uniform sample kept by each histogram.
pub const HISTOGRAM_RESERVOIR_SIZE: usize = 1028;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    #[inline]
    pub fn inc(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    #[inline]
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct Reservoir {
    count: u64,
    values: Vec<i64>,
}

/// Histogram backed by a uniform (Vitter algorithm R) reservoir sample, so
/// percentiles are unbiased over the whole lifetime of the process.
#[derive(Debug, Default)]
pub struct Histogram {
    reservoir: Mutex<Reservoir>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub min: i64,
    pub max: i64,
    pub mean: f64,
    pub p50: i64,
    pub p90: i64,
    pub p99: i64,
}

impl Histogram {
    fn lock(&self) -> MutexGuard<'_, Reservoir> {
        self.reservoir.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, value: i64) {
        let mut r = self.lock();
        r.count += 1;
        if r.values.len() < HISTOGRAM_RESERVOIR_SIZE {
            r.values.push(value);
        } else {
            let idx = rand::rng().random_range(0..r.count);
            if let Ok(idx) = usize::try_from(idx) {
                if idx < HISTOGRAM_RESERVOIR_SIZE {
                    r.values[idx] = value;
                }
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.lock().count
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let r = self.lock();
        let mut sorted = r.values.clone();
        let count = r.count;
        drop(r);

        sorted.sort_unstable();
        let percentile = |p: f64| -> i64 {
            if sorted.is_empty() {
                return 0;
            }
            let rank = (p * (sorted.len() - 1) as f64).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };
        let mean = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<i64>() as f64 / sorted.len() as f64
        };

        HistogramSnapshot {
            count,
            min: sorted.first().copied().unwrap_or(0),
            max: sorted.last().copied().unwrap_or(0),
            mean,
            p50: percentile(0.5),
            p90: percentile(0.9),
            p99: percentile(0.99),
        }
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricSnapshot {
    Counter(u64),
    Gauge(i64),
    Histogram(HistogramSnapshot),
}

/// Named metric store. Cloning is cheap and clones share storage.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    prefix: String,
    metrics: Arc<Mutex<BTreeMap<String, Metric>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a registry sharing this one's storage whose names are prefixed
    /// with `scope`.
    pub fn scope(&self, scope: &str) -> Registry {
        Registry {
            prefix: self.qualify(scope),
            metrics: self.metrics.clone(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Metric>> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the counter registered under `name`, creating it if needed. A
    /// name already taken by another metric kind is replaced.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut metrics = self.lock();
        let entry = metrics
            .entry(self.qualify(name))
            .or_insert_with(|| Metric::Counter(Arc::default()));
        match entry {
            Metric::Counter(c) => c.clone(),
            other => {
                let c = Arc::new(Counter::default());
                *other = Metric::Counter(c.clone());
                c
            }
        }
    }

    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut metrics = self.lock();
        let entry = metrics
            .entry(self.qualify(name))
            .or_insert_with(|| Metric::Gauge(Arc::default()));
        match entry {
            Metric::Gauge(g) => g.clone(),
            other => {
                let g = Arc::new(Gauge::default());
                *other = Metric::Gauge(g.clone());
                g
            }
        }
    }

    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        let mut metrics = self.lock();
        let entry = metrics
            .entry(self.qualify(name))
            .or_insert_with(|| Metric::Histogram(Arc::default()));
        match entry {
            Metric::Histogram(h) => h.clone(),
            other => {
                let h = Arc::new(Histogram::default());
                *other = Metric::Histogram(h.clone());
                h
            }
        }
    }

    /// Point-in-time values of every metric in the shared store, keyed by fully
    /// qualified name.
    pub fn snapshot(&self) -> BTreeMap<String, MetricSnapshot> {
        self.lock()
            .iter()
            .map(|(name, metric)| {
                let snap = match metric {
                    Metric::Counter(c) => MetricSnapshot::Counter(c.count()),
                    Metric::Gauge(g) => MetricSnapshot::Gauge(g.value()),
                    Metric::Histogram(h) => MetricSnapshot::Histogram(h.snapshot()),
                };
                (name.clone(), snap)
            })
            .collect()
    }
}
