// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unbounded free-list of reusable values.
//!
//! `get` never comes back empty handed: when the free-list is drained a fresh
//! `T::default()` is allocated. Values are handed back with `put`, after which
//! the caller must not hold any reference into them.

use crossbeam_queue::SegQueue;

pub struct Pool<T> {
    free: SegQueue<T>,
}

impl<T: Default> Pool<T> {
    pub fn new() -> Self {
        Self {
            free: SegQueue::new(),
        }
    }

    #[inline]
    pub fn get(&self) -> T {
        self.free.pop().unwrap_or_default()
    }

    #[inline]
    pub fn put(&self, value: T) {
        self.free.push(value);
    }

    /// Number of values currently parked in the free-list.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl<T: Default> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}
