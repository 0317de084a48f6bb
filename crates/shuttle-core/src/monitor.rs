//! Monitorable properties exposed by long-lived layer instances.
//!
//! Every layer publishes its counters as `Arc<dyn MonitorableProperty>`.
//! The layer keeps its own `Arc` to update them; the facade collects the
//! same `Arc`s to answer snapshot and steering requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::MonitorError;

pub const PARALLELIZE_QUEUE_SIZE: &str = "dispatch:parallelize:queuesize";
pub const PARALLELIZE_SENT_JOBS: &str = "dispatch:parallelize:sentjobs";
pub const PARALLELIZE_COMPLETED_JOBS: &str = "dispatch:parallelize:completedjobs";
pub const PARALLELIZE_FAILED_JOBS: &str = "dispatch:parallelize:failedjobs";
pub const PARALLELIZE_MAX_JOBS: &str = "dispatch:parallelize:maxjobs";
pub const RETRY_TOTAL_RETRIES: &str = "dispatch:retry:totalretries";
pub const FAILOVER_TOTAL_FAILOVERS: &str = "dispatch:failover:totalfailovers";
pub const ERRORBOUNCE_TOTAL_TRANSLATED: &str = "dispatch:errorbounce:totalTranslated";
pub const ERRORBOUNCE_TOTAL_REFLECTED: &str = "dispatch:errorbounce:totalReflected";
pub const INVOKE_RUNNING: &str = "dispatch:invoke:running";
pub const INVOKE_TOTAL_INVOCATIONS: &str = "dispatch:invoke:totalinvocations";

/// A named numeric property. Steerable ones accept external writes.
pub trait MonitorableProperty: Send + Sync {
    fn name(&self) -> &str;

    fn value(&self) -> u64;

    fn is_steerable(&self) -> bool {
        false
    }

    fn set(&self, value: u64) -> Result<(), MonitorError> {
        let _ = value;
        Err(MonitorError::NotSteerable(self.name().to_string()))
    }
}

/// Read-only counter.
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            value: AtomicU64::new(0),
        })
    }

    pub fn incr(&self) {
        self.value.fetch_add(1, Ordering::SeqCst);
    }

    /// Saturates at zero.
    pub fn decr(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    /// Overwrite with a gauge reading taken under the owner's lock.
    pub fn store(&self, value: usize) {
        self.value.store(value as u64, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl MonitorableProperty for Counter {
    fn name(&self) -> &str {
        self.name
    }

    fn value(&self) -> u64 {
        self.get()
    }
}

/// Writable setting with a lower bound, e.g. a concurrency cap.
#[derive(Debug)]
pub struct Steerable {
    name: &'static str,
    value: AtomicU64,
    min: u64,
}

impl Steerable {
    pub fn new(name: &'static str, initial: u64, min: u64) -> Arc<Self> {
        Arc::new(Self {
            name,
            value: AtomicU64::new(initial.max(min)),
            min,
        })
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

impl MonitorableProperty for Steerable {
    fn name(&self) -> &str {
        self.name
    }

    fn value(&self) -> u64 {
        self.get()
    }

    fn is_steerable(&self) -> bool {
        true
    }

    fn set(&self, value: u64) -> Result<(), MonitorError> {
        if value < self.min {
            return Err(MonitorError::InvalidValue {
                property: self.name.to_string(),
                value,
            });
        }
        self.value.store(value, Ordering::SeqCst);
        Ok(())
    }
}

/// Point-in-time reading of one property of one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub processor: String,
    pub name: String,
    pub value: u64,
    pub steerable: bool,
}

impl PropertySnapshot {
    pub fn read(processor: &str, property: &dyn MonitorableProperty) -> Self {
        Self {
            processor: processor.to_string(),
            name: property.name().to_string(),
            value: property.value(),
            steerable: property.is_steerable(),
        }
    }
}
