//! IPC protocol for worker subprocess communication.
//!
//! Messages are JSON-serialized and newline-delimited.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Message from the controller to a worker: one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkRequest<U> {
    /// Dispatch sequence number (the worker's frequency once this unit is accepted).
    pub seq: u64,
    /// The unit to execute.
    pub unit: U,
}

/// Snapshot of a worker's remote state, published by the worker after each transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Status {
    /// Worker is executing a unit.
    #[serde(default)]
    pub busy: bool,
    /// Worker process has stopped (or is about to).
    #[serde(default)]
    pub dead: bool,
    /// A unit raised an uncaught failure.
    #[serde(default)]
    pub failed: bool,
    /// Failure detail captured in the worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backtrace: Option<String>,
}

impl<U: Serialize> WorkRequest<U> {
    /// Create a request for `unit` with sequence number `seq`.
    pub fn new(seq: u64, unit: U) -> Self {
        Self { seq, unit }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

impl<U: DeserializeOwned> WorkRequest<U> {
    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Status {
    /// Worker started executing a unit.
    pub fn busy() -> Self {
        Self {
            busy: true,
            ..Self::default()
        }
    }

    /// Worker finished a unit and is idle again.
    pub fn idle() -> Self {
        Self::default()
    }

    /// A unit failed; the worker is terminating.
    pub fn failure(backtrace: impl Into<String>) -> Self {
        Self {
            busy: false,
            dead: true,
            failed: true,
            backtrace: Some(backtrace.into()),
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("Status serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
