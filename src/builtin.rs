//! Built-in units of work.
//!
//! These are what the `procpool` binary runs in its workers: enough to exercise the
//! pool end to end (idle sleepers, failing units, units with visible side effects).

use crate::unit::Unit;
use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// A unit of work understood by the `procpool` worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Do nothing.
    Noop,
    /// Sleep for a while.
    Sleep { millis: u64 },
    /// Return an error.
    Fail { message: String },
    /// Panic.
    Panic { message: String },
    /// Write `contents` to `path`, then hold the worker for `hold_millis`.
    Write {
        path: PathBuf,
        contents: String,
        #[serde(default)]
        hold_millis: u64,
    },
}

impl Task {
    pub fn sleep(duration: Duration) -> Self {
        Self::Sleep {
            millis: duration.as_millis() as u64,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            message: message.into(),
        }
    }

    pub fn panic(message: impl Into<String>) -> Self {
        Self::Panic {
            message: message.into(),
        }
    }

    pub fn write(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            contents: contents.into(),
            hold_millis: 0,
        }
    }
}

impl Unit for Task {
    fn run(&self) -> anyhow::Result<()> {
        match self {
            Task::Noop => Ok(()),
            Task::Sleep { millis } => {
                std::thread::sleep(Duration::from_millis(*millis));
                Ok(())
            }
            Task::Fail { message } => bail!("{}", message),
            Task::Panic { message } => panic!("{}", message),
            Task::Write {
                path,
                contents,
                hold_millis,
            } => {
                std::fs::write(path, contents)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                std::thread::sleep(Duration::from_millis(*hold_millis));
                Ok(())
            }
        }
    }
}
