//! The unit-of-work capability executed inside worker processes.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A unit of work that can be shipped to a worker subprocess and executed there.
///
/// Arguments are captured as fields of the implementing type. The value is serialized
/// on the controller side, sent over the worker's work channel and deserialized inside
/// the subprocess, so everything it carries must survive a JSON round trip.
///
/// Returning an error or panicking marks the executing worker as failed and dead; the
/// failure detail is reported back through the worker's status channel.
///
/// # Example
///
/// ```
/// use procpool::Unit;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Greet {
///     name: String,
/// }
///
/// impl Unit for Greet {
///     fn run(&self) -> anyhow::Result<()> {
///         eprintln!("hello, {}", self.name);
///         Ok(())
///     }
/// }
/// ```
pub trait Unit: Serialize + DeserializeOwned + 'static {
    /// Execute the unit with its bound arguments.
    fn run(&self) -> anyhow::Result<()>;
}
