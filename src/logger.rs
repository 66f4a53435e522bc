//! Injected logger handle
//!
//! Components receive a [`Logger`] at construction instead of reaching for
//! a package-level logger. The handle carries the log target, so output from
//! the server, its peers and the rebroadcast task can be filtered separately
//! (e.g. `RUST_LOG=dagnet::peer=debug`).

use std::fmt;
use std::sync::Arc;

/// Default root target
pub const ROOT_TARGET: &str = "dagnet";

/// Per-component log target
#[derive(Clone, PartialEq, Eq)]
pub struct Logger {
    target: Arc<str>,
}

impl Logger {
    pub fn new(target: impl AsRef<str>) -> Self {
        Self {
            target: Arc::from(target.as_ref()),
        }
    }

    /// Logger for a sub-component, e.g. `dagnet` -> `dagnet::peer`
    pub fn child(&self, name: &str) -> Self {
        Self::new(format!("{}::{}", self.target, name))
    }

    /// Target to pass to the `log` macros
    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(ROOT_TARGET)
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Logger({})", self.target)
    }
}
