// SPDX-License-Identifier: GPL-3.0-only
//! Error types for the daemon
//!
//! Distinguished errors that callers (and the D-Bus surface) need to tell
//! apart. Transport-level failures are propagated as `anyhow` chains with
//! context and are classified by the predicates in the `hid` and `hotplug`
//! modules.

use thiserror::Error;

/// Distinguished daemon errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Operation attempted on a display whose handle was already closed.
    #[error("display is closed")]
    DisplayClosed,

    /// No display with the requested serial is currently managed.
    #[error("display with serial {0} not found")]
    DisplayNotFound(String),

    /// A method was called with an empty serial argument.
    #[error("serial cannot be empty")]
    EmptySerial,

    /// Increase/Decrease step outside the accepted 1..=100 range.
    #[error("step must be between 1 and 100")]
    InvalidStep,

    /// Brightness-mutating calls arrived faster than the token bucket allows.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// The hot-plug monitor was started while already running.
    #[error("monitor already started")]
    MonitorAlreadyStarted,
}
