//! Protocol types, constants and the error type shared by the host and the
//! workers.
//!
//! ## Submodules
//!
//! - [`error`] - Centralized error type used throughout the dispatcher.
//! - [`proto`] - Wire messages and the generated `FunctionRpc` service.
//! - [`types`] - Capability names, exit codes and default timeouts.

pub mod error;
pub mod proto;
pub mod types;

pub use error::{Error, Result};
