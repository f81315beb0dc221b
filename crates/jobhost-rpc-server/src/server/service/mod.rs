//! gRPC service implementation.
//!
//! ## Structure
//!
//! - [`handler`] - `FunctionRpc` entry point that pairs worker streams with
//!   the channels that launched them.

pub mod handler;
