//! Host side of the out-of-process worker protocol.
//!
//! ## Structure
//!
//! - [`config`]: CLI/env configuration, worker descriptions and the function
//!   manifest.
//! - [`process`]: launching and supervising worker OS processes.
//! - [`service`]: the `FunctionRpc` gRPC endpoint workers dial back to.
//! - [`channel`]: one correlated, capability-aware connection per worker.
//! - [`codec`]: host values to and from the wire `TypedData` form.
//! - [`pool`]: the live channels of a dispatcher.
//! - [`dispatcher`]: worker lifecycle, restart policy and invocation routing.
//! - [`telemetry`]: tracing and metrics setup.

pub mod capabilities;
pub mod channel;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod metadata;
pub mod pool;
pub mod process;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
