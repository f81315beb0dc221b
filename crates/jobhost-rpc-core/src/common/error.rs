//! Error types for the worker dispatcher.
//!
//! This module defines the central `Error` enum shared by the host and the
//! worker-facing gRPC service. It implements `From<Error>` for
//! `tonic::Status` so failures surfaced on a stream map to a sensible gRPC
//! status code.
//!
//! ## Error Cases
//! - Transport: `ChannelError`, `ChannelClosed`, `Timeout`,
//!   `RequestCancelled`.
//! - Worker startup: `WorkerStart`, `WorkerInit`, `WorkerExited`.
//! - Codec: `UnknownWireType`.
//! - Invocation: `Invocation`, `FunctionLoad`, `FunctionNotLoaded`.
//! - Dispatcher: `NoWorkerAvailable`, `InvalidRequest`, `ServiceShutdown`.
//!
//! `Error` is `Clone` because function load failures are cached per function
//! and replayed to every invocation of that function.

use core::time::Duration;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the worker dispatcher.
#[derive(Clone, thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// The worker stream went away while a request was outstanding.
    #[error("Worker channel {worker_id} closed")]
    ChannelClosed { worker_id: String },

    /// No correlated response arrived within the deadline.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    /// The request was cancelled on the host side.
    #[error("Request cancelled")]
    RequestCancelled,

    /// The worker process could not be launched.
    #[error("Failed to start worker process: {reason}")]
    WorkerStart { reason: String },

    /// The worker connected but rejected or failed the init handshake.
    #[error("Worker initialization failed: {reason}")]
    WorkerInit { reason: String },

    /// The worker process exited unexpectedly.
    #[error("{executable} exited with code {exit_code} ({exit_code:#X}): {stderr}")]
    WorkerExited {
        executable: String,
        exit_code: i32,
        stderr: String,
    },

    /// The wire value used a discriminant this host cannot decode.
    #[error("Unknown wire data type: {discriminant}")]
    UnknownWireType { discriminant: String },

    /// The worker reported a failure while executing an invocation.
    #[error("Result: Failure\nException: {message}\nStack: {stack_trace}")]
    Invocation {
        message: String,
        stack_trace: String,
        type_name: String,
        is_user_exception: bool,
    },

    /// The worker failed to load a function.
    #[error("Function {function_id} failed to load: {message}")]
    FunctionLoad {
        function_id: String,
        message: String,
    },

    /// The selected worker has no buffer for the requested function.
    #[error("Function {function_id} is not loaded by the language worker: {worker_id}")]
    FunctionNotLoaded {
        function_id: String,
        worker_id: String,
    },

    /// No initialized channel exists for the language.
    #[error("No initialized worker channel for language {language}")]
    NoWorkerAvailable { language: String },

    /// The request was malformed.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The dispatcher is shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    /// Whether this failure came from user code rather than the worker or
    /// the host. User failures leave the worker channel healthy.
    pub const fn is_user_failure(&self) -> bool {
        matches!(
            self,
            Self::Invocation {
                is_user_exception: true,
                ..
            }
        )
    }

    pub fn channel(context: impl Into<String>) -> Self {
        Self::ChannelError {
            context: context.into(),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {}", context))
            }
            Error::ChannelClosed { worker_id } => {
                Status::unavailable(format!("Worker channel {} closed", worker_id))
            }
            e @ Error::Timeout { .. } => Status::deadline_exceeded(e.to_string()),
            Error::RequestCancelled => Status::cancelled("Request was cancelled"),
            e @ (Error::WorkerStart { .. }
            | Error::WorkerInit { .. }
            | Error::WorkerExited { .. }
            | Error::NoWorkerAvailable { .. }) => Status::unavailable(e.to_string()),
            e @ Error::UnknownWireType { .. } => Status::unimplemented(e.to_string()),
            e @ (Error::Invocation { .. } | Error::FunctionLoad { .. }) => {
                Status::aborted(e.to_string())
            }
            e @ Error::FunctionNotLoaded { .. } => Status::not_found(e.to_string()),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
            Error::ServiceShutdown => Status::unavailable("Service is shutting down"),
        }
    }
}

