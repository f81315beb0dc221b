//! # Shared Protocol Constants
//!
//! Names and defaults that the host and workers must agree on. Capability
//! names are the keys a worker returns in its `WorkerInitResponse`; a
//! capability is considered enabled when its value is a non-empty string.
//!
//! ## Timeouts
//!
//! - [`DEFAULT_REQUEST_TIMEOUT`] - generic request/response calls
//! - [`DEFAULT_INVOCATION_TIMEOUT`] - invocation calls
//! - [`DEFAULT_PROCESS_START_TIMEOUT`] - process start until `StartStream`
//! - [`DEFAULT_WORKER_INIT_TIMEOUT`] - `WorkerInitRequest` until its response

use core::time::Duration;

/// Raw body bytes are sent as `bytes` rather than a string.
pub const RAW_HTTP_BODY_BYTES: &str = "RawHttpBodyBytes";

/// Only `body` is populated on HTTP payloads, never `raw_body`.
pub const RPC_HTTP_BODY_ONLY: &str = "RpcHttpBodyOnly";

/// Homogeneous arrays travel as typed collections instead of JSON arrays.
pub const TYPED_DATA_COLLECTION: &str = "TypedDataCollection";

/// Header entries with empty values are omitted from HTTP payloads.
pub const IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS: &str = "IgnoreEmptyValuedRpcHttpHeaders";

/// HTTP maps are sent as nullable wrappers so null and "" stay distinct.
pub const USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP: &str = "UseNullableValueDictionaryForHttp";

/// The worker understands `WorkerTerminate` and exits on its own.
pub const HANDLES_WORKER_TERMINATE_MESSAGE: &str = "HandlesWorkerTerminateMessage";

/// The worker understands `InvocationCancel`.
pub const HANDLES_INVOCATION_CANCEL_MESSAGE: &str = "HandlesInvocationCancelMessage";

/// The worker answers `WorkerStatusRequest`.
pub const WORKER_STATUS: &str = "WorkerStatus";

/// Exit code of a worker that stopped cleanly.
pub const SUCCESS_EXIT_CODE: i32 = 0;

/// Exit code a worker uses to ask the host for a fresh process.
pub const INTENTIONAL_RESTART_EXIT_CODE: i32 = 200;

/// Number of stderr error lines kept for exit diagnostics.
pub const STDERR_TAIL_CAPACITY: usize = 3;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PROCESS_START_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_WORKER_INIT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Errors further apart than this reset the restart error bucket.
pub const WORKER_RESTART_ERROR_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// How long a killed worker process is given to exit.
pub const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Largest gRPC message a worker is told to accept.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = i32::MAX as usize;
