//! Protobuf messages for the `jobhost.rpc` worker protocol.
//!
//! Every message exchanged between the host and a language worker travels in
//! a [`StreamingMessage`] envelope over the bidirectional `FunctionRpc/
//! EventStream` call. The envelope's `request_id` is the correlation id: a
//! request stamped with id `X` is answered by a response carrying `X`.
//!
//! The types mirror what `prost-build` would emit for the protocol and are
//! wire compatible with it. The service stubs (`function_rpc_client`,
//! `function_rpc_server`) are generated by the build script.

use prost::bytes::Bytes;
use std::collections::HashMap;

include!(concat!(env!("OUT_DIR"), "/jobhost.rpc.FunctionRpc.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamingMessage {
    /// Correlation id. Echoed by the worker on the response to a request.
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(
        oneof = "streaming_message::Content",
        tags = "2, 4, 5, 8, 9, 12, 13, 14, 16, 17, 20, 21"
    )]
    pub content: Option<streaming_message::Content>,
}

pub mod streaming_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Content {
        #[prost(message, tag = "20")]
        StartStream(super::StartStream),
        #[prost(message, tag = "17")]
        WorkerInitRequest(super::WorkerInitRequest),
        #[prost(message, tag = "16")]
        WorkerInitResponse(super::WorkerInitResponse),
        #[prost(message, tag = "14")]
        WorkerTerminate(super::WorkerTerminate),
        #[prost(message, tag = "12")]
        WorkerStatusRequest(super::WorkerStatusRequest),
        #[prost(message, tag = "13")]
        WorkerStatusResponse(super::WorkerStatusResponse),
        #[prost(message, tag = "8")]
        FunctionLoadRequest(super::FunctionLoadRequest),
        #[prost(message, tag = "9")]
        FunctionLoadResponse(super::FunctionLoadResponse),
        #[prost(message, tag = "4")]
        InvocationRequest(super::InvocationRequest),
        #[prost(message, tag = "5")]
        InvocationResponse(super::InvocationResponse),
        #[prost(message, tag = "21")]
        InvocationCancel(super::InvocationCancel),
        #[prost(message, tag = "2")]
        RpcLog(super::RpcLog),
    }

    impl Content {
        /// Short, stable name of the message kind, used in logs and errors.
        pub const fn kind(&self) -> &'static str {
            match self {
                Self::StartStream(_) => "StartStream",
                Self::WorkerInitRequest(_) => "WorkerInitRequest",
                Self::WorkerInitResponse(_) => "WorkerInitResponse",
                Self::WorkerTerminate(_) => "WorkerTerminate",
                Self::WorkerStatusRequest(_) => "WorkerStatusRequest",
                Self::WorkerStatusResponse(_) => "WorkerStatusResponse",
                Self::FunctionLoadRequest(_) => "FunctionLoadRequest",
                Self::FunctionLoadResponse(_) => "FunctionLoadResponse",
                Self::InvocationRequest(_) => "InvocationRequest",
                Self::InvocationResponse(_) => "InvocationResponse",
                Self::InvocationCancel(_) => "InvocationCancel",
                Self::RpcLog(_) => "RpcLog",
            }
        }
    }
}

impl StreamingMessage {
    pub fn new(content: streaming_message::Content) -> Self {
        Self {
            request_id: String::new(),
            content: Some(content),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn kind(&self) -> &'static str {
        self.content
            .as_ref()
            .map_or("Empty", streaming_message::Content::kind)
    }
}

/// First message a worker sends once its stream is open.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartStream {
    #[prost(string, tag = "2")]
    pub worker_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerInitRequest {
    #[prost(string, tag = "1")]
    pub host_version: String,
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(string, tag = "4")]
    pub worker_directory: String,
    #[prost(string, tag = "5")]
    pub function_app_directory: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerInitResponse {
    #[prost(string, tag = "1")]
    pub worker_version: String,
    #[prost(map = "string, string", tag = "2")]
    pub capabilities: HashMap<String, String>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResult {
    #[prost(enumeration = "status_result::Status", tag = "4")]
    pub status: i32,
    #[prost(string, tag = "1")]
    pub result: String,
    #[prost(message, optional, tag = "2")]
    pub exception: Option<RpcException>,
    #[prost(message, repeated, tag = "3")]
    pub logs: Vec<RpcLog>,
}

pub mod status_result {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Status {
        Failure = 0,
        Success = 1,
        Cancelled = 2,
    }
}

impl StatusResult {
    pub fn success() -> Self {
        Self {
            status: status_result::Status::Success as i32,
            ..Default::default()
        }
    }

    pub fn failure(exception: RpcException) -> Self {
        Self {
            status: status_result::Status::Failure as i32,
            exception: Some(exception),
            ..Default::default()
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcException {
    #[prost(string, tag = "3")]
    pub source: String,
    #[prost(string, tag = "1")]
    pub stack_trace: String,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(bool, tag = "4")]
    pub is_user_exception: bool,
    #[prost(string, tag = "5")]
    pub r#type: String,
}

/// Asks the worker to exit, giving it `grace_period` to finish up.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerTerminate {
    #[prost(message, optional, tag = "1")]
    pub grace_period: Option<::prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerStatusRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WorkerStatusResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionLoadRequest {
    #[prost(string, tag = "1")]
    pub function_id: String,
    #[prost(message, optional, tag = "2")]
    pub metadata: Option<RpcFunctionMetadata>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionLoadResponse {
    #[prost(string, tag = "1")]
    pub function_id: String,
    #[prost(message, optional, tag = "2")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcFunctionMetadata {
    #[prost(string, tag = "4")]
    pub name: String,
    #[prost(string, tag = "1")]
    pub directory: String,
    #[prost(string, tag = "2")]
    pub script_file: String,
    #[prost(string, tag = "3")]
    pub entry_point: String,
    #[prost(map = "string, message", tag = "6")]
    pub bindings: HashMap<String, BindingInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BindingInfo {
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(enumeration = "binding_info::Direction", tag = "3")]
    pub direction: i32,
    #[prost(enumeration = "binding_info::DataType", tag = "4")]
    pub data_type: i32,
}

pub mod binding_info {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Direction {
        In = 0,
        Out = 1,
        Inout = 2,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum DataType {
        Undefined = 0,
        String = 1,
        Binary = 2,
        Stream = 3,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationRequest {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(string, tag = "2")]
    pub function_id: String,
    #[prost(message, repeated, tag = "3")]
    pub input_data: Vec<ParameterBinding>,
    #[prost(map = "string, message", tag = "4")]
    pub trigger_metadata: HashMap<String, TypedData>,
}

/// Host-side cancellation notice. Advisory only: the worker may keep running.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationCancel {
    #[prost(string, tag = "2")]
    pub invocation_id: String,
    #[prost(message, optional, tag = "1")]
    pub grace_period: Option<::prost_types::Duration>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationResponse {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(message, repeated, tag = "2")]
    pub output_data: Vec<ParameterBinding>,
    #[prost(message, optional, tag = "4")]
    pub return_value: Option<TypedData>,
    #[prost(message, optional, tag = "3")]
    pub result: Option<StatusResult>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterBinding {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub data: Option<TypedData>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TypedData {
    #[prost(
        oneof = "typed_data::Data",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12"
    )]
    pub data: Option<typed_data::Data>,
}

pub mod typed_data {
    use prost::bytes::Bytes;

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(string, tag = "1")]
        String(String),
        #[prost(string, tag = "2")]
        Json(String),
        #[prost(bytes = "bytes", tag = "3")]
        Bytes(Bytes),
        #[prost(bytes = "bytes", tag = "4")]
        Stream(Bytes),
        #[prost(message, tag = "5")]
        Http(Box<super::RpcHttp>),
        #[prost(sint64, tag = "6")]
        Int(i64),
        #[prost(double, tag = "7")]
        Double(f64),
        #[prost(message, tag = "8")]
        CollectionBytes(super::CollectionBytes),
        #[prost(message, tag = "9")]
        CollectionString(super::CollectionString),
        #[prost(message, tag = "10")]
        CollectionDouble(super::CollectionDouble),
        #[prost(message, tag = "11")]
        CollectionSint64(super::CollectionSInt64),
        #[prost(message, tag = "12")]
        ModelBindingData(super::ModelBindingData),
    }

    impl Data {
        /// Name of the discriminant, as it appears in the protocol.
        pub const fn kind(&self) -> &'static str {
            match self {
                Self::String(_) => "string",
                Self::Json(_) => "json",
                Self::Bytes(_) => "bytes",
                Self::Stream(_) => "stream",
                Self::Http(_) => "http",
                Self::Int(_) => "int",
                Self::Double(_) => "double",
                Self::CollectionBytes(_) => "collection_bytes",
                Self::CollectionString(_) => "collection_string",
                Self::CollectionDouble(_) => "collection_double",
                Self::CollectionSint64(_) => "collection_sint64",
                Self::ModelBindingData(_) => "model_binding_data",
            }
        }
    }
}

impl TypedData {
    pub fn new(data: typed_data::Data) -> Self {
        Self { data: Some(data) }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectionBytes {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub bytes: Vec<Bytes>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectionString {
    #[prost(string, repeated, tag = "1")]
    pub string: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectionDouble {
    #[prost(double, repeated, tag = "1")]
    pub double: Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CollectionSInt64 {
    #[prost(sint64, repeated, tag = "1")]
    pub sint64: Vec<i64>,
}

/// Reference to data owned by an SDK-bound extension. Workers may send it;
/// the host cannot decode it into a plain value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ModelBindingData {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub source: String,
    #[prost(string, tag = "3")]
    pub content_type: String,
    #[prost(bytes = "bytes", tag = "4")]
    pub content: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcHttp {
    #[prost(string, tag = "1")]
    pub method: String,
    #[prost(string, tag = "2")]
    pub url: String,
    #[prost(map = "string, string", tag = "3")]
    pub headers: HashMap<String, String>,
    #[prost(message, optional, tag = "4")]
    pub body: Option<TypedData>,
    #[prost(map = "string, string", tag = "10")]
    pub params: HashMap<String, String>,
    #[prost(string, tag = "12")]
    pub status_code: String,
    #[prost(map = "string, string", tag = "15")]
    pub query: HashMap<String, String>,
    #[prost(bool, tag = "16")]
    pub is_raw: bool,
    #[prost(message, optional, tag = "17")]
    pub raw_body: Option<TypedData>,
    #[prost(message, repeated, tag = "18")]
    pub identities: Vec<RpcClaimsIdentity>,
    #[prost(map = "string, message", tag = "20")]
    pub nullable_headers: HashMap<String, NullableString>,
    #[prost(map = "string, message", tag = "21")]
    pub nullable_params: HashMap<String, NullableString>,
    #[prost(map = "string, message", tag = "22")]
    pub nullable_query: HashMap<String, NullableString>,
}

/// A string that can be explicitly null on the wire.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NullableString {
    #[prost(string, optional, tag = "1")]
    pub value: Option<String>,
}

impl NullableString {
    pub fn some(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcClaimsIdentity {
    #[prost(message, optional, tag = "1")]
    pub authentication_type: Option<NullableString>,
    #[prost(message, optional, tag = "2")]
    pub name_claim_type: Option<NullableString>,
    #[prost(message, optional, tag = "3")]
    pub role_claim_type: Option<NullableString>,
    #[prost(message, repeated, tag = "4")]
    pub claims: Vec<RpcClaim>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcClaim {
    #[prost(string, tag = "1")]
    pub value: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcLog {
    #[prost(string, tag = "1")]
    pub invocation_id: String,
    #[prost(string, tag = "2")]
    pub category: String,
    #[prost(enumeration = "rpc_log::Level", tag = "3")]
    pub level: i32,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(string, tag = "5")]
    pub event_id: String,
    #[prost(message, optional, tag = "6")]
    pub exception: Option<RpcException>,
    #[prost(enumeration = "rpc_log::RpcLogCategory", tag = "8")]
    pub log_category: i32,
}

pub mod rpc_log {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Level {
        Trace = 0,
        Debug = 1,
        Information = 2,
        Warning = 3,
        Error = 4,
        Critical = 5,
        None = 6,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum RpcLogCategory {
        User = 0,
        System = 1,
    }
}
