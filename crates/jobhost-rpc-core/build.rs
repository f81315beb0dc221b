/// Generates the gRPC client and server stubs for the `FunctionRpc` service
/// using `tonic-build`'s manual service builder.
///
/// The message types are declared directly with `prost` derives in
/// `src/common/proto.rs`, so no `.proto` file or `protoc` toolchain is needed.
/// Only the service plumbing is generated here.
///
/// # Service
///
/// ```text
/// package jobhost.rpc;
///
/// service FunctionRpc {
///     rpc EventStream(stream StreamingMessage) returns (stream StreamingMessage);
/// }
/// ```
///
/// # Output
///
/// The generated code lands in `$OUT_DIR/jobhost.rpc.FunctionRpc.rs` and is
/// pulled in by the `proto` module, where `super::StreamingMessage` resolves:
///
/// ```rust,ignore
/// include!(concat!(env!("OUT_DIR"), "/jobhost.rpc.FunctionRpc.rs"));
/// ```
fn main() {
    let event_stream = tonic_build::manual::Method::builder()
        .name("event_stream")
        .route_name("EventStream")
        .input_type("super::StreamingMessage")
        .output_type("super::StreamingMessage")
        .codec_path("tonic_prost::ProstCodec")
        .client_streaming()
        .server_streaming()
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("FunctionRpc")
        .package("jobhost.rpc")
        .method(event_stream)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);

    println!("cargo:rerun-if-changed=build.rs");
}
