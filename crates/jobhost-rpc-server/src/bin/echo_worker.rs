//! Minimal language worker used by the end-to-end tests and for trying the
//! host out locally.
//!
//! It dials the host with the connection arguments the host passes on the
//! command line, opens the `EventStream`, and answers every request:
//! functions load unless their id is `broken`, and invocations echo their
//! inputs back as outputs with the first input as the return value. A few
//! input names change the behavior:
//!
//! - `log`: written back as a user log line before the response.
//! - `fail`: the invocation fails with the value as the error message.
//! - `sleepMs`: the response is delayed by that many milliseconds.
//! - `exit`: the process exits with the value as its exit code.

use clap::Parser;
use jobhost_rpc_core::{
    proto::{
        FunctionLoadResponse, InvocationRequest, InvocationResponse, RpcException, RpcLog,
        StartStream, StatusResult, StreamingMessage, WorkerInitResponse, WorkerStatusResponse,
        function_rpc_client::FunctionRpcClient, rpc_log, streaming_message::Content,
        typed_data::Data,
    },
    types::{
        HANDLES_INVOCATION_CANCEL_MESSAGE, HANDLES_WORKER_TERMINATE_MESSAGE, RAW_HTTP_BODY_BYTES,
        TYPED_DATA_COLLECTION, WORKER_STATUS,
    },
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Request;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "echo-worker", version, about = "Echoing language worker")]
struct WorkerArgs {
    #[arg(long)]
    host: String,
    #[arg(long)]
    port: u16,
    #[arg(long = "workerId")]
    worker_id: String,
    #[arg(long = "requestId")]
    request_id: String,
    #[arg(long = "grpcMaxMessageLength", default_value_t = 4 * 1024 * 1024)]
    max_message_length: usize,
    /// Worker path and worker arguments, unused.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    _rest: Vec<String>,
}

type Outbound = mpsc::Sender<StreamingMessage>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = WorkerArgs::parse();
    let endpoint = format!("http://{}:{}", args.host, args.port);
    let mut client = FunctionRpcClient::connect(endpoint)
        .await?
        .max_decoding_message_size(args.max_message_length)
        .max_encoding_message_size(args.max_message_length);

    let (tx, rx) = mpsc::channel(32);
    tx.send(
        StreamingMessage::new(Content::StartStream(StartStream {
            worker_id: args.worker_id.clone(),
        }))
        .with_request_id(args.request_id.clone()),
    )
    .await?;

    let mut inbound = client
        .event_stream(Request::new(ReceiverStream::new(rx)))
        .await?
        .into_inner();

    #[cfg(feature = "tracing")]
    tracing::info!(worker_id = %args.worker_id, "Echo worker connected");

    while let Some(message) = inbound.message().await? {
        let request_id = message.request_id;
        let Some(content) = message.content else {
            continue;
        };
        match content {
            Content::WorkerInitRequest(_) => {
                let capabilities = [
                    TYPED_DATA_COLLECTION,
                    RAW_HTTP_BODY_BYTES,
                    HANDLES_INVOCATION_CANCEL_MESSAGE,
                    HANDLES_WORKER_TERMINATE_MESSAGE,
                    WORKER_STATUS,
                ]
                .into_iter()
                .map(|name| (name.to_owned(), "true".to_owned()))
                .collect();
                let response = WorkerInitResponse {
                    worker_version: env!("CARGO_PKG_VERSION").to_owned(),
                    capabilities,
                    result: Some(StatusResult::success()),
                };
                reply(&tx, request_id, Content::WorkerInitResponse(response)).await?;
            }
            Content::FunctionLoadRequest(load) => {
                let result = if load.function_id == "broken" {
                    StatusResult::failure(RpcException {
                        message: format!("cannot load {}", load.function_id),
                        ..Default::default()
                    })
                } else {
                    StatusResult::success()
                };
                let response = FunctionLoadResponse {
                    function_id: load.function_id,
                    result: Some(result),
                };
                reply(&tx, request_id, Content::FunctionLoadResponse(response)).await?;
            }
            Content::InvocationRequest(invocation) => {
                tokio::spawn(invoke(tx.clone(), request_id, invocation));
            }
            Content::WorkerStatusRequest(_) => {
                let response = Content::WorkerStatusResponse(WorkerStatusResponse {});
                reply(&tx, request_id, response).await?;
            }
            Content::WorkerTerminate(_) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Terminate requested");
                break;
            }
            Content::InvocationCancel(_cancel) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(invocation_id = %_cancel.invocation_id, "Cancel ignored");
            }
            _ => {}
        }
    }
    Ok(())
}

async fn reply(tx: &Outbound, request_id: String, content: Content) -> anyhow::Result<()> {
    tx.send(StreamingMessage::new(content).with_request_id(request_id))
        .await?;
    Ok(())
}

fn string_input(invocation: &InvocationRequest, name: &str) -> Option<String> {
    invocation
        .input_data
        .iter()
        .find(|binding| binding.name == name)
        .and_then(|binding| binding.data.as_ref())
        .and_then(|typed| match &typed.data {
            Some(Data::String(value) | Data::Json(value)) => Some(value.clone()),
            Some(Data::Int(value)) => Some(value.to_string()),
            _ => None,
        })
}

async fn invoke(tx: Outbound, request_id: String, invocation: InvocationRequest) {
    if let Some(code) = string_input(&invocation, "exit") {
        std::process::exit(code.parse().unwrap_or(1));
    }
    if let Some(delay) = string_input(&invocation, "sleepMs").and_then(|ms| ms.parse().ok()) {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if let Some(line) = string_input(&invocation, "log") {
        let log = RpcLog {
            invocation_id: invocation.invocation_id.clone(),
            category: format!("Function.{}.User", invocation.function_id),
            level: rpc_log::Level::Information as i32,
            message: line,
            log_category: rpc_log::RpcLogCategory::User as i32,
            ..Default::default()
        };
        let _ = tx.send(StreamingMessage::new(Content::RpcLog(log))).await;
    }

    let result = match string_input(&invocation, "fail") {
        Some(message) => StatusResult::failure(RpcException {
            message,
            r#type: "EchoError".to_owned(),
            is_user_exception: true,
            ..Default::default()
        }),
        None => StatusResult::success(),
    };
    let response = InvocationResponse {
        return_value: invocation
            .input_data
            .first()
            .and_then(|binding| binding.data.clone()),
        invocation_id: invocation.invocation_id,
        output_data: invocation.input_data,
        result: Some(result),
    };
    let _ = reply(&tx, request_id, Content::InvocationResponse(response)).await;
}
