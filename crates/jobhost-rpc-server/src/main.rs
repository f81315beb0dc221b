use clap::Parser;
use futures::Stream;
use jobhost_rpc_core::proto::function_rpc_server::FunctionRpcServer;
use jobhost_rpc_server::server::{
    channel::StreamRegistry,
    codec::{Codec, HostValue},
    config::{CliArgs, HostConfig, SmokeInvocation},
    dispatcher::{FunctionDispatcher, HostEndpoint, ProcessChannelFactory},
    service::handler::FunctionRpcService,
    telemetry::{TelemetryProviders, init_telemetry},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Connected;
use tonic::{codec::CompressionEncoding, transport::Server};
use tonic_health::server::HealthReporter;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = HostConfig::try_from(args)?;

    let providers = init_telemetry()?;

    let tcp = TcpListener::bind(&config.listen_addr).await?;
    let local_addr = tcp.local_addr()?;
    let incoming = TcpListenerStream::new(tcp);
    log_startup_info(&local_addr, &config);
    run_server_with_incoming(providers, incoming, local_addr, config).await
}

async fn run_server_with_incoming<I, IO, IE>(
    providers: TelemetryProviders,
    incoming: I,
    local_addr: SocketAddr,
    config: HostConfig,
) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<FunctionRpcServer<FunctionRpcService>>()
        .await;

    let registry = StreamRegistry::new();
    let endpoint = HostEndpoint {
        host: dial_host(&local_addr),
        port: local_addr.port(),
        max_message_length: config.max_message_length,
    };
    let factory = ProcessChannelFactory::new(
        registry.clone(),
        config.workers.iter().map(|worker| worker.description.clone()),
        endpoint,
        Arc::new(Codec::new()),
        config.channel_options(),
    );

    // Cancelled by the dispatcher when workers cannot be kept alive.
    let lifetime = CancellationToken::new();
    let dispatcher = FunctionDispatcher::new(
        config.dispatcher_options(),
        Arc::new(factory),
        Arc::new(lifetime.clone()),
    );

    let service = FunctionRpcService::new(
        registry,
        config.stream_buffer_size,
        config.process_start_timeout,
    );

    dispatcher.initialize(config.functions.clone());
    if let Some(smoke) = config.smoke.clone() {
        tokio::spawn(run_smoke_invocation(dispatcher.clone(), smoke));
    }

    Server::builder()
        .http2_adaptive_window(Some(true))
        .add_service(health_service)
        .add_service(build_rpc_service(service, config.max_message_length))
        .serve_with_incoming_shutdown(
            incoming,
            shutdown_signal(dispatcher, lifetime, health_reporter, providers),
        )
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!("Host shut down successfully");
    Ok(())
}

/// Address workers should dial. A wildcard bind is reachable on loopback.
fn dial_host(addr: &SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        "127.0.0.1".to_owned()
    } else {
        addr.ip().to_string()
    }
}

fn log_startup_info(_addr: &SocketAddr, _config: &HostConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting job host on {} with full config: {:#?}",
            _addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting job host on {} for {} workers with {} functions",
            _addr,
            _config.worker_runtime,
            _config.functions.len()
        );
    }
}

fn build_rpc_service(
    service: FunctionRpcService,
    max_message_length: usize,
) -> FunctionRpcServer<FunctionRpcService> {
    FunctionRpcServer::new(service)
        .max_decoding_message_size(max_message_length)
        .max_encoding_message_size(max_message_length)
        .send_compressed(CompressionEncoding::Zstd)
        .send_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Deflate)
        .accept_compressed(CompressionEncoding::Zstd)
        .accept_compressed(CompressionEncoding::Gzip)
        .accept_compressed(CompressionEncoding::Deflate)
}

async fn run_smoke_invocation(dispatcher: FunctionDispatcher, smoke: SmokeInvocation) {
    let inputs = smoke
        .inputs
        .into_iter()
        .map(|(name, value)| (name, HostValue::String(value)))
        .collect();

    match dispatcher.invoke_function(&smoke.function, inputs).await {
        Ok(output) => {
            let outputs: serde_json::Map<_, _> = output
                .outputs
                .iter()
                .map(|(name, value)| (name.clone(), value.to_json_value()))
                .collect();
            let rendered = serde_json::json!({
                "function": smoke.function,
                "returnValue": output.return_value.as_ref().map(HostValue::to_json_value),
                "outputs": outputs,
            });
            println!("{rendered}");
        }
        Err(_e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(function = %smoke.function, "Invocation failed: {}", _e);
        }
    }
}

async fn shutdown_signal(
    dispatcher: FunctionDispatcher,
    lifetime: CancellationToken,
    health_reporter: HealthReporter,
    providers: TelemetryProviders,
) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Failed to install SIGTERM handler: {}", _e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::warn!("Failed to install Ctrl+C handler: {}", _e);
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
        () = lifetime.cancelled() => {
            #[cfg(feature = "tracing")]
            tracing::error!("Workers could not be kept running, stopping the host");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");

    // 1. Publish the status
    health_reporter
        .set_not_serving::<FunctionRpcServer<FunctionRpcService>>()
        .await;

    // 2. Drain invocations and stop every worker
    dispatcher.shutdown().await;

    #[cfg(feature = "tracing")]
    {
        if let Err(err) = providers.tracer_provider.force_flush() {
            eprintln!("Error flushing traces: {:#?}", err);
        }
        if let Err(err) = providers.tracer_provider.shutdown() {
            eprintln!("Error shutting down tracer: {:#?}", err);
        }
    }

    #[cfg(feature = "metrics")]
    {
        if let Err(err) = providers.meter_provider.force_flush() {
            eprintln!("Error flushing metrics: {:#?}", err);
        }
        if let Err(err) = providers.meter_provider.shutdown() {
            eprintln!("Error shutting down meter: {:#?}", err);
        }
    }

    #[cfg(not(any(feature = "tracing", feature = "metrics")))]
    let _ = providers;
}
