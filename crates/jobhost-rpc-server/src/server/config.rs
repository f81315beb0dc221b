//! Host configuration.
//!
//! [`CliArgs`] is what `clap` parses from flags and the environment.
//! [`HostConfig`] is the validated form: worker configurations and the
//! function manifest are loaded from disk, the runtime is resolved and
//! durations are typed. The dispatcher and channels take their options from
//! [`HostConfig::dispatcher_options`] and [`HostConfig::channel_options`].
//!
//! ```
//! use clap::Parser;
//! use jobhost_rpc_server::server::config::CliArgs;
//!
//! let args = CliArgs::parse_from([
//!     "jobhost",
//!     "--worker-config",
//!     "workers/node/worker.config.json,workers/python/worker.config.json",
//!     "--worker-runtime",
//!     "node",
//! ]);
//! assert_eq!(args.worker_configs.len(), 2);
//! assert_eq!(args.worker_runtime.as_deref(), Some("node"));
//! ```

use crate::server::{
    channel::ChannelOptions,
    dispatcher::DispatcherOptions,
    metadata::FunctionMetadata,
    process::WorkerProcessArguments,
};
use anyhow::{Context, bail};
use clap::Parser;
use core::time::Duration;
use jobhost_rpc_core::types::DEFAULT_MAX_MESSAGE_LENGTH;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const WORKER_DIRECTORY_PLACEHOLDER: &str = "%WorkerDirectoryPath%";

/// Runtime configuration for the `jobhost` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "jobhost",
    version,
    about = "Runs functions on out-of-process language workers over gRPC"
)]
pub struct CliArgs {
    /// Address the worker-facing gRPC server listens on. Port 0 picks a free
    /// port.
    ///
    /// Environment variable: `JOBHOST_LISTEN_ADDR`
    #[arg(long, env = "JOBHOST_LISTEN_ADDR", default_value_t = String::from("127.0.0.1:0"))]
    pub listen_addr: String,

    /// Worker configuration files (`worker.config.json`), one per language.
    ///
    /// Environment variable: `WORKER_CONFIG` (comma separated)
    #[arg(long = "worker-config", env = "WORKER_CONFIG", value_delimiter = ',', required = true)]
    pub worker_configs: Vec<PathBuf>,

    /// Function manifest: a JSON array of function metadata.
    ///
    /// Environment variable: `FUNCTIONS_MANIFEST`
    #[arg(long, env = "FUNCTIONS_MANIFEST")]
    pub functions: Option<PathBuf>,

    /// Language whose workers this host runs. Optional when exactly one
    /// worker configuration is given.
    ///
    /// Environment variable: `FUNCTIONS_WORKER_RUNTIME`
    #[arg(long, env = "FUNCTIONS_WORKER_RUNTIME")]
    pub worker_runtime: Option<String>,

    /// Root directory of the function app, announced to workers.
    ///
    /// Environment variable: `FUNCTION_APP_DIRECTORY`
    #[arg(long, env = "FUNCTION_APP_DIRECTORY", default_value = ".")]
    pub function_app_directory: PathBuf,

    /// Seconds a launched worker has to open its stream.
    #[arg(long, env = "PROCESS_START_TIMEOUT_SECS", default_value_t = 60)]
    pub process_start_timeout_secs: u64,

    /// Seconds a worker has to answer the init handshake.
    #[arg(long, env = "WORKER_INIT_TIMEOUT_SECS", default_value_t = 30)]
    pub worker_init_timeout_secs: u64,

    /// Seconds to wait for function load and status responses.
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    /// Seconds an invocation may run before it fails with a timeout.
    #[arg(long, env = "INVOCATION_TIMEOUT_SECS", default_value_t = 300)]
    pub invocation_timeout_secs: u64,

    /// Milliseconds between readiness checks of a waiting invocation.
    #[arg(long, env = "READY_POLL_INTERVAL_MS", default_value_t = 500)]
    pub ready_poll_interval_ms: u64,

    /// Worker errors tolerated before the host gives up. Defaults to three
    /// times the maximum process count.
    #[arg(long, env = "ERROR_EVENTS_THRESHOLD")]
    pub error_events_threshold: Option<usize>,

    /// Capacity of each worker's outbound message buffer.
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 32)]
    pub stream_buffer_size: usize,

    /// Largest gRPC message workers may send or receive, in bytes.
    #[arg(long, env = "GRPC_MAX_MESSAGE_LENGTH", default_value_t = DEFAULT_MAX_MESSAGE_LENGTH)]
    pub max_message_length: usize,

    /// Invoke this function once the host is up, then keep serving.
    #[arg(long)]
    pub invoke: Option<String>,

    /// Input for `--invoke`, as `name=value`. Repeatable.
    #[arg(long = "input", requires = "invoke")]
    pub inputs: Vec<String>,
}

/// A function to run once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeInvocation {
    pub function: String,
    pub inputs: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub listen_addr: String,
    pub workers: Vec<WorkerConfig>,
    pub functions: Vec<FunctionMetadata>,
    pub worker_runtime: String,
    pub function_app_directory: PathBuf,
    pub process_start_timeout: Duration,
    pub worker_init_timeout: Duration,
    pub request_timeout: Duration,
    pub invocation_timeout: Duration,
    pub ready_poll_interval: Duration,
    pub error_events_threshold: Option<usize>,
    pub stream_buffer_size: usize,
    pub max_message_length: usize,
    pub smoke: Option<SmokeInvocation>,
}

impl TryFrom<CliArgs> for HostConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }
        if args.process_start_timeout_secs == 0 {
            bail!("PROCESS_START_TIMEOUT_SECS must be greater than 0");
        }
        if args.ready_poll_interval_ms == 0 {
            bail!("READY_POLL_INTERVAL_MS must be greater than 0");
        }

        let workers = args
            .worker_configs
            .iter()
            .map(|path| WorkerConfig::load(path))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let worker_runtime = match (args.worker_runtime, workers.as_slice()) {
            (Some(runtime), _) => runtime,
            (None, [only]) => only.description.language.clone(),
            (None, _) => bail!(
                "FUNCTIONS_WORKER_RUNTIME is required when {} worker configurations are given",
                workers.len()
            ),
        };
        if !workers
            .iter()
            .any(|worker| worker.description.language == worker_runtime)
        {
            bail!("no worker configuration for runtime `{worker_runtime}`");
        }

        let functions = match &args.functions {
            Some(path) => load_manifest(path, &workers)?,
            None => Vec::new(),
        };

        let smoke = args
            .invoke
            .map(|function| {
                let inputs = args
                    .inputs
                    .iter()
                    .map(|input| parse_input(input))
                    .collect::<anyhow::Result<Vec<_>>>()?;
                anyhow::Ok(SmokeInvocation { function, inputs })
            })
            .transpose()?;

        Ok(Self {
            listen_addr: args.listen_addr,
            workers,
            functions,
            worker_runtime,
            function_app_directory: args.function_app_directory,
            process_start_timeout: Duration::from_secs(args.process_start_timeout_secs),
            worker_init_timeout: Duration::from_secs(args.worker_init_timeout_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            invocation_timeout: Duration::from_secs(args.invocation_timeout_secs),
            ready_poll_interval: Duration::from_millis(args.ready_poll_interval_ms),
            error_events_threshold: args.error_events_threshold,
            stream_buffer_size: args.stream_buffer_size,
            max_message_length: args.max_message_length,
            smoke,
        })
    }
}

impl HostConfig {
    pub fn runtime_worker(&self) -> Option<&WorkerConfig> {
        self.workers
            .iter()
            .find(|worker| worker.description.language == self.worker_runtime)
    }

    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            host_version: env!("CARGO_PKG_VERSION").to_owned(),
            worker_directory: String::new(),
            function_app_directory: self.function_app_directory.display().to_string(),
            process_start_timeout: self.process_start_timeout,
            init_timeout: self.worker_init_timeout,
            request_timeout: self.request_timeout,
            invocation_timeout: self.invocation_timeout,
            ..ChannelOptions::default()
        }
    }

    pub fn dispatcher_options(&self) -> DispatcherOptions {
        let process = self
            .runtime_worker()
            .map(|worker| worker.process_options.clone())
            .unwrap_or_default();
        DispatcherOptions {
            worker_runtime: self.worker_runtime.clone(),
            process_count: process.process_count,
            max_process_count: process.max_process_count,
            process_startup_interval: Duration::from_millis(process.process_startup_interval_ms),
            process_restart_interval: Duration::from_millis(process.process_restart_interval_ms),
            process_shutdown_timeout: Duration::from_millis(process.process_shutdown_timeout_ms),
            process_start_timeout: self.process_start_timeout,
            ready_poll_interval: self.ready_poll_interval,
            error_events_threshold: self.error_events_threshold,
        }
    }
}

fn parse_input(input: &str) -> anyhow::Result<(String, String)> {
    match input.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => bail!("invalid input `{input}`, expected name=value"),
    }
}

/// One `worker.config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub description: WorkerDescription,
    #[serde(default)]
    pub process_options: WorkerProcessOptions,
}

/// Static description of a language worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDescription {
    pub language: String,
    /// Script extensions this worker runs, with their leading dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    pub default_executable_path: String,
    #[serde(default)]
    pub default_worker_path: Option<String>,
    /// Defaults to the directory of the configuration file.
    #[serde(default)]
    pub worker_directory: Option<PathBuf>,
    /// Arguments for the executable.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Arguments for the worker entry point.
    #[serde(default)]
    pub worker_arguments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerProcessOptions {
    pub process_count: usize,
    pub max_process_count: usize,
    pub process_startup_interval_ms: u64,
    pub process_restart_interval_ms: u64,
    pub process_shutdown_timeout_ms: u64,
}

impl Default for WorkerProcessOptions {
    fn default() -> Self {
        Self {
            process_count: 1,
            max_process_count: 10,
            process_startup_interval_ms: 10_000,
            process_restart_interval_ms: 10_000,
            process_shutdown_timeout_ms: 10_000,
        }
    }
}

impl WorkerConfig {
    /// Reads and validates a worker configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read worker config {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid worker config {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.validate(base)?;
        Ok(config)
    }

    fn validate(&mut self, base: &Path) -> anyhow::Result<()> {
        let options = &self.process_options;
        if options.max_process_count == 0 {
            bail!("maxProcessCount must be greater than 0");
        }
        if !(1..=options.max_process_count).contains(&options.process_count) {
            bail!(
                "processCount must be between 1 and {} (got {})",
                options.max_process_count,
                options.process_count
            );
        }
        self.description.validate(base)
    }
}

impl WorkerDescription {
    fn validate(&mut self, base: &Path) -> anyhow::Result<()> {
        if self.language.trim().is_empty() {
            bail!("worker description is missing `language`");
        }
        if self.default_executable_path.trim().is_empty() {
            bail!(
                "worker description for `{}` is missing `defaultExecutablePath`",
                self.language
            );
        }

        let directory = match self.worker_directory.take() {
            Some(dir) if dir.is_relative() => base.join(dir),
            Some(dir) => dir,
            None => base.to_path_buf(),
        };
        let directory_str = directory.display().to_string();

        if let Some(worker_path) = &self.default_worker_path {
            let worker_path = worker_path.replace(WORKER_DIRECTORY_PLACEHOLDER, &directory_str);
            let resolved = if Path::new(&worker_path).is_relative() {
                directory.join(worker_path)
            } else {
                PathBuf::from(worker_path)
            };
            self.default_worker_path = Some(resolved.display().to_string());
        }
        for arg in self
            .arguments
            .iter_mut()
            .chain(self.worker_arguments.iter_mut())
        {
            *arg = arg.replace(WORKER_DIRECTORY_PLACEHOLDER, &directory_str);
        }
        self.default_executable_path = self
            .default_executable_path
            .replace(WORKER_DIRECTORY_PLACEHOLDER, &directory_str);
        self.extensions = self
            .extensions
            .iter()
            .map(|ext| ext.to_ascii_lowercase())
            .collect();
        self.worker_directory = Some(directory);
        Ok(())
    }

    pub fn working_directory(&self) -> PathBuf {
        self.worker_directory
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn process_arguments(&self) -> WorkerProcessArguments {
        WorkerProcessArguments {
            executable_path: PathBuf::from(&self.default_executable_path),
            executable_arguments: self.arguments.clone(),
            worker_path: self.default_worker_path.as_ref().map(PathBuf::from),
            worker_arguments: self.worker_arguments.clone(),
        }
    }

    pub fn handles_extension(&self, extension: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case(extension))
    }
}

/// Reads the function manifest, filling in function ids and resolving
/// missing languages from script extensions.
pub fn load_manifest(path: &Path, workers: &[WorkerConfig]) -> anyhow::Result<Vec<FunctionMetadata>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read function manifest {}", path.display()))?;
    let mut functions: Vec<FunctionMetadata> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid function manifest {}", path.display()))?;

    for function in &mut functions {
        if function.name.is_empty() {
            bail!("function manifest entry without a name");
        }
        if function.function_id.is_empty() {
            function.function_id = function.name.clone();
        }
        if function.language.is_none() {
            function.language = function.extension().and_then(|ext| {
                workers
                    .iter()
                    .find(|worker| worker.description.handles_extension(&ext))
                    .map(|worker| worker.description.language.clone())
            });
        }
        if function.language.is_none() {
            #[cfg(feature = "tracing")]
            tracing::warn!(function = %function.name, "No worker handles this function");
        }
    }
    Ok(functions)
}
