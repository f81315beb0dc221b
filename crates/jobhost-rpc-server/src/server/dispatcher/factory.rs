//! How the dispatcher obtains new worker channels.

use crate::server::{
    channel::{ChannelOptions, ChannelParts, EventSender, StreamRegistry, WorkerChannel},
    codec::Codec,
    config::WorkerDescription,
    process::{WorkerContext, WorkerProcess},
};
use jobhost_rpc_core::{Error, Result};
use std::{collections::HashMap, sync::Arc};

/// Creates unstarted channels for a language.
pub trait ChannelFactory: Send + Sync {
    fn create(&self, language: &str, events: EventSender) -> Result<Arc<WorkerChannel>>;
}

/// Where launched workers dial back to.
#[derive(Debug, Clone)]
pub struct HostEndpoint {
    pub host: String,
    pub port: u16,
    pub max_message_length: usize,
}

/// Launches one OS process per channel and pairs it with the stream the
/// process opens against the host's gRPC server.
pub struct ProcessChannelFactory {
    registry: StreamRegistry,
    descriptions: HashMap<String, WorkerDescription>,
    endpoint: HostEndpoint,
    codec: Arc<Codec>,
    options: ChannelOptions,
}

impl ProcessChannelFactory {
    pub fn new(
        registry: StreamRegistry,
        descriptions: impl IntoIterator<Item = WorkerDescription>,
        endpoint: HostEndpoint,
        codec: Arc<Codec>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            registry,
            descriptions: descriptions
                .into_iter()
                .map(|description| (description.language.clone(), description))
                .collect(),
            endpoint,
            codec,
            options,
        }
    }
}

impl ChannelFactory for ProcessChannelFactory {
    fn create(&self, language: &str, events: EventSender) -> Result<Arc<WorkerChannel>> {
        let description = self
            .descriptions
            .get(language)
            .ok_or_else(|| Error::NoWorkerAvailable {
                language: language.to_owned(),
            })?;

        let worker_id = uuid::Uuid::new_v4().to_string();
        let context = WorkerContext {
            worker_id: worker_id.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            arguments: description.process_arguments(),
            working_directory: description.working_directory(),
            server_host: self.endpoint.host.clone(),
            server_port: self.endpoint.port,
            max_message_length: self.endpoint.max_message_length,
            environment: Vec::new(),
        };
        let mut options = self.options.clone();
        options.worker_directory = description.working_directory().display().to_string();

        #[cfg(feature = "tracing")]
        tracing::debug!(%worker_id, %language, command = %context.display_command(), "Creating worker channel");

        Ok(WorkerChannel::new(ChannelParts {
            stream: self.registry.expect(&worker_id),
            registry: Some(self.registry.clone()),
            worker_id,
            language: language.to_owned(),
            process: Some(WorkerProcess::new(context)),
            codec: self.codec.clone(),
            options,
            events,
        }))
    }
}
