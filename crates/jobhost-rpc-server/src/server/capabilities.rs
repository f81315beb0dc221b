//! Worker capability table.
//!
//! A worker declares optional protocol features in its `WorkerInitResponse`
//! as a string map. The table is filled exactly once from that handshake and
//! is read-only afterwards, so readers need no synchronization beyond the
//! `OnceLock` the channel stores it in.

use jobhost_rpc_core::types::{
    HANDLES_INVOCATION_CANCEL_MESSAGE, HANDLES_WORKER_TERMINATE_MESSAGE,
    IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS, RAW_HTTP_BODY_BYTES, RPC_HTTP_BODY_ONLY,
    TYPED_DATA_COLLECTION, USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP, WORKER_STATUS,
};
use std::collections::HashMap;

/// Negotiated capabilities of one worker connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    states: HashMap<String, String>,
}

impl Capabilities {
    pub fn new(states: HashMap<String, String>) -> Self {
        Self { states }
    }

    /// Returns the negotiated value for `name`, or `None` when the worker did
    /// not declare it.
    pub fn get_capability_state(&self, name: &str) -> Option<&str> {
        self.states.get(name).map(String::as_str)
    }

    /// A capability is enabled when its value is present and non-empty.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get_capability_state(name)
            .is_some_and(|value| !value.is_empty())
    }

    pub fn raw_body_bytes(&self) -> bool {
        self.is_enabled(RAW_HTTP_BODY_BYTES)
    }

    pub fn body_only(&self) -> bool {
        self.is_enabled(RPC_HTTP_BODY_ONLY)
    }

    pub fn typed_data_collection(&self) -> bool {
        self.is_enabled(TYPED_DATA_COLLECTION)
    }

    pub fn ignore_empty_headers(&self) -> bool {
        self.is_enabled(IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS)
    }

    pub fn nullable_http_maps(&self) -> bool {
        self.is_enabled(USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP)
    }

    pub fn handles_worker_terminate(&self) -> bool {
        self.is_enabled(HANDLES_WORKER_TERMINATE_MESSAGE)
    }

    pub fn handles_invocation_cancel(&self) -> bool {
        self.is_enabled(HANDLES_INVOCATION_CANCEL_MESSAGE)
    }

    pub fn worker_status(&self) -> bool {
        self.is_enabled(WORKER_STATUS)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Capabilities
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            states: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
