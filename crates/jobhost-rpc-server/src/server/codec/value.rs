//! Host-side values exchanged with workers.

use bytes::Bytes;
use core::fmt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A value bound to a function input or produced by a function output, in
/// the host's own representation.
#[derive(Debug, Clone, Default)]
pub enum HostValue {
    #[default]
    Null,
    Bytes(Bytes),
    String(String),
    /// Structured value, sent as compact JSON.
    Json(serde_json::Value),
    Int(i64),
    Double(f64),
    Http(Box<HttpData>),
    BytesArray(Vec<Option<Bytes>>),
    StringArray(Vec<Option<String>>),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i64>),
    /// Anything else. Encoded as JSON when it serializes, else as its
    /// display string.
    Custom(Arc<dyn CustomValue>),
}

/// A host value with no dedicated wire representation.
pub trait CustomValue: fmt::Debug + fmt::Display + Send + Sync {
    fn to_json(&self) -> serde_json::Result<String>;
}

/// Adapts any `Serialize + Display` type into a [`CustomValue`].
#[derive(Debug, Clone)]
pub struct Serializable<T>(pub T);

impl<T> fmt::Display for Serializable<T>
where
    T: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T> CustomValue for Serializable<T>
where
    T: Serialize + fmt::Display + fmt::Debug + Send + Sync,
{
    fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }
}

impl HostValue {
    pub fn custom<T>(value: T) -> Self
    where
        T: CustomValue + 'static,
    {
        Self::Custom(Arc::new(value))
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Renders the value as JSON for logs and the smoke-invoke output.
    pub fn to_json_value(&self) -> serde_json::Value {
        use base64::Engine;
        use serde_json::Value;

        let b64 = |b: &Bytes| Value::String(base64::engine::general_purpose::STANDARD.encode(b));
        match self {
            Self::Null => Value::Null,
            Self::Bytes(b) => b64(b),
            Self::String(s) => Value::String(s.clone()),
            Self::Json(v) => v.clone(),
            Self::Int(i) => Value::from(*i),
            Self::Double(d) => Value::from(*d),
            Self::Http(http) => http.to_json_value(),
            Self::BytesArray(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.as_ref().map_or(Value::Null, b64))
                    .collect(),
            ),
            Self::StringArray(items) => Value::from(items.clone()),
            Self::DoubleArray(items) => Value::from(items.clone()),
            Self::IntArray(items) => Value::from(items.clone()),
            Self::Custom(v) => v
                .to_json()
                .ok()
                .and_then(|json| serde_json::from_str(&json).ok())
                .unwrap_or_else(|| Value::String(v.to_string())),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Double(a), Self::Double(b)) => a == b,
            (Self::Http(a), Self::Http(b)) => a == b,
            (Self::BytesArray(a), Self::BytesArray(b)) => a == b,
            (Self::StringArray(a), Self::StringArray(b)) => a == b,
            (Self::DoubleArray(a), Self::DoubleArray(b)) => a == b,
            (Self::IntArray(a), Self::IntArray(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for HostValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<i64> for HostValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<serde_json::Value> for HostValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            other => Self::Json(other),
        }
    }
}

impl From<HttpData> for HostValue {
    fn from(value: HttpData) -> Self {
        Self::Http(Box::new(value))
    }
}

/// An HTTP request (trigger input) or response (function output).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpData {
    pub method: String,
    /// Absolute URL including the query string. Empty for responses.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    /// Route parameters. `None` marks a parameter bound to null.
    pub params: BTreeMap<String, Option<String>>,
    pub identities: Vec<ClaimsIdentity>,
    pub body: Option<Bytes>,
    pub status_code: Option<String>,
}

impl HttpData {
    /// Builds a request from its parts; `query_string` includes the leading
    /// `?` when non-empty.
    pub fn request(
        method: impl Into<String>,
        scheme: &str,
        host: &str,
        path: &str,
        query_string: &str,
    ) -> Self {
        Self {
            method: method.into(),
            url: format!("{scheme}://{host}{path}{query_string}"),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_identity(mut self, identity: ClaimsIdentity) -> Self {
        self.identities.push(identity);
        self
    }

    /// Looks a header up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Query pairs parsed (and percent-decoded) from the URL, in order.
    pub fn query(&self) -> Vec<(String, String)> {
        url::Url::parse(&self.url)
            .map(|url| {
                url.query_pairs()
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn to_json_value(&self) -> serde_json::Value {
        serde_json::json!({
            "method": self.method,
            "url": self.url,
            "statusCode": self.status_code,
            "headers": self.headers,
            "params": self.params,
            "body": self.body.as_ref().map(|b| String::from_utf8_lossy(b).into_owned()),
        })
    }
}

/// One authenticated identity attached to an HTTP request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimsIdentity {
    pub authentication_type: Option<String>,
    pub name_claim_type: Option<String>,
    pub role_claim_type: Option<String>,
    pub claims: Vec<Claim>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
}
