//! Conversion between host values and the worker wire representation.
//!
//! A [`Codec`] is owned by the dispatcher and handed to every channel it
//! creates; there are no process-wide converter tables. Encoding never fails:
//! values without a dedicated wire shape degrade to JSON and then to their
//! display string. Decoding dispatches on the wire discriminant and rejects
//! discriminants the host does not understand.

pub mod http;
mod value;

pub use value::{Claim, ClaimsIdentity, CustomValue, HostValue, HttpData, Serializable};

use crate::server::capabilities::Capabilities;
use bytes::Bytes;
use jobhost_rpc_core::{
    Error, Result,
    proto::{
        CollectionBytes, CollectionDouble, CollectionSInt64, CollectionString, ParameterBinding,
        TypedData, typed_data::Data,
    },
};
use std::collections::HashMap;

/// Media types that steer how HTTP bodies are encoded.
#[derive(Debug, Clone)]
pub struct Codec {
    json_media_types: Vec<String>,
    octet_media_types: Vec<String>,
    multipart_prefix: String,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            json_media_types: vec!["application/json".to_owned(), "text/json".to_owned()],
            octet_media_types: vec!["application/octet-stream".to_owned()],
            multipart_prefix: "multipart/".to_owned(),
        }
    }
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a host value for a worker with the given capabilities.
    pub fn to_wire(&self, value: &HostValue, capabilities: &Capabilities) -> TypedData {
        let data = match value {
            HostValue::Null => return TypedData::default(),
            HostValue::Bytes(bytes) => Data::Bytes(bytes.clone()),
            HostValue::String(s) => Data::String(s.clone()),
            HostValue::Json(json) => Data::Json(json.to_string()),
            HostValue::Int(i) => Data::Int(*i),
            HostValue::Double(d) => Data::Double(*d),
            HostValue::Http(http) => {
                Data::Http(Box::new(http::to_rpc_http(self, http, capabilities)))
            }
            HostValue::BytesArray(items) if capabilities.typed_data_collection() => {
                Data::CollectionBytes(CollectionBytes {
                    bytes: items.iter().flatten().cloned().collect(),
                })
            }
            HostValue::StringArray(items) if capabilities.typed_data_collection() => {
                Data::CollectionString(CollectionString {
                    string: items
                        .iter()
                        .flatten()
                        .filter(|s| !s.is_empty())
                        .cloned()
                        .collect(),
                })
            }
            HostValue::DoubleArray(items) if capabilities.typed_data_collection() => {
                Data::CollectionDouble(CollectionDouble {
                    double: items.clone(),
                })
            }
            HostValue::IntArray(items) if capabilities.typed_data_collection() => {
                Data::CollectionSint64(CollectionSInt64 {
                    sint64: items.clone(),
                })
            }
            // Arrays without the collection capability take the generic path.
            HostValue::BytesArray(_)
            | HostValue::StringArray(_)
            | HostValue::DoubleArray(_)
            | HostValue::IntArray(_) => Data::Json(value.to_json_value().to_string()),
            HostValue::Custom(custom) => match custom.to_json() {
                Ok(json) => Data::Json(json),
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %_e, "Falling back to display string");
                    Data::String(custom.to_string())
                }
            },
        };
        TypedData::new(data)
    }

    /// Decodes a wire value. Fails only on discriminants the host cannot
    /// represent.
    pub fn from_wire(&self, typed: &TypedData) -> Result<HostValue> {
        let Some(data) = &typed.data else {
            return Ok(HostValue::Null);
        };
        let value = match data {
            Data::String(s) => HostValue::String(s.clone()),
            Data::Json(s) => match serde_json::from_str::<serde_json::Value>(s) {
                Ok(json) => HostValue::from(json),
                Err(_) => HostValue::String(s.clone()),
            },
            Data::Bytes(b) | Data::Stream(b) => HostValue::Bytes(b.clone()),
            Data::Http(rpc) => HostValue::Http(Box::new(http::from_rpc_http(self, rpc))),
            Data::Int(i) => HostValue::Int(*i),
            Data::Double(d) => HostValue::Double(*d),
            Data::CollectionBytes(c) => {
                HostValue::BytesArray(c.bytes.iter().cloned().map(Some).collect())
            }
            Data::CollectionString(c) => {
                HostValue::StringArray(c.string.iter().cloned().map(Some).collect())
            }
            Data::CollectionDouble(c) => HostValue::DoubleArray(c.double.clone()),
            Data::CollectionSint64(c) => HostValue::IntArray(c.sint64.clone()),
            other @ Data::ModelBindingData(_) => {
                return Err(Error::UnknownWireType {
                    discriminant: other.kind().to_owned(),
                });
            }
        };
        Ok(value)
    }

    pub fn encode_bindings(
        &self,
        values: &[(String, HostValue)],
        capabilities: &Capabilities,
    ) -> Vec<ParameterBinding> {
        values
            .iter()
            .map(|(name, value)| ParameterBinding {
                name: name.clone(),
                data: Some(self.to_wire(value, capabilities)),
            })
            .collect()
    }

    pub fn encode_map(
        &self,
        values: &[(String, HostValue)],
        capabilities: &Capabilities,
    ) -> HashMap<String, TypedData> {
        values
            .iter()
            .map(|(name, value)| (name.clone(), self.to_wire(value, capabilities)))
            .collect()
    }

    pub fn decode_bindings(&self, bindings: &[ParameterBinding]) -> Result<Vec<(String, HostValue)>> {
        bindings
            .iter()
            .map(|binding| {
                let value = match &binding.data {
                    Some(data) => self.from_wire(data)?,
                    None => HostValue::Null,
                };
                Ok((binding.name.clone(), value))
            })
            .collect()
    }

    fn essence(content_type: &str) -> String {
        content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    pub(crate) fn is_json(&self, content_type: Option<&str>) -> bool {
        content_type.is_some_and(|ct| {
            let essence = Self::essence(ct);
            self.json_media_types.iter().any(|m| *m == essence)
        })
    }

    pub(crate) fn is_octet_or_multipart(&self, content_type: Option<&str>) -> bool {
        content_type.is_some_and(|ct| {
            let essence = Self::essence(ct);
            essence.starts_with(&self.multipart_prefix)
                || self.octet_media_types.iter().any(|m| *m == essence)
        })
    }
}

/// Flattens a decoded body value back into raw bytes.
pub(crate) fn typed_data_bytes(typed: &TypedData) -> Option<Bytes> {
    match typed.data.as_ref()? {
        Data::String(s) | Data::Json(s) => Some(Bytes::from(s.clone())),
        Data::Bytes(b) | Data::Stream(b) => Some(b.clone()),
        Data::Int(i) => Some(Bytes::from(i.to_string())),
        Data::Double(d) => Some(Bytes::from(d.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhost_rpc_core::proto::ModelBindingData;
    use jobhost_rpc_core::types::TYPED_DATA_COLLECTION;

    fn collections() -> Capabilities {
        [(TYPED_DATA_COLLECTION, "true")].into_iter().collect()
    }

    fn round_trip(codec: &Codec, value: HostValue, caps: &Capabilities) {
        let wire = codec.to_wire(&value, caps);
        let decoded = codec.from_wire(&wire).expect("decodes");
        assert_eq!(decoded, value, "wire form: {wire:?}");
    }

    #[test]
    fn scalars_survive_the_wire() {
        let codec = Codec::new();
        let caps = Capabilities::default();

        round_trip(&codec, HostValue::Null, &caps);
        round_trip(&codec, HostValue::from(vec![0u8, 1, 2, 255]), &caps);
        round_trip(&codec, HostValue::from("hello"), &caps);
        round_trip(&codec, HostValue::from(3.25), &caps);
        round_trip(&codec, HostValue::from(-42i64), &caps);
        round_trip(
            &codec,
            HostValue::from(serde_json::json!({"name": "blob", "size": 12, "tags": ["a"]})),
            &caps,
        );
    }

    #[test]
    fn arrays_use_collections_when_negotiated() {
        let codec = Codec::new();
        let caps = collections();

        let doubles = HostValue::DoubleArray(vec![1.0, 2.5]);
        assert!(matches!(
            codec.to_wire(&doubles, &caps).data,
            Some(Data::CollectionDouble(_))
        ));
        round_trip(&codec, doubles, &caps);
        round_trip(&codec, HostValue::IntArray(vec![1, -2, i64::MAX]), &caps);
        round_trip(
            &codec,
            HostValue::StringArray(vec![Some("a".into()), Some("b".into())]),
            &caps,
        );
        round_trip(
            &codec,
            HostValue::BytesArray(vec![Some(Bytes::from_static(b"x")), Some(Bytes::new())]),
            &caps,
        );
    }

    #[test]
    fn collections_skip_null_elements() {
        let codec = Codec::new();
        let caps = collections();

        let wire = codec.to_wire(
            &HostValue::StringArray(vec![Some("a".into()), None, Some(String::new())]),
            &caps,
        );
        assert_eq!(
            wire.data,
            Some(Data::CollectionString(CollectionString {
                string: vec!["a".into()]
            }))
        );

        let wire = codec.to_wire(
            &HostValue::BytesArray(vec![None, Some(Bytes::from_static(b"z"))]),
            &caps,
        );
        assert_eq!(
            wire.data,
            Some(Data::CollectionBytes(CollectionBytes {
                bytes: vec![Bytes::from_static(b"z")]
            }))
        );
    }

    #[test]
    fn arrays_fall_back_to_json_without_capability() {
        let codec = Codec::new();
        let wire = codec.to_wire(
            &HostValue::DoubleArray(vec![1.0, 2.0, 3.0]),
            &Capabilities::default(),
        );
        assert_eq!(wire.data, Some(Data::Json("[1.0,2.0,3.0]".into())));

        let wire = codec.to_wire(&HostValue::IntArray(vec![1, 2]), &Capabilities::default());
        assert_eq!(wire.data, Some(Data::Json("[1,2]".into())));
    }

    #[derive(Debug)]
    struct Opaque;

    impl core::fmt::Display for Opaque {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            f.write_str("opaque-value")
        }
    }

    impl CustomValue for Opaque {
        fn to_json(&self) -> serde_json::Result<String> {
            Err(serde::ser::Error::custom("not serializable"))
        }
    }

    #[test]
    fn custom_values_degrade_to_json_then_string() {
        let codec = Codec::new();
        let caps = Capabilities::default();

        let wire = codec.to_wire(&HostValue::custom(Serializable(7u32)), &caps);
        assert_eq!(wire.data, Some(Data::Json("7".into())));

        let wire = codec.to_wire(&HostValue::custom(Opaque), &caps);
        assert_eq!(wire.data, Some(Data::String("opaque-value".into())));
    }

    #[test]
    fn invalid_json_decodes_as_string() {
        let codec = Codec::new();
        let decoded = codec
            .from_wire(&TypedData::new(Data::Json("{not json".into())))
            .unwrap();
        assert_eq!(decoded, HostValue::from("{not json"));
    }

    #[test]
    fn model_binding_data_is_rejected() {
        let codec = Codec::new();
        let err = codec
            .from_wire(&TypedData::new(Data::ModelBindingData(
                ModelBindingData::default(),
            )))
            .unwrap_err();
        assert_eq!(
            err,
            Error::UnknownWireType {
                discriminant: "model_binding_data".into()
            }
        );
    }

    #[test]
    fn media_type_parameters_are_ignored() {
        let codec = Codec::new();
        assert!(codec.is_json(Some("Application/JSON; charset=utf-8")));
        assert!(codec.is_octet_or_multipart(Some("multipart/form-data; boundary=x")));
        assert!(!codec.is_octet_or_multipart(Some("text/plain")));
        assert!(!codec.is_json(None));
    }
}
