//! HTTP payload encoding.
//!
//! Which maps and body fields are populated depends on the worker's
//! capabilities:
//!
//! - `IgnoreEmptyValuedRpcHttpHeaders` drops headers whose value is empty.
//! - `UseNullableValueDictionaryForHttp` moves headers, query and params into
//!   the `nullable_*` maps so that null and "" stay distinct.
//! - `RpcHttpBodyOnly` populates only `body`; otherwise `raw_body` carries
//!   the unparsed payload next to a (possibly JSON-parsed) `body`.
//! - `RawHttpBodyBytes` sends raw payloads as bytes instead of strings.

use super::{Codec, typed_data_bytes};
use super::value::{Claim, ClaimsIdentity, HttpData};
use crate::server::capabilities::Capabilities;
use bytes::Bytes;
use std::collections::BTreeMap;
use jobhost_rpc_core::proto::{
    NullableString, RpcClaim, RpcClaimsIdentity, RpcHttp, TypedData, typed_data::Data,
};

/// Header names folded to lowercase. Values of names that differ only in
/// case are combined with `", "` in key order, skipping empty ones.
fn lowercase_headers(http: &HttpData, drop_empty: bool) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::<String, String>::new();
    for (name, value) in &http.headers {
        if value.is_empty() && drop_empty {
            continue;
        }
        let merged = headers.entry(name.to_ascii_lowercase()).or_default();
        if merged.is_empty() {
            merged.clone_from(value);
        } else if !value.is_empty() {
            merged.push_str(", ");
            merged.push_str(value);
        }
    }
    headers
}

pub(crate) fn to_rpc_http(codec: &Codec, http: &HttpData, caps: &Capabilities) -> RpcHttp {
    let nullable = caps.nullable_http_maps();
    let mut rpc = RpcHttp {
        method: http.method.clone(),
        url: http.url.clone(),
        status_code: http.status_code.clone().unwrap_or_default(),
        ..Default::default()
    };

    for (name, value) in lowercase_headers(http, caps.ignore_empty_headers()) {
        if nullable {
            rpc.nullable_headers.insert(name, NullableString::some(value));
        } else {
            rpc.headers.insert(name, value);
        }
    }

    for (name, value) in http.query() {
        if value.is_empty() {
            continue;
        }
        if nullable {
            rpc.nullable_query.insert(name, NullableString::some(value));
        } else {
            rpc.query.insert(name, value);
        }
    }

    for (name, value) in &http.params {
        if nullable {
            rpc.nullable_params.insert(
                name.clone(),
                NullableString {
                    value: value.clone(),
                },
            );
        } else if let Some(value) = value {
            rpc.params.insert(name.clone(), value.clone());
        }
    }

    rpc.identities = http.identities.iter().map(identity_to_wire).collect();

    if let Some(body) = &http.body {
        encode_body(codec, http, body, caps, &mut rpc);
    }

    rpc
}

fn encode_body(
    codec: &Codec,
    http: &HttpData,
    body: &Bytes,
    caps: &Capabilities,
    rpc: &mut RpcHttp,
) {
    let content_type = http.content_type();
    let as_string = || String::from_utf8_lossy(body).into_owned();
    let raw = if caps.raw_body_bytes() {
        Data::Bytes(body.clone())
    } else {
        Data::String(as_string())
    };

    if caps.body_only() {
        let data = if codec.is_octet_or_multipart(content_type) || caps.raw_body_bytes() {
            Data::Bytes(body.clone())
        } else {
            Data::String(as_string())
        };
        rpc.body = Some(TypedData::new(data));
        return;
    }

    let data = if codec.is_json(content_type) {
        let text = as_string();
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(_) => Data::Json(text),
            Err(_) => Data::String(text),
        }
    } else if codec.is_octet_or_multipart(content_type) {
        Data::Bytes(body.clone())
    } else {
        Data::String(as_string())
    };
    rpc.body = Some(TypedData::new(data));
    rpc.raw_body = Some(TypedData::new(raw));
}

pub(crate) fn from_rpc_http(_codec: &Codec, rpc: &RpcHttp) -> HttpData {
    let mut http = HttpData {
        method: rpc.method.clone(),
        url: rpc.url.clone(),
        status_code: (!rpc.status_code.is_empty()).then(|| rpc.status_code.clone()),
        ..Default::default()
    };

    http.headers.extend(rpc.headers.clone());
    http.headers.extend(
        rpc.nullable_headers
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone().unwrap_or_default())),
    );

    http.params
        .extend(rpc.params.iter().map(|(k, v)| (k.clone(), Some(v.clone()))));
    http.params.extend(
        rpc.nullable_params
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone())),
    );

    http.identities = rpc.identities.iter().map(identity_from_wire).collect();

    http.body = rpc
        .raw_body
        .as_ref()
        .and_then(typed_data_bytes)
        .or_else(|| rpc.body.as_ref().and_then(typed_data_bytes));

    http
}

fn nullable(value: &Option<String>) -> Option<NullableString> {
    value.as_ref().map(|v| NullableString::some(v.clone()))
}

fn identity_to_wire(identity: &ClaimsIdentity) -> RpcClaimsIdentity {
    RpcClaimsIdentity {
        authentication_type: nullable(&identity.authentication_type),
        name_claim_type: nullable(&identity.name_claim_type),
        role_claim_type: nullable(&identity.role_claim_type),
        claims: identity
            .claims
            .iter()
            .map(|claim| RpcClaim {
                value: claim.value.clone(),
                r#type: claim.claim_type.clone(),
            })
            .collect(),
    }
}

fn identity_from_wire(identity: &RpcClaimsIdentity) -> ClaimsIdentity {
    let unwrap = |v: &Option<NullableString>| v.as_ref().and_then(|n| n.value.clone());
    ClaimsIdentity {
        authentication_type: unwrap(&identity.authentication_type),
        name_claim_type: unwrap(&identity.name_claim_type),
        role_claim_type: unwrap(&identity.role_claim_type),
        claims: identity
            .claims
            .iter()
            .map(|claim| Claim {
                claim_type: claim.r#type.clone(),
                value: claim.value.clone(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::codec::HostValue;
    use jobhost_rpc_core::types::{
        IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS, RAW_HTTP_BODY_BYTES, RPC_HTTP_BODY_ONLY,
        USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP,
    };

    fn caps(names: &[&str]) -> Capabilities {
        names.iter().map(|name| (*name, "true")).collect()
    }

    fn request() -> HttpData {
        HttpData::request("POST", "https", "example.test", "/api/orders", "?id=7&empty=&q=a%20b")
            .with_header("Content-Type", "application/json")
            .with_header("X-Trace", "")
            .with_param("id", Some("7".into()))
            .with_param("missing", None)
            .with_body(&b"{\"qty\":3}"[..])
    }

    fn encode(value: &HostValue, caps: &Capabilities) -> RpcHttp {
        match Codec::new().to_wire(value, caps).data {
            Some(Data::Http(rpc)) => *rpc,
            other => panic!("expected http, got {other:?}"),
        }
    }

    #[test]
    fn request_shape() {
        let rpc = encode(&request().into(), &Capabilities::default());

        assert_eq!(rpc.method, "POST");
        assert_eq!(rpc.url, "https://example.test/api/orders?id=7&empty=&q=a%20b");
        assert_eq!(rpc.headers.get("content-type").map(String::as_str), Some("application/json"));
        assert_eq!(rpc.headers.get("x-trace").map(String::as_str), Some(""));
        assert_eq!(rpc.query.get("q").map(String::as_str), Some("a b"));
        assert!(!rpc.query.contains_key("empty"));
        assert_eq!(rpc.params.len(), 1);
        assert_eq!(rpc.body, Some(TypedData::new(Data::Json("{\"qty\":3}".into()))));
        assert_eq!(rpc.raw_body, Some(TypedData::new(Data::String("{\"qty\":3}".into()))));
    }

    #[test]
    fn empty_headers_dropped_when_negotiated() {
        let rpc = encode(
            &request().into(),
            &caps(&[IGNORE_EMPTY_VALUED_RPC_HTTP_HEADERS]),
        );
        assert!(!rpc.headers.contains_key("x-trace"));
        assert!(rpc.headers.contains_key("content-type"));
    }

    #[test]
    fn headers_differing_in_case_are_combined() {
        let http = HttpData::request("GET", "https", "example.test", "/", "")
            .with_header("Accept", "text/html")
            .with_header("accept", "application/json")
            .with_header("X-Empty", "")
            .with_header("x-empty", "set");

        let rpc = encode(&http.clone().into(), &Capabilities::default());
        assert_eq!(rpc.headers.len(), 2);
        assert_eq!(rpc.headers["accept"], "text/html, application/json");
        assert_eq!(rpc.headers["x-empty"], "set");

        let rpc = encode(&http.into(), &caps(&[USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP]));
        assert_eq!(
            rpc.nullable_headers["accept"],
            NullableString::some("text/html, application/json")
        );
    }

    #[test]
    fn nullable_maps_keep_null_distinct_from_empty() {
        let rpc = encode(
            &request().into(),
            &caps(&[USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP]),
        );
        assert!(rpc.headers.is_empty() && rpc.params.is_empty() && rpc.query.is_empty());
        assert_eq!(rpc.nullable_headers["x-trace"], NullableString::some(""));
        assert_eq!(rpc.nullable_params["missing"], NullableString { value: None });
        assert_eq!(rpc.nullable_params["id"], NullableString::some("7"));
        assert_eq!(rpc.nullable_query["id"], NullableString::some("7"));
    }

    #[test]
    fn body_only_modes() {
        let rpc_body = encode(&request().into(), &caps(&[RPC_HTTP_BODY_ONLY]));
        assert_eq!(rpc_body.body, Some(TypedData::new(Data::String("{\"qty\":3}".into()))));
        assert_eq!(rpc_body.raw_body, None);

        let rpc_bytes = encode(
            &request().into(),
            &caps(&[RPC_HTTP_BODY_ONLY, RAW_HTTP_BODY_BYTES]),
        );
        assert_eq!(
            rpc_bytes.body,
            Some(TypedData::new(Data::Bytes(Bytes::from_static(b"{\"qty\":3}"))))
        );
    }

    #[test]
    fn octet_body_is_bytes_with_string_raw_body() {
        let http = HttpData::request("PUT", "http", "h", "/blob", "")
            .with_header("content-type", "application/octet-stream")
            .with_body(&b"abc"[..]);
        let rpc = encode(&http.into(), &Capabilities::default());
        assert_eq!(rpc.body, Some(TypedData::new(Data::Bytes(Bytes::from_static(b"abc")))));
        assert_eq!(rpc.raw_body, Some(TypedData::new(Data::String("abc".into()))));

        let http = HttpData::request("PUT", "http", "h", "/blob", "")
            .with_header("content-type", "application/octet-stream")
            .with_body(&b"abc"[..]);
        let rpc = encode(&http.into(), &caps(&[RAW_HTTP_BODY_BYTES]));
        assert_eq!(
            rpc.raw_body,
            Some(TypedData::new(Data::Bytes(Bytes::from_static(b"abc"))))
        );
    }

    #[test]
    fn malformed_json_body_is_sent_as_string() {
        let http = HttpData::request("POST", "http", "h", "/", "")
            .with_header("content-type", "application/json")
            .with_body(&b"{oops"[..]);
        let rpc = encode(&http.into(), &Capabilities::default());
        assert_eq!(rpc.body, Some(TypedData::new(Data::String("{oops".into()))));
    }

    #[test]
    fn http_round_trips() {
        let codec = Codec::new();
        let identity = ClaimsIdentity {
            authentication_type: Some("Bearer".into()),
            name_claim_type: None,
            role_claim_type: Some("role".into()),
            claims: vec![Claim {
                claim_type: "sub".into(),
                value: "user-1".into(),
            }],
        };
        let http = HttpData::request("GET", "https", "example.test", "/items", "?page=2")
            .with_header("accept", "text/plain")
            .with_header("content-type", "text/plain")
            .with_param("id", Some("9".into()))
            .with_identity(identity)
            .with_body(&b"hello"[..]);
        let value = HostValue::from(http);

        for caps in [
            Capabilities::default(),
            caps(&[RPC_HTTP_BODY_ONLY]),
            caps(&[RAW_HTTP_BODY_BYTES]),
        ] {
            let decoded = codec.from_wire(&codec.to_wire(&value, &caps)).unwrap();
            assert_eq!(decoded, value);
        }

        let nullable = caps(&[USE_NULLABLE_VALUE_DICTIONARY_FOR_HTTP]);
        let with_null = HostValue::from(
            HttpData::request("GET", "http", "h", "/", "").with_param("gone", None),
        );
        let decoded = codec.from_wire(&codec.to_wire(&with_null, &nullable)).unwrap();
        assert_eq!(decoded, with_null);
    }

    #[test]
    fn response_status_code_round_trips() {
        let codec = Codec::new();
        let response = HostValue::from(HttpData {
            status_code: Some("201".into()),
            body: Some(Bytes::from_static(b"created")),
            ..Default::default()
        });
        let decoded = codec
            .from_wire(&codec.to_wire(&response, &Capabilities::default()))
            .unwrap();
        assert_eq!(decoded, response);
    }
}
