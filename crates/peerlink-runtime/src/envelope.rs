//! The JSON envelope every peer exchanges.
//!
//! ```json
//! {"type":"REQ","source":"peer-A","dest":"peer-B","correlation_id":"…",
//!  "key":"math.add","payload":{"a":2,"b":3},"ttl_ms":8000,"sent_at":1718000000000}
//! ```
//!
//! Which fields are required depends on the type:
//!
//! | type  | required beyond `type`/`source`          |
//! |-------|-------------------------------------------|
//! | HELLO | none                                      |
//! | REQ   | `dest`, `correlation_id`, `key`, `ttl_ms` |
//! | ACK   | `dest`, `correlation_id`                  |
//! | RESP  | `dest`, `correlation_id`                  |
//! | PUB   | `key` (the topic)                         |

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope discriminator, serialized as an upper-case string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnvelopeKind {
    Hello,
    Req,
    Ack,
    Resp,
    Pub,
}

impl EnvelopeKind {
    /// Wire spelling of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Req => "REQ",
            Self::Ack => "ACK",
            Self::Resp => "RESP",
            Self::Pub => "PUB",
        }
    }

    fn from_wire(raw: &str) -> Option<Self> {
        match raw {
            "HELLO" => Some(Self::Hello),
            "REQ" => Some(Self::Req),
            "ACK" => Some(Self::Ack),
            "RESP" => Some(Self::Resp),
            "PUB" => Some(Self::Pub),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bytes are not a JSON object of the expected shape.
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// The `type` field is not one of the five known kinds.
    #[error("unknown envelope type '{0}'")]
    UnknownType(String),

    /// A field required for this kind is absent.
    #[error("{kind} envelope missing required field '{field}'")]
    MissingField {
        kind: EnvelopeKind,
        field: &'static str,
    },
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Service key for REQ, topic for PUB.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub sent_at: u64,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    source: Option<String>,
    #[serde(default)]
    dest: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    ttl_ms: Option<u64>,
    #[serde(default)]
    sent_at: u64,
}

impl Envelope {
    fn new(kind: EnvelopeKind, source: &str) -> Self {
        Self {
            kind,
            source: source.to_string(),
            dest: None,
            correlation_id: None,
            key: None,
            payload: None,
            ttl_ms: None,
            sent_at: now_millis(),
        }
    }

    /// Capability announcement carrying `{"keys": [...], "topics": [...]}`.
    pub fn hello(source: &str, keys: &[String], topics: &[String]) -> Self {
        Self {
            payload: Some(serde_json::json!({ "keys": keys, "topics": topics })),
            ..Self::new(EnvelopeKind::Hello, source)
        }
    }

    pub fn request(
        source: &str,
        dest: &str,
        correlation_id: &str,
        key: &str,
        payload: Value,
        ttl_ms: u64,
    ) -> Self {
        Self {
            dest: Some(dest.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            key: Some(key.to_string()),
            payload: Some(payload),
            ttl_ms: Some(ttl_ms),
            ..Self::new(EnvelopeKind::Req, source)
        }
    }

    pub fn ack(source: &str, dest: &str, correlation_id: &str) -> Self {
        Self {
            dest: Some(dest.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            ..Self::new(EnvelopeKind::Ack, source)
        }
    }

    pub fn response(source: &str, dest: &str, correlation_id: &str, payload: Value) -> Self {
        Self {
            dest: Some(dest.to_string()),
            correlation_id: Some(correlation_id.to_string()),
            payload: Some(payload),
            ..Self::new(EnvelopeKind::Resp, source)
        }
    }

    pub fn publish(source: &str, topic: &str, payload: Value) -> Self {
        Self {
            key: Some(topic.to_string()),
            payload: Some(payload),
            ..Self::new(EnvelopeKind::Pub, source)
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse wire bytes and validate the fields required by the kind.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        let kind = EnvelopeKind::from_wire(&raw.kind)
            .ok_or_else(|| DecodeError::UnknownType(raw.kind.clone()))?;

        let missing = |field| DecodeError::MissingField { kind, field };
        let source = raw.source.ok_or_else(|| missing("source"))?;

        let required: Vec<(&'static str, bool)> = match kind {
            EnvelopeKind::Hello => Vec::new(),
            EnvelopeKind::Req => vec![
                ("dest", raw.dest.is_some()),
                ("correlation_id", raw.correlation_id.is_some()),
                ("key", raw.key.is_some()),
                ("ttl_ms", raw.ttl_ms.is_some()),
            ],
            EnvelopeKind::Ack | EnvelopeKind::Resp => vec![
                ("dest", raw.dest.is_some()),
                ("correlation_id", raw.correlation_id.is_some()),
            ],
            EnvelopeKind::Pub => vec![("key", raw.key.is_some())],
        };
        if let Some((field, _)) = required.into_iter().find(|(_, present)| !present) {
            return Err(missing(field));
        }

        Ok(Self {
            kind,
            source,
            dest: raw.dest,
            correlation_id: raw.correlation_id,
            key: raw.key,
            payload: raw.payload,
            ttl_ms: raw.ttl_ms,
            sent_at: raw.sent_at,
        })
    }

    /// Payload or JSON `null` when absent.
    pub fn payload_or_null(&self) -> &Value {
        static NULL: Value = Value::Null;
        self.payload.as_ref().unwrap_or(&NULL)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_wire_shape() {
        let env = Envelope::request("peer-A", "peer-B", "c-1", "math.add", json!({"a": 2}), 8000);
        let wire: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();

        assert_eq!(wire["type"], "REQ");
        assert_eq!(wire["source"], "peer-A");
        assert_eq!(wire["dest"], "peer-B");
        assert_eq!(wire["correlation_id"], "c-1");
        assert_eq!(wire["key"], "math.add");
        assert_eq!(wire["ttl_ms"], 8000);
        assert!(wire["sent_at"].as_u64().unwrap() > 0);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let env = Envelope::ack("peer-B", "peer-A", "c-1");
        let wire: Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        let obj = wire.as_object().unwrap();

        assert!(!obj.contains_key("key"));
        assert!(!obj.contains_key("payload"));
        assert!(!obj.contains_key("ttl_ms"));
    }

    #[test]
    fn decode_accepts_foreign_producers() {
        let raw = br#"{"type":"PUB","source":"py-peer","key":"alerts","payload":{"x":1},"sent_at":5,"extra":true}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Pub);
        assert_eq!(env.key.as_deref(), Some("alerts"));
        assert_eq!(env.payload_or_null()["x"], 1);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = Envelope::decode(br#"{"type":"PING","source":"a","sent_at":0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownType(t) if t == "PING"));
    }

    #[test]
    fn decode_enforces_per_kind_fields() {
        let cases: [(&[u8], &str); 4] = [
            (br#"{"type":"REQ","source":"a","dest":"b","correlation_id":"c","key":"k"}"#, "ttl_ms"),
            (br#"{"type":"RESP","source":"a","dest":"b"}"#, "correlation_id"),
            (br#"{"type":"PUB","source":"a"}"#, "key"),
            (br#"{"type":"HELLO"}"#, "source"),
        ];
        for (raw, expected) in cases {
            match Envelope::decode(raw) {
                Err(DecodeError::MissingField { field, .. }) => assert_eq!(field, expected),
                other => panic!("expected missing '{expected}', got {other:?}"),
            }
        }
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(matches!(
            Envelope::decode(b"\x00\x01garbage"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn hello_payload_lists_keys_and_topics() {
        let env = Envelope::hello("peer-A", &["perf.echo".to_string()], &["alerts".to_string()]);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload_or_null()["keys"], json!(["perf.echo"]));
        assert_eq!(decoded.payload_or_null()["topics"], json!(["alerts"]));
        assert!(decoded.dest.is_none());
    }
}
