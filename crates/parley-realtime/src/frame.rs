use serde_json::{json, Value};

use parley_core::errors::TransportError;

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_LEAVE: &str = "phx_leave";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_CLOSE: &str = "phx_close";
pub const HEARTBEAT: &str = "heartbeat";
pub const PHOENIX_TOPIC: &str = "phoenix";

/// A Phoenix v2 serializer frame: `[join_ref, ref, topic, event, payload]`.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn with_refs(mut self, join_ref: Option<String>, msg_ref: Option<String>) -> Self {
        self.join_ref = join_ref;
        self.msg_ref = msg_ref;
        self
    }

    pub fn heartbeat(msg_ref: String) -> Self {
        Self::new(PHOENIX_TOPIC, HEARTBEAT, json!({})).with_refs(None, Some(msg_ref))
    }

    pub fn encode(&self) -> String {
        json!([self.join_ref, self.msg_ref, self.topic, self.event, self.payload]).to_string()
    }

    pub fn decode(text: &str) -> Result<Self, TransportError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| TransportError::Encode(e.to_string()))?;
        let Value::Array(mut parts) = value else {
            return Err(TransportError::Encode("frame is not an array".into()));
        };
        if parts.len() != 5 {
            return Err(TransportError::Encode(format!(
                "frame has {} elements, expected 5",
                parts.len()
            )));
        }
        let payload = parts.pop().unwrap_or(Value::Null);
        let event = as_string(parts.pop()).ok_or_else(|| TransportError::Encode("missing event".into()))?;
        let topic = as_string(parts.pop()).ok_or_else(|| TransportError::Encode("missing topic".into()))?;
        let msg_ref = as_string(parts.pop());
        let join_ref = as_string(parts.pop());
        Ok(Self {
            join_ref,
            msg_ref,
            topic,
            event,
            payload,
        })
    }
}

fn as_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Outcome of a `phx_reply`: `{"status": "ok" | "error", "response": ...}`.
pub fn reply_result(payload: Value) -> Result<Value, String> {
    let status = payload.get("status").and_then(Value::as_str).unwrap_or("error").to_owned();
    let response = payload.get("response").cloned().unwrap_or(Value::Null);
    if status == "ok" {
        Ok(response)
    } else {
        Err(response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("{status}: {response}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout() {
        let frame = Frame::new("conversation:c1", PHX_JOIN, json!({"customer_id": "u1"}))
            .with_refs(Some("3".into()), Some("3".into()));
        assert_eq!(
            frame.encode(),
            r#"["3","3","conversation:c1","phx_join",{"customer_id":"u1"}]"#
        );
    }

    #[test]
    fn heartbeat_has_no_join_ref() {
        let encoded = Frame::heartbeat("7".into()).encode();
        assert_eq!(encoded, r#"[null,"7","phoenix","heartbeat",{}]"#);
    }

    #[test]
    fn decode_broadcast_without_refs() {
        let frame = Frame::decode(r#"[null,null,"room:a","presence_diff",{"joins":{}}]"#).unwrap();
        assert!(frame.join_ref.is_none());
        assert!(frame.msg_ref.is_none());
        assert_eq!(frame.topic, "room:a");
        assert_eq!(frame.event, "presence_diff");
    }

    #[test]
    fn decode_numeric_refs() {
        let frame = Frame::decode(r#"[1,2,"t","phx_reply",{}]"#).unwrap();
        assert_eq!(frame.join_ref.as_deref(), Some("1"));
        assert_eq!(frame.msg_ref.as_deref(), Some("2"));
    }

    #[test]
    fn decode_rejects_bad_shapes() {
        assert!(Frame::decode("{}").is_err());
        assert!(Frame::decode(r#"[null,null,"t"]"#).is_err());
        assert!(Frame::decode("not json").is_err());
    }

    #[test]
    fn reply_ok_and_error() {
        let ok = reply_result(json!({"status": "ok", "response": {"id": 1}})).unwrap();
        assert_eq!(ok["id"], 1);

        let err = reply_result(json!({"status": "error", "response": {"reason": "unauthorized"}}))
            .unwrap_err();
        assert_eq!(err, "unauthorized");
    }
}
