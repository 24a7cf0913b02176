//! Inbound control messages from the host page.

use serde::Deserialize;
use serde_json::Value;

/// The only message shape the worker acts on is `{ "type": "SKIP_WAITING" }`.
/// Extra fields are tolerated; anything else is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl ControlMessage {
    pub fn parse(value: &Value) -> Option<Self> {
        // Tagged enums also deserialize from `[tag, ..]`; only objects count
        if !value.is_object() {
            return None;
        }
        Self::deserialize(value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_skip_waiting() {
        assert_eq!(
            ControlMessage::parse(&json!({"type": "SKIP_WAITING"})),
            Some(ControlMessage::SkipWaiting)
        );
        assert_eq!(
            ControlMessage::parse(&json!({"type": "SKIP_WAITING", "from": "update-banner"})),
            Some(ControlMessage::SkipWaiting)
        );
    }

    #[test]
    fn test_parse_ignores_other_shapes() {
        for value in [
            json!({"type": "skip_waiting"}),
            json!({"type": "CLAIM"}),
            json!({"kind": "SKIP_WAITING"}),
            json!("SKIP_WAITING"),
            json!(null),
            json!([{"type": "SKIP_WAITING"}]),
            json!(["SKIP_WAITING"]),
            json!(["SKIP_WAITING", "now"]),
        ] {
            assert_eq!(ControlMessage::parse(&value), None, "{}", value);
        }
    }
}
