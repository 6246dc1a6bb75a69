//! Signaling relay message types
//!
//! All messages are JSON-serialized and length-prefixed on the wire.
//! A client registers its endpoint id once, then forwards opaque payloads
//! to other registered ids; the relay delivers them tagged with the sender.

use peermesh_core::EndpointId;
use serde::{Deserialize, Serialize};

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayMessage {
    /// Client announces the id it receives under
    Register { id: EndpointId },

    /// Client asks the relay to pass `payload` to `to`
    Forward { to: EndpointId, payload: String },

    /// Relay hands a forwarded payload to its destination
    Deliver { from: EndpointId, payload: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let msg = RelayMessage::Forward {
            to: EndpointId::from("b"),
            payload: "x".into(),
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "forward");
        assert_eq!(value["to"], "b");

        let decoded: RelayMessage =
            serde_json::from_str(r#"{"type":"deliver","from":"a","payload":"p"}"#).unwrap();
        assert_eq!(
            decoded,
            RelayMessage::Deliver {
                from: EndpointId::from("a"),
                payload: "p".into()
            }
        );
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(serde_json::from_str::<RelayMessage>(r#"{"type":"shout"}"#).is_err());
    }
}
