//! Typed message envelopes
//!
//! Every protocol message travels as a [`Frame`]: `{"type": <string>, "data": <any>}`
//! serialized as JSON text. Both fields are required on the wire; `data` may be `null`.
//!
//! [`FrameHandler`] dispatches frames by type to at most one callback each,
//! with an optional fallback for unmatched types.

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A typed, multiplexed message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: Value,
}

impl Frame {
    pub fn new(frame_type: impl Into<String>, data: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            data,
        }
    }

    /// Build a frame from any serializable payload
    pub fn encode<T: Serialize>(frame_type: impl Into<String>, data: &T) -> Result<Self> {
        Ok(Self::new(frame_type, serde_json::to_value(data)?))
    }

    /// Decode the payload into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::MalformedFrame(format!("bad '{}' payload: {}", self.frame_type, e))
        })
    }

    /// Serialize to wire text
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse wire text, requiring both `type` and `data`
    pub fn deserialize(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::MalformedFrame(format!("invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Convert an already-parsed JSON value into a frame
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::MalformedFrame("frame is not an object".into()));
        };

        let frame_type = match map.remove("type") {
            Some(Value::String(t)) => t,
            Some(_) => return Err(Error::MalformedFrame("'type' is not a string".into())),
            None => return Err(Error::MalformedFrame("missing 'type'".into())),
        };
        let data = map
            .remove("data")
            .ok_or_else(|| Error::MalformedFrame(format!("'{}' frame missing 'data'", frame_type)))?;

        Ok(Self { frame_type, data })
    }
}

type Callback<C, E> = Box<dyn FnMut(&mut C, Value) -> std::result::Result<(), E> + Send>;
type Fallback<C, E> = Box<dyn FnMut(&mut C, Frame) -> std::result::Result<(), E> + Send>;

/// Type-keyed frame dispatcher
///
/// Registering two callbacks for the same type is a programmer error and
/// fails immediately. `handle` returns `Ok(false)` when nothing matched and
/// no fallback exists; whether that is an error is up to the call site.
///
/// Callbacks may fail with any error type that core errors convert into,
/// so transport layers can dispatch with their own `Result`.
pub struct FrameHandler<C, E = Error> {
    callbacks: HashMap<String, Callback<C, E>>,
    fallback: Option<Fallback<C, E>>,
}

impl<C, E> FrameHandler<C, E>
where
    C: 'static,
    E: From<Error> + 'static,
{
    pub fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
            fallback: None,
        }
    }

    /// Register the callback for one frame type, decoding `data` into `T`
    pub fn on<T, F>(&mut self, frame_type: &str, mut callback: F) -> Result<()>
    where
        T: DeserializeOwned + 'static,
        F: FnMut(&mut C, T) -> std::result::Result<(), E> + Send + 'static,
    {
        if self.callbacks.contains_key(frame_type) {
            return Err(Error::DuplicateHandler(frame_type.to_string()));
        }

        let name = frame_type.to_string();
        self.callbacks.insert(
            frame_type.to_string(),
            Box::new(move |ctx, data| {
                let payload = serde_json::from_value(data).map_err(|e| {
                    E::from(Error::MalformedFrame(format!("bad '{}' payload: {}", name, e)))
                })?;
                callback(ctx, payload)
            }),
        );
        Ok(())
    }

    /// Register the callback for frames no other callback matches
    pub fn on_else<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut(&mut C, Frame) -> std::result::Result<(), E> + Send + 'static,
    {
        if self.fallback.is_some() {
            return Err(Error::DuplicateHandler("<else>".into()));
        }
        self.fallback = Some(Box::new(callback));
        Ok(())
    }

    /// Dispatch a frame. Returns whether any callback ran.
    pub fn handle(&mut self, ctx: &mut C, frame: Frame) -> std::result::Result<bool, E> {
        if let Some(callback) = self.callbacks.get_mut(&frame.frame_type) {
            callback(ctx, frame.data)?;
            return Ok(true);
        }
        match self.fallback.as_mut() {
            Some(fallback) => {
                fallback(ctx, frame)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispatch a frame, treating an unmatched type as a protocol error
    pub fn handle_strict(&mut self, ctx: &mut C, frame: Frame) -> std::result::Result<(), E> {
        let frame_type = frame.frame_type.clone();
        if self.handle(ctx, frame)? {
            Ok(())
        } else {
            Err(E::from(Error::UnhandledFrame(frame_type)))
        }
    }
}

impl<C, E> Default for FrameHandler<C, E>
where
    C: 'static,
    E: From<Error> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<C, E> fmt::Debug for FrameHandler<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.callbacks.keys().collect();
        types.sort();
        f.debug_struct("FrameHandler")
            .field("types", &types)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new("update", json!({"clock": 3, "data": [1, 2]}));
        let text = frame.serialize().unwrap();
        assert_eq!(Frame::deserialize(&text).unwrap(), frame);
    }

    #[test]
    fn test_null_data_is_present() {
        let frame = Frame::deserialize(r#"{"type":"meet","data":null}"#).unwrap();
        assert_eq!(frame.frame_type, "meet");
        assert!(frame.data.is_null());
    }

    #[test]
    fn test_missing_fields_rejected() {
        assert!(matches!(
            Frame::deserialize(r#"{"data":1}"#),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::deserialize(r#"{"type":"x"}"#),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::deserialize(r#"{"type":5,"data":1}"#),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::deserialize("[1,2]"),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(
            Frame::deserialize("not json"),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_dispatch_by_type() {
        let mut handler: FrameHandler<Vec<String>> = FrameHandler::new();
        handler
            .on("greet", |seen: &mut Vec<String>, name: String| {
                seen.push(format!("hello {}", name));
                Ok(())
            })
            .unwrap();

        let mut seen = Vec::new();
        assert!(handler
            .handle(&mut seen, Frame::new("greet", json!("bob")))
            .unwrap());
        assert!(!handler
            .handle(&mut seen, Frame::new("other", json!(null)))
            .unwrap());
        assert_eq!(seen, vec!["hello bob"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut handler: FrameHandler<()> = FrameHandler::new();
        handler.on("a", |_, _: Value| Ok(())).unwrap();
        assert!(matches!(
            handler.on("a", |_, _: Value| Ok(())),
            Err(Error::DuplicateHandler(t)) if t == "a"
        ));

        handler.on_else(|_, _| Ok(())).unwrap();
        assert!(handler.on_else(|_, _| Ok(())).is_err());
    }

    #[test]
    fn test_fallback_receives_unmatched() {
        let mut handler: FrameHandler<Vec<String>> = FrameHandler::new();
        handler.on("known", |_, _: Value| Ok(())).unwrap();
        handler
            .on_else(|seen: &mut Vec<String>, frame| {
                seen.push(frame.frame_type);
                Ok(())
            })
            .unwrap();

        let mut seen = Vec::new();
        handler
            .handle(&mut seen, Frame::new("mystery", json!(1)))
            .unwrap();
        assert_eq!(seen, vec!["mystery"]);
    }

    #[test]
    fn test_strict_dispatch_errors_on_unmatched() {
        let mut handler: FrameHandler<()> = FrameHandler::new();
        let result = handler.handle_strict(&mut (), Frame::new("nope", json!(null)));
        assert!(matches!(result, Err(Error::UnhandledFrame(t)) if t == "nope"));
    }

    #[test]
    fn test_bad_payload_is_malformed() {
        let mut handler: FrameHandler<()> = FrameHandler::new();
        handler.on("count", |_, _: u64| Ok(())).unwrap();
        let result = handler.handle(&mut (), Frame::new("count", json!("three")));
        assert!(matches!(result, Err(Error::MalformedFrame(_))));
    }
}
