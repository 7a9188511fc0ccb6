//! MQTT payload → [`ValidationEvent`] translation.
//!
//! Accepted payloads: one canonical event, a JSON array of events, a batch
//! envelope `{ "batchId", "events" }`, or a first-generation PascalCase event.
//! A topic of the form `<prefix>/<equipmentId>` overrides the equipment id of
//! every event in the payload.

use abstractgateway::{BatchEnvelope, BatchError, LegacyValidationEvent, ValidationEvent};
use serde_json::{Map, Value};

use crate::downstreaminterface::MqttMessage;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("payload is not UTF-8")]
    NotUtf8,

    #[error("payload is not a validation event: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("expected a JSON object or array")]
    Shape,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// First topic level; the second one, if any, is the equipment id.
    pub topic_prefix: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "validations".into(),
        }
    }
}

pub trait UpstreamInterface: Send + Sync {
    fn decode_events(&self, msg: &MqttMessage) -> Result<Vec<ValidationEvent>, DecodeError>;
}

enum Shape {
    Many,
    Envelope,
    Legacy,
    Canonical,
}

fn shape_of(value: &Value) -> Option<Shape> {
    match value {
        Value::Array(_) => Some(Shape::Many),
        Value::Object(map) if map.contains_key("events") => Some(Shape::Envelope),
        Value::Object(map) if is_legacy(map) => Some(Shape::Legacy),
        Value::Object(_) => Some(Shape::Canonical),
        _ => None,
    }
}

fn is_legacy(map: &Map<String, Value>) -> bool {
    map.contains_key("CardId") || map.contains_key("EquipmentId")
}

fn decode_single(value: Value) -> Result<ValidationEvent, DecodeError> {
    match shape_of(&value) {
        Some(Shape::Legacy) => Ok(serde_json::from_value::<LegacyValidationEvent>(value)?.into()),
        Some(Shape::Canonical) => Ok(serde_json::from_value(value)?),
        _ => Err(DecodeError::Shape),
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefaultUpstream {
    cfg: UpstreamConfig,
}

impl DefaultUpstream {
    pub fn new(cfg: UpstreamConfig) -> Self {
        Self { cfg }
    }

    /// `validations/EQ-1` → `EQ-1`; `validations` or `validations/` → none.
    pub fn equipment_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.cfg.topic_prefix.as_str())?.strip_prefix('/')?;
        rest.split('/').next().filter(|s| !s.is_empty())
    }

    fn decode_value(&self, value: Value) -> Result<Vec<ValidationEvent>, DecodeError> {
        match shape_of(&value) {
            Some(Shape::Envelope) => {
                let envelope: BatchEnvelope = serde_json::from_value(value)?;
                Ok(envelope.into_batch()?.into_events())
            }
            Some(Shape::Many) => {
                let Value::Array(items) = value else {
                    return Err(DecodeError::Shape);
                };
                let events = items
                    .into_iter()
                    .map(decode_single)
                    .collect::<Result<Vec<_>, _>>()?;
                // arrays obey the same limit as envelopes
                Ok(BatchEnvelope { batch_id: None, events }.into_batch()?.into_events())
            }
            Some(Shape::Legacy) | Some(Shape::Canonical) => Ok(vec![decode_single(value)?]),
            None => Err(DecodeError::Shape),
        }
    }
}

impl UpstreamInterface for DefaultUpstream {
    fn decode_events(&self, msg: &MqttMessage) -> Result<Vec<ValidationEvent>, DecodeError> {
        let text = std::str::from_utf8(&msg.payload).map_err(|_| DecodeError::NotUtf8)?;
        let value: Value = serde_json::from_str(text)?;
        let mut events = self.decode_value(value)?;

        if let Some(equipment_id) = self.equipment_from_topic(&msg.topic) {
            for evt in &mut events {
                if evt.equipment_id != equipment_id {
                    evt.equipment_id = equipment_id.to_string();
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abstractgateway::MAX_BATCH_SIZE;

    const CANONICAL: &str = r#"{
        "equipmentId": "EQ-000001",
        "tokenId": "TOKEN-1",
        "timestamp": "2026-10-19T08:00:00Z",
        "location": "STATION-NORD",
        "amount": 2.5,
        "type": "validation",
        "status": "success",
        "sequence": 3,
        "sessionId": "SESSION-1"
    }"#;

    const LEGACY: &str = r#"{
        "EquipmentId": "EQ-000009",
        "CardId": "CARD-1",
        "Timestamp": "2026-10-19T08:00:00Z",
        "Location": "STATION-SUD",
        "Amount": 1.9,
        "Result": "Failure"
    }"#;

    fn msg(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage { topic: topic.into(), payload: payload.as_bytes().to_vec() }
    }

    fn decode(topic: &str, payload: &str) -> Result<Vec<ValidationEvent>, DecodeError> {
        DefaultUpstream::default().decode_events(&msg(topic, payload))
    }

    #[test]
    fn canonical_event() {
        let events = decode("validations", CANONICAL).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].equipment_id, "EQ-000001");
        assert_eq!(events[0].amount.minor_units(), 250);
        assert_eq!(events[0].message_id(), "EQ-000001_3");
    }

    #[test]
    fn legacy_event_is_converted() {
        let events = decode("validations", LEGACY).unwrap();
        assert_eq!(events[0].token_id, "CARD-1");
        assert_eq!(events[0].status, "failure");
        assert_eq!(events[0].location, "STATION-SUD");
    }

    #[test]
    fn simulator_payload_with_numeric_result() {
        let raw = r#"{"EquipmentId":"EQ-1","CardId":"C-9","Timestamp":"2026-10-19T08:00:00.1234567Z","Location":"STATION-EST","Amount":1.75,"Result":1,"Sequence":4,"SessionId":"S-1"}"#;
        let events = decode("validations/EQ-1", raw).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, "failure");
        assert_eq!(events[0].message_id(), "EQ-1_4");
    }

    #[test]
    fn topic_overrides_equipment_id() {
        let events = decode("validations/EQ-777", CANONICAL).unwrap();
        assert_eq!(events[0].equipment_id, "EQ-777");
        let events = decode("validations/", CANONICAL).unwrap();
        assert_eq!(events[0].equipment_id, "EQ-000001");
    }

    #[test]
    fn arrays_and_envelopes() {
        let array = format!("[{CANONICAL}, {LEGACY}]");
        let events = decode("validations/EQ-5", &array).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.equipment_id == "EQ-5"));

        let envelope = format!(r#"{{"batchId": "b-1", "events": [{CANONICAL}, {CANONICAL}]}}"#);
        assert_eq!(decode("validations", &envelope).unwrap().len(), 2);
    }

    #[test]
    fn oversized_batches_are_rejected() {
        let items = vec![CANONICAL; MAX_BATCH_SIZE + 1].join(",");
        let err = decode("validations", &format!("[{items}]")).unwrap_err();
        assert!(matches!(err, DecodeError::Batch(BatchError::TooLarge { .. })));
        let err = decode("validations", &format!(r#"{{"events": [{items}]}}"#)).unwrap_err();
        assert!(matches!(err, DecodeError::Batch(_)));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(matches!(decode("validations", "not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode("validations", "42"), Err(DecodeError::Shape)));
        assert!(matches!(decode("validations", r#"{"tokenId": "x"}"#), Err(DecodeError::Json(_))));
        let bad = MqttMessage { topic: "validations".into(), payload: vec![0xff, 0xfe] };
        assert!(matches!(DefaultUpstream::default().decode_events(&bad), Err(DecodeError::NotUtf8)));
    }
}
