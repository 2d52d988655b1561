use serde_json::{Map, Value};
use thiserror::Error;

use crate::kafka::types::Partition;
use crate::source::SourceMessage;

/// A schema-less JSON object read from the queue, together with the
/// coordinates it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    fields: Map<String, Value>,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("message has no payload")]
    EmptyPayload,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

impl RecordError {
    /// Label used when counting dropped records
    pub fn reason(&self) -> &'static str {
        match self {
            RecordError::EmptyPayload => "empty_payload",
            RecordError::InvalidJson(_) => "invalid_json",
            RecordError::NotAnObject(_) => "not_an_object",
        }
    }
}

impl Record {
    pub fn new(partition: Partition, offset: i64, fields: Map<String, Value>) -> Self {
        Self {
            partition,
            offset,
            fields,
        }
    }

    pub fn from_message(message: &SourceMessage) -> Result<Self, RecordError> {
        let payload = match message.payload.as_deref() {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Err(RecordError::EmptyPayload),
        };

        match serde_json::from_slice::<Value>(payload)? {
            Value::Object(fields) => Ok(Self::new(
                message.partition.clone(),
                message.offset,
                fields,
            )),
            other => Err(RecordError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(payload: Option<&[u8]>) -> SourceMessage {
        SourceMessage::new(
            Partition::new("events", 3),
            42,
            payload.map(<[u8]>::to_vec),
        )
    }

    #[test]
    fn parses_object_payload() {
        let payload = br#"{"id": 1, "user": {"name": "a"}}"#;
        let record = Record::from_message(&message(Some(payload.as_slice()))).unwrap();

        assert_eq!(record.partition(), &Partition::new("events", 3));
        assert_eq!(record.offset(), 42);
        assert_eq!(record.fields().get("id"), Some(&json!(1)));
        assert_eq!(record.fields().get("user"), Some(&json!({"name": "a"})));
    }

    #[test]
    fn empty_object_is_a_record() {
        let record = Record::from_message(&message(Some(b"{}".as_slice()))).unwrap();
        assert!(record.fields().is_empty());
    }

    #[test]
    fn rejects_missing_or_empty_payload() {
        assert!(matches!(
            Record::from_message(&message(None)),
            Err(RecordError::EmptyPayload)
        ));
        assert!(matches!(
            Record::from_message(&message(Some(b"".as_slice()))),
            Err(RecordError::EmptyPayload)
        ));
    }

    #[test]
    fn rejects_invalid_json() {
        let err = Record::from_message(&message(Some(b"{not json".as_slice()))).unwrap_err();
        assert_eq!(err.reason(), "invalid_json");
    }

    #[test]
    fn rejects_non_object_json() {
        let err = Record::from_message(&message(Some(b"[1, 2]".as_slice()))).unwrap_err();
        assert!(matches!(err, RecordError::NotAnObject("array")));

        let err = Record::from_message(&message(Some(b"17".as_slice()))).unwrap_err();
        assert!(matches!(err, RecordError::NotAnObject("number")));
    }
}
