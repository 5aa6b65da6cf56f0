//! # Task Envelope Module
//!
//! Wire model for messages pulled off the broker queue and their decoding
//! into task records.
//!
//! A frame is either raw JSON (first byte `{`) or a legacy snappy-compressed
//! JSON frame, auto-detected by [`decode_frame`]. The envelope's
//! `properties.body_encoding` then selects how the body yields the task
//! record:
//!
//! - `nested`: the body *is* the record
//! - `base64`: base64 text wrapping record JSON
//! - `snappy`: base64 text wrapping snappy-compressed record JSON
//!
//! Anything else, including a missing encoding, is a decode error; the
//! message is dropped and the loop continues.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::worker_error::WorkerError;

/// Timestamp layout of the `expires` field, after `Z` / `+offset` stripping.
pub const EXPIRES_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Grace period applied when a task carries no `expires` metadata.
pub const DEFAULT_EXPIRY_GRACE: Duration = Duration::from_secs(10);

/// Transport encodings of the envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Nested,
    Base64,
    Snappy,
}

/// A task message as pulled from the broker, before body decoding.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEnvelope {
    pub body: Value,
    #[serde(default)]
    pub properties: EnvelopeProperties,
    #[serde(default, rename = "content-type")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EnvelopeProperties {
    #[serde(default)]
    pub body_encoding: Option<BodyEncoding>,
    #[serde(default = "empty_object")]
    pub delivery_info: Value,
    /// Tracing span carried over from the scheduler
    #[serde(default)]
    pub trace: Map<String, Value>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Hard and soft time limits in seconds, `hard >= soft >= 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeLimit {
    pub hard: f64,
    pub soft: f64,
}

impl<'de> Deserialize<'de> for TimeLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let [hard, soft]: [f64; 2] = Deserialize::deserialize(deserializer)?;
        if !(soft >= 0.0 && hard >= soft) {
            return Err(serde::de::Error::custom(format!(
                "time limit [{hard}, {soft}] must satisfy hard >= soft >= 0"
            )));
        }
        Ok(TimeLimit { hard, soft })
    }
}

impl Serialize for TimeLimit {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        [self.hard, self.soft].serialize(serializer)
    }
}

/// The decoded unit of work.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRecord {
    pub task: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
    #[serde(default)]
    pub expires: Option<String>,
    #[serde(default = "default_utc")]
    pub utc: bool,
    pub timelimit: TimeLimit,
}

fn default_utc() -> bool {
    true
}

/// Metadata synthesized by the consumer and passed to handlers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskContext {
    pub queue: String,
    pub taskname: String,
    pub delivery_info: Value,
    pub task_properties: TaskContextProperties,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskContextProperties {
    pub task: String,
    pub id: String,
    pub expires: Option<String>,
    pub timelimit: TimeLimit,
    pub utc: bool,
}

impl TaskContext {
    pub fn synthesize(queue: &str, envelope: &TaskEnvelope, record: &TaskRecord) -> Self {
        Self {
            queue: queue.to_string(),
            taskname: record.task.clone(),
            delivery_info: envelope.properties.delivery_info.clone(),
            task_properties: TaskContextProperties {
                task: record.task.clone(),
                id: record.id.clone(),
                expires: record.expires.clone(),
                timelimit: record.timelimit,
                utc: record.utc,
            },
        }
    }
}

/// Decode a raw broker frame into an envelope. Frames that do not start
/// with `{` are legacy snappy-compressed JSON.
pub fn decode_frame(raw: &[u8]) -> Result<TaskEnvelope, WorkerError> {
    let text = if raw.first() == Some(&b'{') {
        String::from_utf8(raw.to_vec())
            .map_err(|e| WorkerError::decode(format!("frame is not valid utf-8: {e}")))?
    } else {
        let decompressed = snap::raw::Decoder::new()
            .decompress_vec(raw)
            .map_err(|e| WorkerError::decode(format!("snappy frame decompression failed: {e}")))?;
        String::from_utf8(decompressed)
            .map_err(|e| WorkerError::decode(format!("decompressed frame is not valid utf-8: {e}")))?
    };
    serde_json::from_str(&text)
        .map_err(|e| WorkerError::decode(format!("invalid task envelope: {e}")))
}

impl TaskEnvelope {
    /// Decode the body into a task record according to `body_encoding`.
    pub fn decode_body(&self) -> Result<TaskRecord, WorkerError> {
        let encoding = self
            .properties
            .body_encoding
            .ok_or_else(|| WorkerError::decode("envelope has no body_encoding"))?;
        let record: TaskRecord = match encoding {
            BodyEncoding::Nested => serde_json::from_value(self.body.clone())
                .map_err(|e| WorkerError::decode(format!("invalid nested body: {e}")))?,
            BodyEncoding::Base64 => {
                let bytes = self.body_bytes()?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| WorkerError::decode(format!("invalid base64 body: {e}")))?
            }
            BodyEncoding::Snappy => {
                let compressed = self.body_bytes()?;
                let bytes = snap::raw::Decoder::new()
                    .decompress_vec(&compressed)
                    .map_err(|e| WorkerError::decode(format!("snappy body failed: {e}")))?;
                serde_json::from_slice(&bytes)
                    .map_err(|e| WorkerError::decode(format!("invalid snappy body: {e}")))?
            }
        };
        Ok(record)
    }

    fn body_bytes(&self) -> Result<Vec<u8>, WorkerError> {
        let text = self
            .body
            .as_str()
            .ok_or_else(|| WorkerError::decode("encoded body must be a string"))?;
        BASE64
            .decode(text)
            .map_err(|e| WorkerError::decode(format!("invalid base64 body: {e}")))
    }
}

impl TaskRecord {
    /// The clock the expiry gate compares against, per the `utc` flag.
    pub fn current_time(&self) -> NaiveDateTime {
        if self.utc {
            Utc::now().naive_utc()
        } else {
            Local::now().naive_local()
        }
    }

    /// Effective expiry deadline: the parsed `expires` timestamp, or
    /// `now + 10s` when the task carries none.
    pub fn expiry(&self, now: NaiveDateTime) -> Result<NaiveDateTime, WorkerError> {
        match &self.expires {
            Some(raw) => parse_expires(raw),
            None => Ok(now + chrono::Duration::seconds(DEFAULT_EXPIRY_GRACE.as_secs() as i64)),
        }
    }

    /// Expiry gate: whether the task must be dropped, plus the deadline for
    /// span tagging.
    pub fn is_expired(&self, now: NaiveDateTime) -> Result<(bool, NaiveDateTime), WorkerError> {
        let deadline = self.expiry(now)?;
        Ok((now >= deadline, deadline))
    }

    /// Observability-only check id from the first positional argument:
    /// `"xx"` when the mapping has no check_id, `"XX"` when there is no
    /// leading mapping at all.
    pub fn check_id(&self) -> String {
        match self.args.first() {
            Some(Value::Object(map)) => match map.get("check_id") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => "xx".to_string(),
            },
            _ => "XX".to_string(),
        }
    }
}

fn parse_expires(raw: &str) -> Result<NaiveDateTime, WorkerError> {
    // strip trailing Z and a utc offset appended with '+'
    let cleaned = raw.replace('Z', "");
    let cleaned = match cleaned.rfind('+') {
        Some(idx) => &cleaned[..idx],
        None => cleaned.as_str(),
    };
    NaiveDateTime::parse_from_str(cleaned, EXPIRES_FORMAT)
        .map_err(|e| WorkerError::decode(format!("invalid expires timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // {"task":"cleanup","args":[],"kwargs":{},"timelimit":[90,60],
    //  "expires":"2099-01-01T00:00:00.000"}
    const BODY_2099: &str = "eyJ0YXNrIjoiY2xlYW51cCIsImFyZ3MiOltdLCJrd2FyZ3MiOnt9LCJ0aW1lbGltaXQiOls5MCw2MF0sImV4cGlyZXMiOiIyMDk5LTAxLTAxVDAwOjAwOjAwLjAwMCJ9";

    fn envelope_json(body: &str) -> String {
        format!(r#"{{"body":"{body}","properties":{{"body_encoding":"base64"}}}}"#)
    }

    #[test]
    fn base64_envelope_decodes_to_task_record() {
        let envelope = decode_frame(envelope_json(BODY_2099).as_bytes()).unwrap();
        let record = envelope.decode_body().unwrap();
        assert_eq!(record.task, "cleanup");
        assert_eq!(record.timelimit.hard, 90.0);
        assert_eq!(record.timelimit.soft, 60.0);
        assert!(record.utc, "utc defaults to true");
        let now = record.current_time();
        let (expired, _) = record.is_expired(now).unwrap();
        assert!(!expired, "2099 expiry is in the future");
    }

    #[test]
    fn past_expiry_is_detected() {
        let record: TaskRecord = serde_json::from_value(json!({
            "task": "cleanup",
            "args": [],
            "kwargs": {},
            "timelimit": [90, 60],
            "expires": "2000-01-01T00:00:00.000"
        }))
        .unwrap();
        let now = record.current_time();
        let (expired, deadline) = record.is_expired(now).unwrap();
        assert!(expired);
        assert_eq!(deadline.format("%Y").to_string(), "2000");
    }

    #[test]
    fn missing_expires_gets_ten_second_grace() {
        let record: TaskRecord = serde_json::from_value(json!({
            "task": "cleanup",
            "timelimit": [90, 60]
        }))
        .unwrap();
        let now = record.current_time();
        let deadline = record.expiry(now).unwrap();
        assert_eq!(deadline - now, chrono::Duration::seconds(10));
        let (expired, _) = record.is_expired(now).unwrap();
        assert!(!expired);
    }

    #[test]
    fn expires_accepts_offset_and_zulu_suffixes() {
        for raw in [
            "2014-09-04T10:27:32.919152+00:00",
            "2014-09-04T10:27:32.919152Z",
            "2014-09-04T10:27:32.919152",
        ] {
            let parsed = parse_expires(raw).unwrap();
            assert_eq!(parsed.format("%Y-%m-%dT%H:%M:%S").to_string(), "2014-09-04T10:27:32");
        }
    }

    #[test]
    fn snappy_body_round_trips() {
        let body = serde_json::to_vec(&json!({
            "task": "check_and_notify",
            "id": "check-277",
            "args": [{"check_id": 277}],
            "kwargs": {},
            "timelimit": [90, 60],
            "expires": "2099-01-01T00:00:00.000"
        }))
        .unwrap();
        let compressed = snap::raw::Encoder::new().compress_vec(&body).unwrap();
        let encoded = BASE64.encode(&compressed);
        let frame = format!(
            r#"{{"body":"{encoded}","properties":{{"body_encoding":"snappy"}}}}"#
        );

        let envelope = decode_frame(frame.as_bytes()).unwrap();
        let record = envelope.decode_body().unwrap();
        assert_eq!(record.task, "check_and_notify");
        assert_eq!(record.id, "check-277");
        assert_eq!(record.check_id(), "277");
    }

    #[test]
    fn compressed_frames_are_sniffed() {
        let frame_json = envelope_json(BODY_2099);
        let compressed = snap::raw::Encoder::new()
            .compress_vec(frame_json.as_bytes())
            .unwrap();
        let envelope = decode_frame(&compressed).unwrap();
        assert_eq!(envelope.decode_body().unwrap().task, "cleanup");
    }

    #[test]
    fn unknown_body_encoding_is_a_decode_error() {
        let frame = r#"{"body":"e30=","properties":{"body_encoding":"rot13"}}"#;
        let err = decode_frame(frame.as_bytes()).unwrap_err();
        assert!(matches!(err, WorkerError::Decode { .. }));
    }

    #[test]
    fn missing_body_encoding_is_a_decode_error() {
        let frame = r#"{"body":"e30=","properties":{}}"#;
        let envelope = decode_frame(frame.as_bytes()).unwrap();
        let err = envelope.decode_body().unwrap_err();
        assert!(matches!(err, WorkerError::Decode { .. }));
    }

    #[test]
    fn inverted_time_limits_are_rejected() {
        let result: Result<TaskRecord, _> = serde_json::from_value(json!({
            "task": "cleanup",
            "timelimit": [30, 60]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn nested_body_is_used_directly() {
        let frame = r#"{
            "body": {"task": "trial_run", "args": [1, 2], "kwargs": {}, "timelimit": [10, 5]},
            "properties": {"body_encoding": "nested"}
        }"#;
        let record = decode_frame(frame.as_bytes()).unwrap().decode_body().unwrap();
        assert_eq!(record.task, "trial_run");
        assert_eq!(record.args, vec![json!(1), json!(2)]);
        assert_eq!(record.check_id(), "XX", "non-mapping first arg");
    }

    #[test]
    fn task_context_carries_queue_and_properties() {
        let frame = format!(
            r#"{{"body":"{BODY_2099}","properties":{{"body_encoding":"base64","delivery_info":{{"routing_key":"default"}}}}}}"#
        );
        let envelope = decode_frame(frame.as_bytes()).unwrap();
        let record = envelope.decode_body().unwrap();
        let ctx = TaskContext::synthesize("zmon:queue:default", &envelope, &record);
        assert_eq!(ctx.queue, "zmon:queue:default");
        assert_eq!(ctx.taskname, "cleanup");
        assert_eq!(ctx.delivery_info["routing_key"], "default");
        assert_eq!(ctx.task_properties.timelimit.hard, 90.0);
        assert_eq!(ctx.task_properties.expires.as_deref(), Some("2099-01-01T00:00:00.000"));
    }
}
