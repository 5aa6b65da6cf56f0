//! # Parent RPC Client Module
//!
//! The worker reports to its parent supervisor over XML-RPC. Three methods
//! are consumed: `mark_for_termination(pid)` when a task overruns its hard
//! deadline, `ping(pid, data)` for periodic liveness and throughput, and
//! `add_events(pid, events)` for batched event shipping.
//!
//! ## Wire format
//!
//! Parameters are dynamically typed values encoded as XML-RPC
//! `nil`/`boolean`/`int`/`double`/`string`/`array`/`struct`. The server side
//! supports a keyword-argument extension: a call carrying named parameters
//! appends a single trailing string parameter of the form `js:<json>`; see
//! [`serialize_kwargs`]. Named-parameter values must therefore stay within
//! JSON-serializable types.
//!
//! All calls from the reactor are best effort: failures are surfaced as
//! [`WorkerError::Rpc`] and recorded as reactor events, never propagated to
//! the action loop's caller.

use std::fmt::Write as _;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::worker_error::WorkerError;

/// Liveness and throughput report shipped with every ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingData {
    /// Unix timestamp of the flush
    pub timestamp: f64,
    /// Seconds covered by this report
    pub timedelta: f64,
    pub tasks_done: u64,
    pub percent_idle: f64,
    /// Summed wall-clock seconds spent in completed tasks
    pub task_duration: f64,
}

/// Event classes understood by the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Action,
    Error,
    Info,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            EventKind::Action => "ACTION",
            EventKind::Error => "ERROR",
            EventKind::Info => "INFO",
        };
        f.write_str(text)
    }
}

/// A buffered worker event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub origin: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub body: String,
    /// Unix timestamp of the latest occurrence
    pub timestamp: f64,
    pub repeats: u64,
}

/// RPC surface the worker consumes from its parent.
#[async_trait]
pub trait WorkerRpc: Send + Sync {
    async fn mark_for_termination(&self, pid: u32) -> Result<(), WorkerError>;
    async fn ping(&self, pid: u32, data: PingData) -> Result<(), WorkerError>;
    async fn add_events(&self, pid: u32, events: Vec<EventRecord>) -> Result<(), WorkerError>;
}

/// XML-RPC client over HTTP.
pub struct XmlRpcClient {
    endpoint: String,
    http: reqwest::Client,
}

impl XmlRpcClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Call `method` with positional parameters.
    pub async fn call(&self, method: &str, params: &[Value]) -> Result<(), WorkerError> {
        let body = encode_call(method, params);
        let response = self
            .http
            .post(&self.endpoint)
            .header("content-type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| WorkerError::rpc(method, e.to_string()))?
            .error_for_status()
            .map_err(|e| WorkerError::rpc(method, e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| WorkerError::rpc(method, e.to_string()))?;
        check_response(method, &text)
    }

    /// Call `method` with positional parameters plus named parameters
    /// carried through the `js:<json>` bridge.
    pub async fn call_with_kwargs(
        &self,
        method: &str,
        params: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<(), WorkerError> {
        let mut params = params.to_vec();
        if !kwargs.is_empty() {
            params.push(Value::String(serialize_kwargs(kwargs)));
        }
        self.call(method, &params).await
    }
}

#[async_trait]
impl WorkerRpc for XmlRpcClient {
    async fn mark_for_termination(&self, pid: u32) -> Result<(), WorkerError> {
        self.call("mark_for_termination", &[Value::from(pid)]).await
    }

    async fn ping(&self, pid: u32, data: PingData) -> Result<(), WorkerError> {
        let data = serde_json::to_value(&data)?;
        self.call("ping", &[Value::from(pid), data]).await
    }

    async fn add_events(&self, pid: u32, events: Vec<EventRecord>) -> Result<(), WorkerError> {
        let events = serde_json::to_value(&events)?;
        self.call("add_events", &[Value::from(pid), events]).await
    }
}

/// Named parameters travel as one trailing string argument: `js:<json>`.
pub fn serialize_kwargs(kwargs: &Map<String, Value>) -> String {
    if kwargs.is_empty() {
        String::new()
    } else {
        format!("js:{}", Value::Object(kwargs.clone()))
    }
}

fn encode_call(method: &str, params: &[Value]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\"?><methodCall>");
    let _ = write!(xml, "<methodName>{}</methodName><params>", escape(method));
    for param in params {
        xml.push_str("<param>");
        encode_value(&mut xml, param);
        xml.push_str("</param>");
    }
    xml.push_str("</params></methodCall>");
    xml
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Null => out.push_str("<nil/>"),
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                let _ = write!(out, "<int>{i}</int>");
            } else {
                let _ = write!(out, "<double>{}</double>", n.as_f64().unwrap_or(f64::NAN));
            }
        }
        Value::String(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s));
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Object(map) => {
            out.push_str("<struct>");
            for (key, item) in map {
                let _ = write!(out, "<member><name>{}</name>", escape(key));
                encode_value(out, item);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Reject method responses carrying a `<fault>`, surfacing the fault text.
fn check_response(method: &str, xml: &str) -> Result<(), WorkerError> {
    let mut reader = Reader::from_str(xml);
    let mut in_fault = false;
    let mut fault_text = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.name().as_ref() == b"fault" => in_fault = true,
            Ok(Event::End(e)) if e.name().as_ref() == b"fault" => in_fault = false,
            Ok(Event::Text(t)) if in_fault => {
                if let Ok(text) = t.unescape() {
                    let text = text.trim();
                    if !text.is_empty() {
                        if !fault_text.is_empty() {
                            fault_text.push(' ');
                        }
                        fault_text.push_str(text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(WorkerError::rpc(
                    method,
                    format!("unparsable RPC response: {e}"),
                ))
            }
            _ => {}
        }
    }
    if fault_text.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::rpc(method, format!("fault: {fault_text}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_scalars_arrays_and_structs() {
        let xml = encode_call(
            "ping",
            &[
                json!(4711),
                json!({"timestamp": 1.5, "tasks_done": 3, "note": "a<b"}),
                json!([true, Value::Null]),
            ],
        );
        assert!(xml.starts_with("<?xml version=\"1.0\"?><methodCall><methodName>ping</methodName>"));
        assert!(xml.contains("<value><int>4711</int></value>"));
        assert!(xml.contains("<member><name>timestamp</name><value><double>1.5</double></value></member>"));
        assert!(xml.contains("<member><name>tasks_done</name><value><int>3</int></value></member>"));
        assert!(xml.contains("<member><name>note</name><value><string>a&lt;b</string></value></member>"));
        assert!(xml.contains("<array><data><value><boolean>1</boolean></value><value><nil/></value></data></array>"));
    }

    #[test]
    fn kwargs_bridge_serializes_as_trailing_js_string() {
        let mut kwargs = Map::new();
        kwargs.insert("age".to_string(), json!(12));
        kwargs.insert("name".to_string(), json!("Peter Pan"));
        let serialized = serialize_kwargs(&kwargs);
        assert!(serialized.starts_with("js:"));
        let parsed: Value = serde_json::from_str(&serialized[3..]).unwrap();
        assert_eq!(parsed, json!({"age": 12, "name": "Peter Pan"}));
        assert_eq!(serialize_kwargs(&Map::new()), "");
    }

    #[test]
    fn fault_responses_are_errors() {
        let xml = r#"<?xml version="1.0"?>
            <methodResponse><fault><value><struct>
                <member><name>faultCode</name><value><int>1</int></value></member>
                <member><name>faultString</name><value><string>no such method</string></value></member>
            </struct></value></fault></methodResponse>"#;
        let err = check_response("nope", xml).unwrap_err();
        assert!(err.to_string().contains("no such method"));
    }

    #[test]
    fn ok_responses_pass() {
        let xml = r#"<?xml version="1.0"?>
            <methodResponse><params><param><value><boolean>1</boolean></value></param></params></methodResponse>"#;
        check_response("ping", xml).unwrap();
    }

    #[test]
    fn event_kind_round_trips_uppercase() {
        assert_eq!(serde_json::to_value(EventKind::Action).unwrap(), json!("ACTION"));
        assert_eq!(EventKind::Error.to_string(), "ERROR");
        let kind: EventKind = serde_json::from_value(json!("INFO")).unwrap();
        assert_eq!(kind, EventKind::Info);
    }
}
