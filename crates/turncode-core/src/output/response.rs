//! Reading a canonical [`AgentResponse`] out of parsed output.
//!
//! Implements tolerant reader pattern: unknown fields ignored, a few legacy
//! field names accepted.

use serde_json::Value;

use super::types::{AgentResponse, ParsedOutput, ResultSubtype, Usage};
use crate::error::{Error, Result};

const SESSION_FIELDS: [&str; 3] = ["session_id", "sessionId", "sid"];
const RESULT_FIELDS: [&str; 5] = ["result", "message", "response", "output", "text"];

impl AgentResponse {
    /// Build a response from parsed output.
    ///
    /// The last `result` record wins. A lone object without a `type` field is
    /// read as the result itself. Streams and message arrays that end before
    /// a `result` record yield [`Error::Incomplete`].
    pub fn from_parsed(parsed: &ParsedOutput) -> Result<Self> {
        let records = parsed.records();

        let result_record = records
            .iter()
            .rev()
            .find(|r| record_type(r) == Some("result"))
            .copied();

        let record = match (result_record, parsed) {
            (Some(record), _) => record,
            (None, ParsedOutput::Single(value)) if value.is_object() && record_type(value).is_none() => {
                value
            }
            (None, _) => {
                return Err(Error::Incomplete(format!(
                    "{} record(s) but no result record",
                    records.len()
                )));
            }
        };

        let session_id = first_string(record, &SESSION_FIELDS).or_else(|| {
            records
                .iter()
                .find(|r| record_type(r) == Some("system"))
                .and_then(|r| first_string(r, &SESSION_FIELDS))
        });
        let result = first_string(record, &RESULT_FIELDS);

        if session_id.is_none() && result.is_none() {
            return Err(Error::Protocol(
                "result record has neither a session id nor result text".to_string(),
            ));
        }

        let subtype = ResultSubtype::from_wire(record.get("subtype").and_then(Value::as_str));
        let is_error = record
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| subtype.is_error());

        Ok(Self {
            result: result.unwrap_or_default(),
            session_id,
            is_error,
            subtype,
            duration_ms: record.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
            duration_api_ms: record
                .get("duration_api_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            num_turns: record
                .get("num_turns")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            cost_usd: record
                .get("total_cost_usd")
                .or_else(|| record.get("cost_usd"))
                .and_then(Value::as_f64),
            usage: parse_usage(record.get("usage")),
        })
    }
}

impl ParsedOutput {
    /// First session token announced anywhere in the output.
    ///
    /// Used on partial output (a killed stream) where no result record exists
    /// yet but the `system` init record already named the session.
    pub fn session_id(&self) -> Option<String> {
        self.records()
            .into_iter()
            .find_map(|r| first_string(r, &SESSION_FIELDS))
    }
}

fn record_type(record: &Value) -> Option<&str> {
    record.get("type").and_then(Value::as_str)
}

/// First non-empty string among `fields`.
fn first_string(record: &Value, fields: &[&str]) -> Option<String> {
    fields
        .iter()
        .filter_map(|f| record.get(*f).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(String::from)
}

fn parse_usage(val: Option<&Value>) -> Usage {
    val.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::output::parse;

    fn response(raw: &str) -> Result<AgentResponse> {
        AgentResponse::from_parsed(&parse(raw).unwrap())
    }

    #[test]
    fn json_result_record() {
        let raw = r#"{"type":"result","subtype":"success","is_error":false,"duration_ms":2140,"duration_api_ms":1980,"num_turns":1,"result":"X is 42","session_id":"0b6e","total_cost_usd":0.0123,"usage":{"input_tokens":12,"output_tokens":7,"cache_read_input_tokens":3}}"#;
        let resp = response(raw).unwrap();
        assert_eq!(resp.result, "X is 42");
        assert_eq!(resp.session_id.as_deref(), Some("0b6e"));
        assert!(!resp.is_error);
        assert_eq!(resp.subtype, ResultSubtype::Success);
        assert_eq!(resp.duration_ms, 2140);
        assert_eq!(resp.duration_api_ms, 1980);
        assert_eq!(resp.num_turns, 1);
        assert_eq!(resp.cost_usd, Some(0.0123));
        assert_eq!(resp.usage.input_tokens, 12);
        assert_eq!(resp.usage.output_tokens, 7);
        assert_eq!(resp.usage.cache_read_input_tokens, 3);
    }

    #[test]
    fn stream_uses_last_result_record() {
        let raw = concat!(
            r#"{"type":"system","subtype":"init","session_id":"s9","model":"m"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]}}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"final","session_id":"s9"}"#,
            "\n",
        );
        let resp = response(raw).unwrap();
        assert_eq!(resp.result, "final");
        assert_eq!(resp.session_id.as_deref(), Some("s9"));
    }

    #[test]
    fn stream_without_result_is_incomplete() {
        let raw = concat!(
            r#"{"type":"system","subtype":"init","session_id":"s9"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[]}}"#,
            "\n",
        );
        assert!(matches!(response(raw), Err(Error::Incomplete(_))));
    }

    #[test]
    fn session_falls_back_to_init_record() {
        let raw = r#"[{"type":"system","session_id":"from-init"},{"type":"result","result":"ok"}]"#;
        let resp = response(raw).unwrap();
        assert_eq!(resp.session_id.as_deref(), Some("from-init"));
    }

    #[test]
    fn legacy_field_names_are_accepted() {
        let resp = response(r#"{"sessionId":"legacy","output":"text here","cost_usd":0.5}"#).unwrap();
        assert_eq!(resp.session_id.as_deref(), Some("legacy"));
        assert_eq!(resp.result, "text here");
        assert_eq!(resp.cost_usd, Some(0.5));
    }

    #[test]
    fn error_subtype_without_result_text() {
        let resp = response(
            r#"{"type":"result","subtype":"error_max_turns","session_id":"s","num_turns":10}"#,
        )
        .unwrap();
        assert!(resp.is_error);
        assert_eq!(resp.subtype, ResultSubtype::ErrorMaxTurns);
        assert!(resp.result.is_empty());
    }

    #[test]
    fn object_without_session_or_result_is_protocol_error() {
        assert!(matches!(
            response(r#"{"status":"weird"}"#),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn partial_stream_still_names_its_session() {
        let raw = concat!(
            r#"{"type":"system","subtype":"init","session_id":"early"}"#,
            "\n",
            r#"{"type":"assistant","message":{"content":[]}}"#,
            "\n",
        );
        assert_eq!(parse(raw).unwrap().session_id().as_deref(), Some("early"));
    }

    #[test]
    fn non_string_message_is_not_result_text() {
        let resp = response(r#"{"session_id":"s","message":{"role":"assistant"}}"#).unwrap();
        assert!(resp.result.is_empty());
    }
}
