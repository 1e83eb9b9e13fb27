//! Per-step HTTP response record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Response captured from one outbound step, or synthesized in place of one.
///
/// The final job response is selected from these by the deferred's priority
/// rule once the operation queue drains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub code: u16,
    #[serde(default)]
    pub content_type: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    /// Round-trip time in milliseconds.
    #[serde(default)]
    pub rtt: u64,
    /// Parsed body, present after `parse()` on a JSON response.
    #[serde(skip)]
    pub json: Option<serde_json::Value>,
}

impl StepResponse {
    /// Build from the parts an HTTP client reports.
    #[must_use]
    pub fn new(
        code: u16,
        content_type: String,
        headers: BTreeMap<String, String>,
        body: String,
        rtt: u64,
    ) -> Self {
        Self { code, content_type, headers, body, rtt, json: None }
    }

    /// Synthesized `504 Gateway Timeout` for a transport deadline.
    #[must_use]
    pub fn gateway_timeout(message: &str) -> Self {
        Self::synthesized(504, message)
    }

    /// Synthesized `500 Internal Server Error` for a transport or internal
    /// failure.
    #[must_use]
    pub fn internal_error(message: &str) -> Self {
        Self::synthesized(500, message)
    }

    fn synthesized(code: u16, message: &str) -> Self {
        let body = serde_json::json!({ "error": message }).to_string();
        Self {
            code,
            content_type: "application/json".to_string(),
            headers: BTreeMap::new(),
            body,
            rtt: 0,
            json: None,
        }
    }

    /// True when the content type announces a JSON body.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.content_type.trim_start().starts_with("application/json")
    }

    /// Parse the body as JSON, caching the value. Not an error for non-JSON
    /// bodies; `json` simply stays `None`.
    pub fn parse(&mut self) {
        if self.json.is_none() && self.is_json() {
            self.json = serde_json::from_str(&self.body).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_caches_json_bodies() {
        let mut response = StepResponse::new(
            200,
            "application/json; charset=utf-8".into(),
            BTreeMap::new(),
            r#"{"u":1}"#.into(),
            12,
        );
        assert!(response.is_json());
        response.parse();
        assert_eq!(response.json.as_ref().unwrap()["u"], 1);
    }

    #[test]
    fn parse_leaves_non_json_alone() {
        let mut response =
            StepResponse::new(200, "text/plain".into(), BTreeMap::new(), "hi".into(), 1);
        response.parse();
        assert!(response.json.is_none());
    }

    #[test]
    fn synthesized_responses_carry_json_error() {
        let response = StepResponse::gateway_timeout("operation timed out");
        assert_eq!(response.code, 504);
        let value: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(value["error"], "operation timed out");
    }
}
