//! Response matching for the command channel.
//!
//! Each incoming line is first decoded into a [`ResponseShape`], then the
//! active request's [`Matcher`] decides whether the line resolves it, rejects
//! it, or is left for someone else.

use serde_json::Value;

/// How a pending request recognises its response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Line starts with the given prefix, e.g. `+FWVERSION:`.
    Prefix(String),
    /// JSON object, or a bare `OK`/`done`/failure token.
    Json,
    /// Literal `OK` resolves, literal `ERROR` rejects.
    Terminal,
}

impl Matcher {
    /// Prefix matcher for `+<NAME>:` style answers.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::Prefix(prefix.into())
    }

    /// Decide what `line` means for a request waiting with this matcher.
    pub(crate) fn classify(&self, line: &str) -> Verdict {
        let shape = ResponseShape::decode(line);
        match self {
            Self::Prefix(prefix) => {
                if let Some(rest) = line.strip_prefix(prefix.as_str()) {
                    Verdict::Resolve(Response::value(line, rest.trim()))
                } else if matches!(shape, ResponseShape::LiteralError) {
                    Verdict::Reject(line.to_string())
                } else {
                    Verdict::Ignore
                }
            },
            Self::Terminal => match shape {
                ResponseShape::LiteralOk if line.eq_ignore_ascii_case("OK") => {
                    Verdict::Resolve(Response::value(line, line))
                },
                ResponseShape::LiteralError => Verdict::Reject(line.to_string()),
                _ => Verdict::Ignore,
            },
            Self::Json => match shape {
                ResponseShape::JsonResult(value) => {
                    let success = json_success(&value);
                    Verdict::Resolve(Response {
                        raw: line.to_string(),
                        value: line.to_string(),
                        success,
                        json: Some(value),
                    })
                },
                ResponseShape::LiteralOk => Verdict::Resolve(Response::value(line, line)),
                ResponseShape::LiteralError => Verdict::Resolve(Response::failure(line)),
                ResponseShape::Unmatched => {
                    let lower = line.to_ascii_lowercase();
                    if lower.contains("error") || lower.contains("fail") {
                        Verdict::Resolve(Response::failure(line))
                    } else {
                        Verdict::Ignore
                    }
                },
            },
        }
    }
}

/// Closed set of shapes a device line can take.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseShape {
    /// A JSON object.
    JsonResult(Value),
    /// `OK` or `done`.
    LiteralOk,
    /// `ERROR`, `fail`, or anything mentioning `unknown command`.
    LiteralError,
    /// None of the above.
    Unmatched,
}

impl ResponseShape {
    /// Try JSON first, then the fixed literals.
    pub fn decode(line: &str) -> Self {
        let line = line.trim();
        if line.starts_with('{') {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(line) {
                return Self::JsonResult(value);
            }
        }
        if line.eq_ignore_ascii_case("ok") || line.eq_ignore_ascii_case("done") {
            Self::LiteralOk
        } else if line.eq_ignore_ascii_case("error")
            || line.eq_ignore_ascii_case("fail")
            || line
                .to_ascii_lowercase()
                .contains("unknown command")
        {
            Self::LiteralError
        } else {
            Self::Unmatched
        }
    }
}

/// A resolved response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// The full line as received (trimmed).
    pub raw: String,
    /// Payload: prefix-stripped value, or the whole line.
    pub value: String,
    /// Whether the device reported success.
    pub success: bool,
    /// Parsed JSON object, when the line was one.
    pub json: Option<Value>,
}

impl Response {
    fn value(raw: &str, value: &str) -> Self {
        Self {
            raw: raw.to_string(),
            value: value.to_string(),
            success: true,
            json: None,
        }
    }

    fn failure(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            value: raw.to_string(),
            success: false,
            json: None,
        }
    }
}

/// What a line means for the active request.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Verdict {
    Resolve(Response),
    Reject(String),
    Ignore,
}

/// Success flag of a JSON test result.
///
/// Looks at `ok`, `success`, `result` and `status` in that order; without
/// any of them a result is a success unless it carries an `error`.
pub fn json_success(value: &Value) -> bool {
    for key in ["ok", "success", "result", "status"] {
        match value.get(key) {
            Some(Value::Bool(flag)) => return *flag,
            Some(Value::String(text)) => {
                let text = text.to_ascii_lowercase();
                if matches!(text.as_str(), "fail" | "failed" | "error" | "false" | "timeout") {
                    return false;
                }
                if matches!(text.as_str(), "ok" | "pass" | "passed" | "done" | "success" | "true") {
                    return true;
                }
            },
            _ => {},
        }
    }
    value
        .get("error")
        .is_none_or(Value::is_null)
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[test]
    fn decode_shapes() {
        assert!(matches!(
            ResponseShape::decode(r#"{"result":"done"}"#),
            ResponseShape::JsonResult(_)
        ));
        assert_eq!(ResponseShape::decode("OK"), ResponseShape::LiteralOk);
        assert_eq!(ResponseShape::decode("Done"), ResponseShape::LiteralOk);
        assert_eq!(ResponseShape::decode("ERROR"), ResponseShape::LiteralError);
        assert_eq!(ResponseShape::decode("fail"), ResponseShape::LiteralError);
        assert_eq!(
            ResponseShape::decode("unknown command: test_foo"),
            ResponseShape::LiteralError
        );
        assert_eq!(ResponseShape::decode("{broken"), ResponseShape::Unmatched);
        assert_eq!(ResponseShape::decode("42"), ResponseShape::Unmatched);
    }

    #[test]
    fn prefix_matcher_strips_value() {
        let m = Matcher::prefix("+FWVERSION:");
        match m.classify("+FWVERSION: 1.4.0 ") {
            Verdict::Resolve(r) => {
                assert_eq!(r.value, "1.4.0");
                assert!(r.success);
            },
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.classify("AT+FWVERSION?"), Verdict::Ignore);
        assert_eq!(m.classify("ERROR"), Verdict::Reject("ERROR".into()));
    }

    #[test]
    fn terminal_matcher() {
        let m = Matcher::Terminal;
        assert!(matches!(m.classify("OK"), Verdict::Resolve(_)));
        assert_eq!(m.classify("done"), Verdict::Ignore);
        assert!(matches!(m.classify("ERROR"), Verdict::Reject(_)));
        assert_eq!(m.classify("+LORA:boot"), Verdict::Ignore);
    }

    #[test]
    fn json_matcher_resolves_failures_instead_of_rejecting() {
        let m = Matcher::Json;
        match m.classify("ERROR") {
            Verdict::Resolve(r) => assert!(!r.success),
            other => panic!("unexpected {other:?}"),
        }
        match m.classify("I2C error: no ack") {
            Verdict::Resolve(r) => assert!(!r.success),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(m.classify("scanning..."), Verdict::Ignore);
    }

    #[test]
    fn json_matcher_parses_object() {
        match Matcher::Json.classify(r#"{"status":"fail","rssi":-70}"#) {
            Verdict::Resolve(r) => {
                assert!(!r.success);
                assert_eq!(r.json.unwrap()["rssi"], -70);
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn json_success_rules() {
        assert!(json_success(&json!({"ok": true})));
        assert!(!json_success(&json!({"ok": false, "status": "done"})));
        assert!(json_success(&json!({"result": "PASS"})));
        assert!(!json_success(&json!({"status": "fail"})));
        assert!(json_success(&json!({"temperature_c": 24.5})));
        assert!(!json_success(&json!({"error": "timeout"})));
        assert!(json_success(&json!({"error": null})));
        assert!(json_success(&json!({"status": "scanning"})));
    }
}
