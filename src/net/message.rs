//! Wire messages.
//!
//! JSON objects discriminated by a `type` field: AUTH, STATUS, VALUE, TABLE,
//! CHART and MULTI. A MULTI carries its sub-messages as JSON-encoded strings.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Protocol version carried in every AUTH; mismatch is refused with
/// STATUS ERR VER.
pub const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthMode {
    Login,
    Signup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusMode {
    Ok,
    Err,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusCode {
    Done,
    Exc,
    Bad,
    Ver,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    pub x: Vec<Value>,
    pub y: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "AUTH")]
    Auth {
        version: String,
        mode: AuthMode,
        name: String,
        email: String,
        password: String,
    },
    #[serde(rename = "STATUS")]
    Status {
        mode: StatusMode,
        code: StatusCode,
        message: Value,
    },
    #[serde(rename = "VALUE")]
    Value { name: String, value: Value },
    #[serde(rename = "TABLE")]
    Table {
        title: String,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    #[serde(rename = "CHART")]
    Chart {
        title: String,
        xformat: Option<String>,
        xlabel: String,
        ylabel: String,
        series: Vec<ChartSeries>,
    },
    #[serde(rename = "MULTI")]
    Multi { messages: Vec<String> },
}

impl Message {
    pub fn status(mode: StatusMode, code: StatusCode, message: Value) -> Self {
        Message::Status {
            mode,
            code,
            message,
        }
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self::status(
            StatusMode::Ok,
            StatusCode::Done,
            json!({ "content": content.into() }),
        )
    }

    pub fn done_with(mut extra: Value, content: impl Into<String>) -> Self {
        extra["content"] = Value::String(content.into());
        Self::status(StatusMode::Ok, StatusCode::Done, extra)
    }

    pub fn bad(content: impl Into<String>) -> Self {
        Self::status(
            StatusMode::Err,
            StatusCode::Bad,
            json!({ "content": content.into() }),
        )
    }

    pub fn deny(content: impl Into<String>) -> Self {
        Self::status(
            StatusMode::Err,
            StatusCode::Deny,
            json!({ "content": content.into() }),
        )
    }

    pub fn deny_with(mut extra: Value, content: impl Into<String>) -> Self {
        extra["content"] = Value::String(content.into());
        Self::status(StatusMode::Err, StatusCode::Deny, extra)
    }

    pub fn exc(content: impl Into<String>) -> Self {
        Self::status(
            StatusMode::Err,
            StatusCode::Exc,
            json!({ "content": content.into() }),
        )
    }

    pub fn version_mismatch() -> Self {
        Self::status(
            StatusMode::Err,
            StatusCode::Ver,
            json!({
                "version": PROTOCOL_VERSION,
                "content": "You're running an outdated version of the exchange protocol",
            }),
        )
    }

    pub fn value(name: impl Into<String>, value: Value) -> Self {
        Message::Value {
            name: name.into(),
            value,
        }
    }

    pub fn table(
        title: impl Into<String>,
        columns: Vec<&str>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        Message::Table {
            title: title.into(),
            columns: columns.into_iter().map(String::from).collect(),
            rows,
        }
    }

    pub fn chart(
        title: impl Into<String>,
        xformat: Option<&str>,
        xlabel: &str,
        ylabel: &str,
        series: Vec<ChartSeries>,
    ) -> Self {
        Message::Chart {
            title: title.into(),
            xformat: xformat.map(String::from),
            xlabel: xlabel.to_string(),
            ylabel: ylabel.to_string(),
            series,
        }
    }

    /// Bundle sub-messages; each is carried as its own JSON-encoded string.
    pub fn multi(messages: Vec<Message>) -> Self {
        Message::Multi {
            messages: messages.iter().map(Message::encode).collect(),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("wire messages always serialize")
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_shape() {
        let encoded = Message::done("Order placed").encode();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "STATUS");
        assert_eq!(value["mode"], "OK");
        assert_eq!(value["code"], "DONE");
        assert_eq!(value["message"]["content"], "Order placed");
    }

    #[test]
    fn test_auth_roundtrip() {
        let auth = Message::Auth {
            version: PROTOCOL_VERSION.to_string(),
            mode: AuthMode::Login,
            name: "alice".into(),
            email: "a@example.com".into(),
            password: "pw".into(),
        };
        let decoded = Message::decode(&auth.encode()).unwrap();
        match decoded {
            Message::Auth { mode, name, .. } => {
                assert_eq!(mode, AuthMode::Login);
                assert_eq!(name, "alice");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_multi_nests_encoded_strings() {
        let multi = Message::multi(vec![
            Message::value("User", json!("alice")),
            Message::done("ok"),
        ]);
        let value: Value = serde_json::from_str(&multi.encode()).unwrap();
        let inner = value["messages"][0].as_str().unwrap();
        let decoded = Message::decode(inner).unwrap();
        assert!(matches!(decoded, Message::Value { .. }));
    }

    #[test]
    fn test_done_with_extra_fields() {
        let status = Message::done_with(
            json!({"filled": 4, "price": 100.0, "id": 7}),
            "Order placed",
        );
        let value: Value = serde_json::from_str(&status.encode()).unwrap();
        assert_eq!(value["message"]["filled"], 4);
        assert_eq!(value["message"]["id"], 7);
        assert_eq!(value["message"]["content"], "Order placed");
    }

    #[test]
    fn test_chart_allows_null_xformat() {
        let chart = Message::chart(
            "XYZ",
            None,
            "Price",
            "Size",
            vec![ChartSeries {
                name: "XYZ".into(),
                x: vec![json!(1.0)],
                y: vec![json!(10)],
            }],
        );
        let value: Value = serde_json::from_str(&chart.encode()).unwrap();
        assert!(value["xformat"].is_null());
    }
}
