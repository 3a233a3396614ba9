//! JSON-lines framing between the host application and the bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thermal_bridge::{MethodCall, MethodResponse};

/// One request line: a method call with an optional caller-chosen id.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    #[serde(flatten)]
    pub call: MethodCall,
}

/// One response line.
#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Result {
        id: Value,
        result: Value,
    },
    NotImplemented {
        id: Value,
        #[serde(rename = "notImplemented")]
        not_implemented: bool,
    },
    Error {
        error: String,
    },
}

impl Response {
    pub fn from_method(id: Value, response: MethodResponse) -> Self {
        match response {
            MethodResponse::Success(result) => Self::Result { id, result },
            MethodResponse::NotImplemented => Self::NotImplemented {
                id,
                not_implemented: true,
            },
        }
    }
}

pub fn parse_request(line: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(line)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_request_with_arguments() {
        let request = parse_request(r#"{"id":7,"method":"connect","arguments":"AA:BB:CC:DD:EE:FF"}"#)
            .unwrap();
        assert_eq!(request.id, json!(7));
        assert_eq!(request.call.method, "connect");
        assert_eq!(request.call.arguments, json!("AA:BB:CC:DD:EE:FF"));
    }

    #[test]
    fn id_and_arguments_are_optional() {
        let request = parse_request(r#"{"method":"isConnected"}"#).unwrap();
        assert_eq!(request.id, Value::Null);
        assert_eq!(request.call.arguments, Value::Null);
    }

    #[test]
    fn rejects_lines_without_method() {
        assert!(parse_request(r#"{"id":1}"#).is_err());
        assert!(parse_request("not json").is_err());
    }

    #[test]
    fn encodes_responses() {
        let ok = Response::from_method(json!(1), MethodResponse::Success(json!(true)));
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({"id": 1, "result": true}));

        let missing = Response::from_method(json!("a"), MethodResponse::NotImplemented);
        assert_eq!(
            serde_json::to_value(&missing).unwrap(),
            json!({"id": "a", "notImplemented": true})
        );

        let error = Response::Error {
            error: "expected value".into(),
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"error": "expected value"})
        );
    }
}
