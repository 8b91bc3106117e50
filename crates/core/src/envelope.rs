use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An action request travelling from the gateway towards the extension.
///
/// The `type` field names the operation; the payload is opaque to the relay
/// and only interpreted by the capability executor inside the extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionRequest {
    pub id: String,
    #[serde(rename = "type")]
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ActionRequest {
    pub fn new(id: impl Into<String>, op: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: id.into(),
            op: op.into(),
            payload,
        }
    }
}

/// The extension's answer to an [`ActionRequest`], matched back by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// One message on the wire, either direction. Responses carry a required
/// `success` flag and requests a required `type`, which is what the untagged
/// deserializer keys on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Envelope {
    Response(ActionResponse),
    Request(ActionRequest),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_roundtrip_keeps_type_field_name() {
        let req = ActionRequest::new("req-1", "navigate", Some(json!({"url": "https://x.dev"})));
        let raw = serde_json::to_value(&req).unwrap();
        assert_eq!(raw["type"], "navigate");
        assert_eq!(raw["id"], "req-1");

        let back: ActionRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_request_without_payload_omits_field() {
        let req = ActionRequest::new("req-2", "ping", None);
        let raw = serde_json::to_value(&req).unwrap();
        assert!(!raw.as_object().unwrap().contains_key("payload"));
    }

    #[test]
    fn test_envelope_disambiguates_response_from_request() {
        let resp: Envelope =
            serde_json::from_value(json!({"id": "r", "success": true, "data": {"pong": true}}))
                .unwrap();
        assert!(matches!(resp, Envelope::Response(_)));

        let req: Envelope =
            serde_json::from_value(json!({"id": "r", "type": "click", "payload": {}})).unwrap();
        assert!(matches!(req, Envelope::Request(_)));
    }

    #[test]
    fn test_error_response_shape() {
        let resp = ActionResponse::err("r9", "element not found");
        let raw = serde_json::to_value(&resp).unwrap();
        assert_eq!(raw["success"], false);
        assert_eq!(raw["error"], "element not found");
        assert!(!raw.as_object().unwrap().contains_key("data"));
    }
}
