//! Request and result shapes carried by [`Transport::send`](super::Transport::send)
//!
//! Params and results cross the `Transport` boundary as `serde_json::Value`;
//! these types fix the JSON field names (camelCase, as tool hosts expect) and
//! convert to and from the protobuf messages.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use toolmesh_proto::v1;
use toolmesh_proto::value::{from_struct, to_struct};

/// Protocol revision sent during capability negotiation.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
    #[serde(default)]
    pub capabilities: Map<String, Json>,
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            client_info: None,
            capabilities: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
    #[serde(default)]
    pub capabilities: Map<String, Json>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Map<String, Json>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<Tool>,
    /// Opaque; absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Json>,
}

/// One item of tool output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Binary payload, base64 in JSON.
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub metadata: std::collections::HashMap<String, String>,
}

impl Content {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn blob(data: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            kind: "blob".to_string(),
            data,
            mime_type: Some(mime_type.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    pub content: Vec<Content>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallToolResult {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingParams {
    /// Milliseconds since the Unix epoch; filled in when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResult {
    pub timestamp: i64,
    pub status: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

impl From<v1::Implementation> for Implementation {
    fn from(i: v1::Implementation) -> Self {
        Self {
            name: i.name,
            version: i.version,
        }
    }
}

impl From<Implementation> for v1::Implementation {
    fn from(i: Implementation) -> Self {
        Self {
            name: i.name,
            version: i.version,
        }
    }
}

impl From<InitializeParams> for v1::InitializeRequest {
    fn from(p: InitializeParams) -> Self {
        Self {
            protocol_version: p.protocol_version,
            client_info: p.client_info.map(Into::into),
            capabilities: Some(to_struct(&p.capabilities)),
        }
    }
}

impl From<v1::InitializeRequest> for InitializeParams {
    fn from(r: v1::InitializeRequest) -> Self {
        Self {
            protocol_version: r.protocol_version,
            client_info: r.client_info.map(Into::into),
            capabilities: r.capabilities.as_ref().map(from_struct).unwrap_or_default(),
        }
    }
}

impl From<v1::InitializeResponse> for InitializeResult {
    fn from(r: v1::InitializeResponse) -> Self {
        Self {
            protocol_version: r.protocol_version,
            server_info: r.server_info.map(Into::into),
            capabilities: r.capabilities.as_ref().map(from_struct).unwrap_or_default(),
            instructions: non_empty(r.instructions),
        }
    }
}

impl From<InitializeResult> for v1::InitializeResponse {
    fn from(r: InitializeResult) -> Self {
        Self {
            protocol_version: r.protocol_version,
            server_info: r.server_info.map(Into::into),
            capabilities: Some(to_struct(&r.capabilities)),
            instructions: r.instructions.unwrap_or_default(),
        }
    }
}

impl From<v1::Tool> for Tool {
    fn from(t: v1::Tool) -> Self {
        Self {
            name: t.name,
            description: t.description,
            input_schema: t.input_schema.as_ref().map(from_struct).unwrap_or_default(),
        }
    }
}

impl From<Tool> for v1::Tool {
    fn from(t: Tool) -> Self {
        Self {
            name: t.name,
            description: t.description,
            input_schema: Some(to_struct(&t.input_schema)),
        }
    }
}

impl From<v1::ListToolsResponse> for ListToolsResult {
    fn from(r: v1::ListToolsResponse) -> Self {
        Self {
            tools: r.tools.into_iter().map(Into::into).collect(),
            next_cursor: non_empty(r.next_cursor),
        }
    }
}

impl From<ListToolsResult> for v1::ListToolsResponse {
    fn from(r: ListToolsResult) -> Self {
        Self {
            tools: r.tools.into_iter().map(Into::into).collect(),
            next_cursor: r.next_cursor.unwrap_or_default(),
        }
    }
}

impl From<CallToolParams> for v1::CallToolRequest {
    fn from(p: CallToolParams) -> Self {
        Self {
            name: p.name,
            arguments: Some(to_struct(&p.arguments)),
        }
    }
}

impl From<v1::CallToolRequest> for CallToolParams {
    fn from(r: v1::CallToolRequest) -> Self {
        Self {
            name: r.name,
            arguments: r.arguments.as_ref().map(from_struct).unwrap_or_default(),
        }
    }
}

impl From<v1::Content> for Content {
    fn from(c: v1::Content) -> Self {
        Self {
            kind: c.r#type,
            text: non_empty(c.text),
            data: c.data,
            mime_type: non_empty(c.mime_type),
            metadata: c.metadata,
        }
    }
}

impl From<Content> for v1::Content {
    fn from(c: Content) -> Self {
        Self {
            r#type: c.kind,
            text: c.text.unwrap_or_default(),
            data: c.data,
            mime_type: c.mime_type.unwrap_or_default(),
            metadata: c.metadata,
        }
    }
}

impl From<v1::CallToolResponse> for CallToolResult {
    fn from(r: v1::CallToolResponse) -> Self {
        Self {
            content: r.content.into_iter().map(Into::into).collect(),
            is_error: r.is_error,
        }
    }
}

impl From<CallToolResult> for v1::CallToolResponse {
    fn from(r: CallToolResult) -> Self {
        Self {
            content: r.content.into_iter().map(Into::into).collect(),
            is_error: r.is_error,
        }
    }
}

impl From<v1::PingResponse> for PingResult {
    fn from(r: v1::PingResponse) -> Self {
        Self {
            timestamp: r.timestamp,
            status: r.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_result_json_field_names() {
        let result = CallToolResult {
            content: vec![
                Content::text("hi"),
                Content::blob(vec![1, 2, 3], "application/octet-stream"),
            ],
            is_error: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json,
            json!({
                "content": [
                    {"type": "text", "text": "hi"},
                    {"type": "blob", "data": "AQID", "mimeType": "application/octet-stream"}
                ],
                "isError": false
            })
        );

        let back: CallToolResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_call_params_from_json() {
        let params: CallToolParams =
            serde_json::from_value(json!({"name": "add", "arguments": {"a": 1, "b": 2}})).unwrap();
        let request = v1::CallToolRequest::from(params);
        assert_eq!(request.name, "add");
        let back = CallToolParams::from(request);
        assert_eq!(back.arguments.get("a"), Some(&json!(1)));

        let bare: CallToolParams = serde_json::from_value(json!({"name": "noop"})).unwrap();
        assert!(bare.arguments.is_empty());
    }

    #[test]
    fn test_empty_wire_strings_become_none() {
        let result = ListToolsResult::from(v1::ListToolsResponse {
            tools: vec![v1::Tool {
                name: "echo".into(),
                description: String::new(),
                input_schema: None,
            }],
            next_cursor: String::new(),
        });
        assert_eq!(result.next_cursor, None);
        assert!(result.tools[0].input_schema.is_empty());

        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("nextCursor").is_none());
    }

    #[test]
    fn test_initialize_defaults() {
        let params: InitializeParams = serde_json::from_value(json!({})).unwrap();
        assert_eq!(params.protocol_version, PROTOCOL_VERSION);

        let result = InitializeResult::from(v1::InitializeResponse {
            protocol_version: PROTOCOL_VERSION.into(),
            server_info: Some(v1::Implementation {
                name: "host".into(),
                version: "1.0".into(),
            }),
            capabilities: None,
            instructions: String::new(),
        });
        assert_eq!(result.server_info.unwrap().name, "host");
        assert_eq!(result.instructions, None);
    }
}
