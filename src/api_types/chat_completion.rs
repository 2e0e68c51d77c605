use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single content part of a multi-part message (e.g. text mixed with an image).
///
/// Non-text parts are accepted (so the payload still validates against the OpenAI
/// schema) but are dropped during canonicalisation — only `type: "text"` parts
/// contribute to the prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: Option<String>,
}

/// A message's `content` field: either a plain string or a list of parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

/// One chat message. `role` is kept as a free-form string (not an enum) because
/// the canonicaliser's unknown-role fallback depends on seeing whatever role
/// string the client actually sent.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

fn default_role() -> String {
    "user".to_string()
}

/// The subset of `POST /v1/chat/completions` this proxy needs to inspect.
///
/// Every other field the client sent is preserved in `extra` and forwarded to
/// the backend untouched — this proxy only needs to read `messages`, `model`
/// and `stream`; it does not re-validate or otherwise understand the rest of
/// the OpenAI payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateChatCompletionPayload {
    #[serde(default)]
    pub messages: Vec<Message>,
    pub model: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// Optional per-request override of the block window size, in addition to
    /// the header/query overrides.
    pub words_per_block: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `GET /v1/models` response shape.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListResponse {
    pub object: &'static str,
    pub data: Vec<ModelObject>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}
