//! Client → Server request bodies

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `POST /api/sessions/{id}/approve`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApproveRequest {
    pub call_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_args: Option<Map<String, Value>>,
}

/// `POST /api/sessions/{id}/input`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputResponseRequest {
    pub request_id: String,
    pub response: String,
}

/// `POST /api/sessions/{id}/message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}
