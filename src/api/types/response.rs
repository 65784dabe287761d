use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;
use crate::api::error::ApiError;
use crate::ws::WsError;

/// Inbound API frame.
///
/// Every response names its call in `msg_type` and carries the call's data
/// under a key of the same name; see [`Response::data`].
#[non_exhaustive]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Response {
    #[serde(default)]
    pub msg_type: String,
    /// The request this frame answers, as the server understood it
    #[serde(default)]
    pub echo_req: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub req_id: Option<u64>,
    /// Present on every frame of a subscription stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    /// Remaining fields, including the call-specific data
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

/// Server-assigned handle of a subscription stream.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SubscriptionRef {
    pub id: String,
}

impl Response {
    #[must_use]
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id.as_str())
    }

    /// Data of the call named by `msg_type`.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.body.get(&self.msg_type)
    }

    /// Turn a server-side error into `Err`.
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self),
        }
    }
}

/// Parse a text frame holding either one response or an array of them.
pub fn parse_frames(bytes: &[u8]) -> Result<Vec<Response>> {
    let value: Value = serde_json::from_slice(bytes).map_err(WsError::MessageParse)?;

    let items = match value {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            let reason = format!("expected a JSON object, got {other}");
            return Err(WsError::InvalidMessage(reason).into());
        }
    };

    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(WsError::MessageParse)
                .map_err(Into::into)
        })
        .collect()
}
