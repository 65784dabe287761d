use serde::Serialize;
use serde_json::{Map, Value};

use crate::Result;
use crate::error::Error;

/// Keys the client sets on every outbound frame it correlates.
const RESERVED_KEYS: [&str; 2] = ["subscribe", "req_id"];

/// Request that opens a subscription stream.
///
/// Serializes as the payload's fields plus `<name>: 1` (unless the payload
/// already sets `<name>`), `subscribe: 1` and the correlation `req_id`.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct SubscribeRequest {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub subscribe: u8,
    pub req_id: u64,
}

impl SubscribeRequest {
    pub fn new(name: &str, payload: &Value, req_id: u64) -> Result<Self> {
        let mut fields = object_fields(payload)?;
        if !fields.contains_key(name) {
            fields.insert(name.to_owned(), Value::from(1));
        }

        Ok(Self {
            fields,
            subscribe: 1,
            req_id,
        })
    }
}

/// Request that stops a subscription stream by its server-assigned id.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct ForgetRequest {
    pub forget: String,
}

impl ForgetRequest {
    #[must_use]
    pub fn new(subscription_id: &str) -> Self {
        Self {
            forget: subscription_id.to_owned(),
        }
    }
}

/// One-shot request correlated with its response by `req_id`.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct Request {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub req_id: u64,
}

impl Request {
    pub fn new(payload: &Value, req_id: u64) -> Result<Self> {
        let fields = object_fields(payload)?;
        if fields.is_empty() {
            return Err(Error::validation("request must name an API call"));
        }

        Ok(Self { fields, req_id })
    }
}

fn object_fields(payload: &Value) -> Result<Map<String, Value>> {
    let mut fields = match payload {
        Value::Null => Map::new(),
        Value::Object(map) => map.clone(),
        other => {
            return Err(Error::validation(format!(
                "payload must be a JSON object, got {other}"
            )));
        }
    };

    for key in RESERVED_KEYS {
        fields.remove(key);
    }

    Ok(fields)
}
