//! Result document shapes
//!
//! Every call that asked for a result buffer gets one, on success and on
//! rejection alike, so callers reading only the document still observe the
//! outcome. The document is flat JSON: dispatch-level status fields plus
//! whatever operation-specific fields the collaborator reported.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{FacegateError, Result};

/// The serialized result of one call.
#[derive(Debug, Serialize)]
pub struct ApiResult {
    /// 0 for a successful dispatch, otherwise the negative taxonomy code.
    /// A negative biometric judgment still has `call_status` 0; it lives
    /// in the operation fields (`op_status` and friends).
    pub call_status: i32,
    pub call_status_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_message: Option<String>,
    /// Operation-specific fields, copied verbatim from the collaborator.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ApiResult {
    pub fn success(transaction_id: i64, document: Value) -> Self {
        let payload = match document {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("result".into(), other);
                map
            }
        };
        ApiResult {
            call_status: 0,
            call_status_name: "ok",
            transaction_id: Some(transaction_id),
            op_message: None,
            payload,
        }
    }

    pub fn rejection(error: &FacegateError) -> Self {
        ApiResult {
            call_status: error.status_code(),
            call_status_name: error.status_name(),
            transaction_id: None,
            op_message: Some(error.to_string()),
            payload: Map::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FacegateError::AllocationFailure(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn success_documents_flatten_the_collaborator_fields() {
        let result = ApiResult::success(7, json!({"age": 33.0, "op_status": 0}));
        let value: Value = serde_json::from_slice(&result.to_bytes().unwrap()).unwrap();
        assert_eq!(value["call_status"], 0);
        assert_eq!(value["transaction_id"], 7);
        assert_eq!(value["age"], 33.0);
    }

    #[test]
    fn rejection_documents_carry_the_discriminator() {
        let result = ApiResult::rejection(&FacegateError::InvalidHandle);
        let value: Value = serde_json::from_slice(&result.to_bytes().unwrap()).unwrap();
        assert_eq!(value["call_status"], -1);
        assert_eq!(value["call_status_name"], "invalid_handle");
        assert!(value.get("transaction_id").is_none());
    }
}
