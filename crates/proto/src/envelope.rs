//! Uniform HTTP response envelope for privileged operations.
//!
//! Every path (success or failure) answers with
//! `{ "status": "success" | "error", "data": { code, name, message } }`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub code: u16,
    pub name: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEnvelope {
    pub status: ApiStatus,
    pub data: ApiMessage,
}

impl ApiEnvelope {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Success,
            data: ApiMessage { code: 200, name: "Success".to_string(), message: message.into() },
        }
    }

    pub fn error(code: u16, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: ApiStatus::Error,
            data: ApiMessage { code, name: name.into(), message: message.into() },
        }
    }

    pub fn unauthorized() -> Self {
        Self::error(401, "Unauthorized", "Unauthorized. Access denied.")
    }

    pub fn is_success(&self) -> bool {
        self.status == ApiStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let v = serde_json::to_value(ApiEnvelope::unauthorized()).expect("ser");
        assert_eq!(v["status"], "error");
        assert_eq!(v["data"]["code"], 401);
        assert_eq!(v["data"]["name"], "Unauthorized");

        let ok = serde_json::to_value(ApiEnvelope::success("done")).expect("ser");
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["data"]["message"], "done");
    }
}
