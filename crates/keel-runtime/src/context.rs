//! Request-scoped context, created at the edge and threaded explicitly through
//! every call chain.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    #[serde(default)]
    pub capability: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_id: String,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        Self {
            request_id: request_id.into(),
            capability: None,
            session_id: default_session_id(&user_id),
            user_id,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capability = Some(capability.into());
        self
    }
}

/// `req_` followed by 16 hex characters.
pub fn generate_request_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &hex[..16])
}

/// Session used when the caller does not name one.
pub fn default_session_id(user_id: &str) -> String {
    format!("session_{user_id}")
}
