//! Types exchanged with the transport carrying actions and results.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::{ACTION_IS_LOGGED_IN, ACTION_LOGIN, ACTION_LOGOUT, ACTION_RESET};
use crate::error::Error;

//------------ ActionKind ----------------------------------------------------

/// The kinds of action handled by the authentication core.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ActionKind {
    IsLoggedIn,
    Login,
    Logout,
    Reset,
}

impl ActionKind {
    /// Returns the action tag as used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::IsLoggedIn => ACTION_IS_LOGGED_IN,
            ActionKind::Login => ACTION_LOGIN,
            ActionKind::Logout => ACTION_LOGOUT,
            ActionKind::Reset => ACTION_RESET,
        }
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            ACTION_IS_LOGGED_IN => Ok(ActionKind::IsLoggedIn),
            ACTION_LOGIN => Ok(ActionKind::Login),
            ACTION_LOGOUT => Ok(ActionKind::Logout),
            ACTION_RESET => Ok(ActionKind::Reset),
            _ => Err(Error::ActionNotImplemented(s.to_string())),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//------------ ActionRequest -------------------------------------------------

/// A single action as received from a client.
///
/// The action tag is kept as a string so that unknown actions can be
/// reported back with the tag the client used.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(rename = "providerID")]
    pub provider_id: String,
}

impl ActionRequest {
    pub fn new(kind: ActionKind, provider_id: impl Into<String>) -> Self {
        ActionRequest {
            action: kind.as_str().to_string(),
            id: None,
            provider_id: provider_id.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn kind(&self) -> Result<ActionKind, Error> {
        ActionKind::from_str(&self.action)
    }
}

//------------ ActionResult --------------------------------------------------

/// The terminal answer to exactly one [`ActionRequest`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActionResult {
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub status: ActionStatus,
}

impl ActionResult {
    pub fn success(request: &ActionRequest, data: Vec<u8>) -> Self {
        ActionResult {
            action: request.action.clone(),
            id: request.id.clone(),
            status: ActionStatus::Success { data },
        }
    }

    pub fn failure(request: &ActionRequest, error: ErrorResponse) -> Self {
        ActionResult {
            action: request.action.clone(),
            id: request.id.clone(),
            status: ActionStatus::Failure { error },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, ActionStatus::Success { .. })
    }

    /// Returns the success payload, if any.
    pub fn data(&self) -> Option<&[u8]> {
        match &self.status {
            ActionStatus::Success { data } => Some(data),
            ActionStatus::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorResponse> {
        match &self.status {
            ActionStatus::Success { .. } => None,
            ActionStatus::Failure { error } => Some(error),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success { data: Vec<u8> },
    Failure { error: ErrorResponse },
}

//------------ ErrorResponse -------------------------------------------------

/// A structured failure as reported to clients.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    /// The numeric error code.
    pub code: u16,

    /// The error label.
    pub label: String,

    /// The error message.
    pub msg: String,

    /// Arguments with details about the error.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub args: HashMap<String, String>,
}

impl ErrorResponse {
    pub fn new(code: u16, label: &str, msg: impl fmt::Display) -> Self {
        ErrorResponse {
            code,
            label: label.to_string(),
            msg: msg.to_string(),
            args: HashMap::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.args.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_cause(self, cause: impl fmt::Display) -> Self {
        self.with_arg("cause", cause)
    }

    pub fn with_provider(self, provider: impl fmt::Display) -> Self {
        self.with_arg("provider", provider)
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}): {}", self.label, self.code, self.msg)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_action_tags() {
        for kind in [ActionKind::IsLoggedIn, ActionKind::Login, ActionKind::Logout, ActionKind::Reset] {
            assert_eq!(ActionKind::from_str(kind.as_str()).unwrap(), kind);
        }

        match ActionKind::from_str("crypto/sign") {
            Err(Error::ActionNotImplemented(tag)) => assert_eq!(tag, "crypto/sign"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn request_json_uses_provider_id_field() {
        let json = r#"{"action":"crypto/login","id":"7","providerID":"p1"}"#;
        let req: ActionRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req, ActionRequest::new(ActionKind::Login, "p1").with_id("7"));
    }

    #[test]
    fn result_echoes_request() {
        let req = ActionRequest::new(ActionKind::IsLoggedIn, "p1").with_id("42");
        let res = ActionResult::success(&req, vec![1]);

        assert_eq!(res.action, ACTION_IS_LOGGED_IN);
        assert_eq!(res.id.as_deref(), Some("42"));
        assert_eq!(res.data(), Some([1u8].as_slice()));

        let json = serde_json::to_string(&res).unwrap();
        assert_eq!(json, r#"{"action":"crypto/isLoggedIn","id":"42","status":{"success":{"data":[1]}}}"#);
    }
}
