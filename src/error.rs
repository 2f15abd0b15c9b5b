//! Defines all hsmgate errors.

use std::fmt;

use crate::api::ErrorResponse;
use crate::config::ConfigError;
use crate::notify::NotifyError;
use crate::runtime::RunError;
use crate::token::TokenError;

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues (1000-1099)
    //-----------------------------------------------------------------

    // 1000
    Runtime(RunError),

    // 1001, the provider id and the token failure
    Token(String, TokenError),

    // 1002, not on the action protocol (fails at start up)
    Config(ConfigError),

    //-----------------------------------------------------------------
    // Action Issues (2000-2099)
    //-----------------------------------------------------------------

    // 2000
    ProviderNotFound(String),

    // 2001
    ProviderExists(String),

    // 2002
    ActionNotImplemented(String),

    //-----------------------------------------------------------------
    // Authentication Issues (2100-2199)
    //-----------------------------------------------------------------

    // 2100
    AuthenticationInProgress(String),

    // 2101
    AuthenticationRejected(String),

    // code and label supplied by the observer, 2102 by default
    PinRequestRejected(NotifyError),

    // 2103
    PinRequestAbandoned(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Runtime(e) => write!(f, "Runtime failure: {}", e),
            Error::Token(provider, e) => write!(f, "Token error for provider '{}': {}", provider, e),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::ProviderNotFound(provider) => write!(f, "Unknown provider '{}'", provider),
            Error::ProviderExists(provider) => write!(f, "Provider '{}' already exists", provider),
            Error::ActionNotImplemented(action) => write!(f, "Action '{}' is not implemented", action),
            Error::AuthenticationInProgress(provider) => {
                write!(f, "Authentication for provider '{}' is already in progress", provider)
            }
            Error::AuthenticationRejected(provider) => {
                write!(f, "Token for provider '{}' rejected the supplied credential", provider)
            }
            // The observer's error is handed back to the caller unchanged.
            Error::PinRequestRejected(e) => e.fmt(f),
            Error::PinRequestAbandoned(provider) => write!(
                f,
                "PIN request for provider '{}' was dropped without an answer",
                provider
            ),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn token(provider: &str, e: TokenError) -> Self {
        Error::Token(provider.to_string(), e)
    }

    /// Returns the structured failure reported back to the caller of an action.
    pub fn to_error_response(&self) -> ErrorResponse {
        match self {
            Error::Runtime(e) => ErrorResponse::new(1000, "sys-runtime", self).with_cause(e),
            Error::Token(provider, e) => ErrorResponse::new(1001, "sys-token", self)
                .with_provider(provider)
                .with_cause(e),
            Error::Config(e) => ErrorResponse::new(1002, "sys-config", self).with_cause(e),
            Error::ProviderNotFound(provider) => {
                ErrorResponse::new(2000, "prov-unknown", self).with_provider(provider)
            }
            Error::ProviderExists(provider) => {
                ErrorResponse::new(2001, "prov-exists", self).with_provider(provider)
            }
            Error::ActionNotImplemented(action) => {
                ErrorResponse::new(2002, "api-action-not-implemented", self).with_arg("action", action)
            }
            Error::AuthenticationInProgress(provider) => {
                ErrorResponse::new(2100, "auth-in-progress", self).with_provider(provider)
            }
            Error::AuthenticationRejected(provider) => {
                ErrorResponse::new(2101, "auth-rejected", self).with_provider(provider)
            }
            Error::PinRequestRejected(e) => e.to_error_response(),
            Error::PinRequestAbandoned(provider) => {
                ErrorResponse::new(2103, "auth-pin-abandoned", self).with_provider(provider)
            }
        }
    }
}

impl From<RunError> for Error {
    fn from(e: RunError) -> Self {
        Error::Runtime(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::Config(e)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observer_rejection_is_reported_unchanged() {
        let rejection = NotifyError::new("cancelled");
        let err = Error::PinRequestRejected(rejection.clone());

        assert_eq!(err.to_string(), "cancelled");
        assert_eq!(err.to_error_response(), rejection.to_error_response());
    }

    #[test]
    fn unknown_action_carries_its_tag() {
        let err = Error::ActionNotImplemented("crypto/sign".to_string());
        let res = err.to_error_response();

        assert_eq!(res.code, 2002);
        assert_eq!(res.label, "api-action-not-implemented");
        assert_eq!(res.args.get("action").map(String::as_str), Some("crypto/sign"));
        assert_eq!(res.msg, "Action 'crypto/sign' is not implemented");
    }

    #[test]
    fn token_errors_name_the_provider() {
        let err = Error::token("p1", TokenError::Device("slot removed".to_string()));
        let res = err.to_error_response();

        assert_eq!(res.code, 1001);
        assert_eq!(res.args.get("provider").map(String::as_str), Some("p1"));
        assert_eq!(res.args.get("cause").map(String::as_str), Some("Device error: slot removed"));
    }
}
