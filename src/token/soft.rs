//! A software token held entirely in memory.
//!
//! Useful for running hsmgate without hardware and as the token used by the
//! tests. It behaves like a simple smart card: a PIN protects the login and
//! the PIN locks after a number of consecutive failures.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{Capabilities, Token, TokenError, TokenFlags};

/// Consecutive wrong PINs after which the token refuses further logins.
const DEFAULT_MAX_PIN_ATTEMPTS: u32 = 3;

//------------ SoftTokenConfig -----------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct SoftTokenConfig {
    /// The provider id under which the token is registered.
    pub id: String,

    pub label: String,

    #[serde(default)]
    pub pin: Option<SecretString>,

    #[serde(default)]
    pub flags: TokenFlags,

    #[serde(default = "SoftTokenConfig::enabled")]
    pub login: bool,

    #[serde(default = "SoftTokenConfig::enabled")]
    pub logout: bool,

    #[serde(default = "SoftTokenConfig::enabled")]
    pub reset: bool,
}

impl SoftTokenConfig {
    fn enabled() -> bool {
        true
    }
}

//------------ SoftToken -----------------------------------------------------

#[derive(Debug)]
pub struct SoftToken {
    label: String,
    flags: TokenFlags,
    capabilities: Capabilities,
    pin: Option<SecretString>,
    max_pin_attempts: u32,
    login_delay: Option<Duration>,
    state: Mutex<SoftTokenState>,
}

#[derive(Debug, Default)]
struct SoftTokenState {
    logged_in: bool,
    failed_attempts: u32,
    login_calls: usize,
    logout_calls: usize,
    reset_calls: usize,
    last_credential: Option<SecretString>,
}

impl SoftToken {
    /// Creates a token supporting login, logout and reset.
    pub fn new(label: &str, flags: TokenFlags) -> Self {
        SoftToken {
            label: label.to_string(),
            flags,
            capabilities: Capabilities::all(),
            pin: None,
            max_pin_attempts: DEFAULT_MAX_PIN_ATTEMPTS,
            login_delay: None,
            state: Mutex::new(SoftTokenState::default()),
        }
    }

    pub fn from_config(config: &SoftTokenConfig) -> Self {
        let capabilities = Capabilities {
            login: config.login,
            logout: config.logout,
            reset: config.reset,
        };
        let mut token = SoftToken::new(&config.label, config.flags).with_capabilities(capabilities);
        token.pin = config.pin.clone();
        token
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.pin = Some(SecretString::new(pin.to_string()));
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_max_pin_attempts(mut self, attempts: u32) -> Self {
        self.max_pin_attempts = attempts;
        self
    }

    /// Makes every login call take at least the given time.
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = Some(delay);
        self
    }

    pub fn login_calls(&self) -> usize {
        self.state().login_calls
    }

    pub fn logout_calls(&self) -> usize {
        self.state().logout_calls
    }

    pub fn reset_calls(&self) -> usize {
        self.state().reset_calls
    }

    /// The credential passed to the most recent login call.
    pub fn last_credential(&self) -> Option<SecretString> {
        self.state().last_credential.clone()
    }

    fn state(&self) -> MutexGuard<'_, SoftTokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_pin(&self, pin: &SecretString) -> bool {
        if self.flags.protected_authentication_path() {
            // The device collects the PIN itself.
            return pin.expose_secret().is_empty();
        }
        match &self.pin {
            Some(expected) => expected.expose_secret() == pin.expose_secret(),
            None => true,
        }
    }
}

impl Token for SoftToken {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn flags(&self) -> TokenFlags {
        self.flags
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn is_logged_in(&self) -> bool {
        self.state().logged_in
    }

    fn login(&self, pin: &SecretString) -> Result<(), TokenError> {
        if !self.capabilities.login {
            return Err(TokenError::Unsupported("login"));
        }
        if let Some(delay) = self.login_delay {
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        state.login_calls += 1;
        state.last_credential = Some(pin.clone());

        if state.failed_attempts >= self.max_pin_attempts {
            debug!("Soft token '{}' refuses login, PIN is locked", self.label);
            return Err(TokenError::PinLocked);
        }

        if self.check_pin(pin) {
            state.failed_attempts = 0;
            state.logged_in = true;
            trace!("Soft token '{}' logged in", self.label);
            Ok(())
        } else {
            state.failed_attempts += 1;
            debug!(
                "Soft token '{}' rejected PIN ({} of {} attempts used)",
                self.label, state.failed_attempts, self.max_pin_attempts
            );
            Err(TokenError::PinIncorrect)
        }
    }

    fn logout(&self) -> Result<(), TokenError> {
        if !self.capabilities.logout {
            return Err(TokenError::Unsupported("logout"));
        }
        let mut state = self.state();
        state.logout_calls += 1;
        state.logged_in = false;
        Ok(())
    }

    fn reset(&self) -> Result<(), TokenError> {
        if !self.capabilities.reset {
            return Err(TokenError::Unsupported("reset"));
        }
        let mut state = self.state();
        state.reset_calls += 1;
        state.logged_in = false;
        state.last_credential = None;
        Ok(())
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }

    #[test]
    fn login_with_correct_pin() {
        let token = SoftToken::new("Token A", TokenFlags::LOGIN_REQUIRED).with_pin("1234");

        assert!(token.login(&secret("1234")).is_ok());
        assert!(token.is_logged_in());
        assert_eq!(token.last_credential().unwrap().expose_secret(), "1234");
    }

    #[test]
    fn pin_locks_after_failed_attempts() {
        let token = SoftToken::new("Token A", TokenFlags::LOGIN_REQUIRED)
            .with_pin("1234")
            .with_max_pin_attempts(2);

        assert!(matches!(token.login(&secret("0000")), Err(TokenError::PinIncorrect)));
        assert!(matches!(token.login(&secret("0000")), Err(TokenError::PinIncorrect)));
        assert!(matches!(token.login(&secret("1234")), Err(TokenError::PinLocked)));
        assert!(!token.is_logged_in());
        assert_eq!(token.login_calls(), 3);
    }

    #[test]
    fn protected_path_expects_empty_credential() {
        let flags = TokenFlags::LOGIN_REQUIRED | TokenFlags::PROTECTED_AUTHENTICATION_PATH;
        let token = SoftToken::new("Pad", flags).with_pin("1234");

        assert!(token.login(&secret("")).is_ok());
    }

    #[test]
    fn missing_capabilities_are_unsupported() {
        let token = SoftToken::new("Bare", TokenFlags::NONE).with_capabilities(Capabilities::none());

        assert!(matches!(token.logout(), Err(TokenError::Unsupported("logout"))));
        assert!(matches!(token.reset(), Err(TokenError::Unsupported("reset"))));
        assert_eq!(token.logout_calls(), 0);
    }

    #[test]
    fn config_builds_token() {
        let config: SoftTokenConfig = toml::from_str(
            r#"
            id = "soft0"
            label = "Token A"
            pin = "1234"
            flags = ["login_required"]
            reset = false
            "#,
        )
        .unwrap();

        let token = SoftToken::from_config(&config);
        assert_eq!(token.label(), "Token A");
        assert!(token.flags().login_required());
        assert_eq!(
            token.capabilities(),
            Capabilities {
                login: true,
                logout: true,
                reset: false
            }
        );
        assert!(token.login(&secret("1234")).is_ok());
    }
}
