//! The authentication state machine of provider sessions.
//!
//! A session is `LoggedOut`, `LoginPending` or `LoggedIn`. A login first
//! inspects the token:
//!
//!   - a token that does not require a login is used as is and the session
//!     stays `LoggedOut`,
//!   - a token with a protected authentication path collects the PIN itself,
//!     so the token login is called with an empty credential,
//!   - any other token needs a PIN from the user, which is requested from the
//!     observers of the [`NotificationBridge`] while the login waits.
//!
//! While the token login or the PIN request is outstanding the session is
//! `LoginPending`. A failed login returns the session to `LoggedOut`, it is
//! never left pending.
//!
//! The transitions themselves are plain synchronous functions on
//! [`AuthStateMachine`] and [`PendingLogin`]; the [`Authenticator`] drives
//! them from the async login action.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use secrecy::SecretString;
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use crate::error::Error;
use crate::notify::{Event, Notification, NotificationBridge, NotifyError, PinOutcome, PinRequest};
use crate::registry::ProviderSession;
use crate::runtime::run_blocking;
use crate::token::TokenError;

//------------ AuthState -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthState {
    LoggedOut,
    LoginPending,
    LoggedIn,
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthState::LoggedOut => write!(f, "logged out"),
            AuthState::LoginPending => write!(f, "login pending"),
            AuthState::LoggedIn => write!(f, "logged in"),
        }
    }
}

//------------ AuthCell ------------------------------------------------------

/// Holds the authentication state of one session.
///
/// Clones share the state. It can only be changed from within this module.
#[derive(Clone, Debug)]
pub struct AuthCell(Arc<Mutex<AuthState>>);

impl AuthCell {
    pub fn new(initial: AuthState) -> Self {
        AuthCell(Arc::new(Mutex::new(initial)))
    }

    pub fn get(&self) -> AuthState {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, AuthState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//------------ LoginPlan -----------------------------------------------------

/// What a login has to do, as decided from the token flags.
#[derive(Debug)]
pub enum LoginPlan {
    /// The provider does not gate on login at all.
    NotRequired,

    AlreadyLoggedIn,

    /// Log in with an empty credential; the device collects the PIN.
    ProtectedPath(PendingLogin),

    /// Ask an observer for the PIN first.
    Interactive(PendingLogin),
}

//------------ PendingLogin --------------------------------------------------

/// A session in state `LoginPending`.
///
/// The pending login ends through exactly one of its consuming methods. If
/// it is dropped instead, e.g. because the action waiting for the PIN was
/// cancelled, the session falls back to `LoggedOut`.
pub struct PendingLogin {
    provider_id: String,
    auth: AuthCell,
    settled: bool,
}

impl PendingLogin {
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// The token accepted the credential.
    pub fn login_succeeded(mut self) {
        self.settle(AuthState::LoggedIn);
    }

    /// The token declined the credential or failed.
    pub fn login_failed(mut self, err: TokenError) -> Error {
        self.settle(AuthState::LoggedOut);
        if err.is_rejection() {
            warn!("Token for provider '{}' rejected the login: {}", self.provider_id, err);
            Error::AuthenticationRejected(self.provider_id.clone())
        } else {
            warn!("Token login for provider '{}' failed: {}", self.provider_id, err);
            Error::token(&self.provider_id, err)
        }
    }

    /// The observer declined to supply a PIN.
    pub fn credential_rejected(mut self, err: NotifyError) -> Error {
        self.settle(AuthState::LoggedOut);
        info!("PIN request for provider '{}' was rejected: {}", self.provider_id, err);
        Error::PinRequestRejected(err)
    }

    /// Nobody is left who could answer the PIN request.
    pub fn credential_abandoned(mut self) -> Error {
        self.settle(AuthState::LoggedOut);
        warn!(
            "PIN request for provider '{}' was dropped without an answer",
            self.provider_id
        );
        Error::PinRequestAbandoned(self.provider_id.clone())
    }

    fn settle(&mut self, state: AuthState) {
        *self.auth.lock() = state;
        self.settled = true;
        debug!("Provider '{}' is now {}", self.provider_id, state);
    }
}

impl Drop for PendingLogin {
    fn drop(&mut self) {
        if !self.settled {
            *self.auth.lock() = AuthState::LoggedOut;
            warn!("Pending login for provider '{}' was abandoned", self.provider_id);
        }
    }
}

impl fmt::Debug for PendingLogin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PendingLogin")
            .field("provider_id", &self.provider_id)
            .field("settled", &self.settled)
            .finish()
    }
}

//------------ AuthStateMachine ----------------------------------------------

/// The transitions that do not involve a pending login.
pub struct AuthStateMachine;

impl AuthStateMachine {
    /// Decides how to log in to a session and, if a token login is needed,
    /// moves the session to `LoginPending`.
    ///
    /// Fails with [`Error::AuthenticationInProgress`] if a login is already
    /// pending.
    pub fn begin_login(session: &ProviderSession) -> Result<LoginPlan, Error> {
        let mut state = session.auth().lock();

        if *state == AuthState::LoginPending {
            return Err(Error::AuthenticationInProgress(session.provider_id().to_string()));
        }

        if !session.capabilities().login || !session.flags().login_required() {
            return Ok(LoginPlan::NotRequired);
        }

        if *state == AuthState::LoggedIn {
            return Ok(LoginPlan::AlreadyLoggedIn);
        }

        *state = AuthState::LoginPending;
        debug!("Provider '{}' is now {}", session.provider_id(), AuthState::LoginPending);

        let pending = PendingLogin {
            provider_id: session.provider_id().to_string(),
            auth: session.auth().clone(),
            settled: false,
        };
        if session.flags().protected_authentication_path() {
            Ok(LoginPlan::ProtectedPath(pending))
        } else {
            Ok(LoginPlan::Interactive(pending))
        }
    }

    /// The token session was logged out or reset.
    pub fn logged_out(provider_id: &str, auth: &AuthCell) -> Result<(), Error> {
        let mut state = auth.lock();
        if *state == AuthState::LoginPending {
            return Err(Error::AuthenticationInProgress(provider_id.to_string()));
        }
        *state = AuthState::LoggedOut;
        debug!("Provider '{}' is now {}", provider_id, AuthState::LoggedOut);
        Ok(())
    }
}

//------------ LoginOutcome --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoginOutcome {
    NotRequired,
    AlreadyLoggedIn,
    LoggedIn,
}

//------------ Authenticator -------------------------------------------------

/// Carries out login actions.
#[derive(Clone, Debug)]
pub struct Authenticator {
    bridge: Arc<NotificationBridge>,
}

impl Authenticator {
    pub fn new(bridge: Arc<NotificationBridge>) -> Self {
        Authenticator { bridge }
    }

    /// Logs in to a session on behalf of `origin`.
    ///
    /// If a PIN is needed this waits until an observer of the bridge answers
    /// the PIN request. Other actions can proceed in the meantime, except
    /// for actions changing the state of the same session which queue behind
    /// this login. A second login for the same session fails right away.
    ///
    /// Once the token has been called, the login runs to completion and its
    /// outcome is recorded even if the returned future is dropped.
    pub async fn login(&self, session: &ProviderSession, origin: &str) -> Result<LoginOutcome, Error> {
        if session.auth_state() == AuthState::LoginPending {
            return Err(Error::AuthenticationInProgress(session.provider_id().to_string()));
        }
        let operation = session.lock_operations().await;

        match AuthStateMachine::begin_login(session)? {
            LoginPlan::NotRequired => {
                debug!("Provider '{}' does not require a login", session.provider_id());
                Ok(LoginOutcome::NotRequired)
            }
            LoginPlan::AlreadyLoggedIn => {
                debug!("Provider '{}' is already logged in", session.provider_id());
                Ok(LoginOutcome::AlreadyLoggedIn)
            }
            LoginPlan::ProtectedPath(pending) => {
                debug!(
                    "Provider '{}' collects the PIN through its protected authentication path",
                    session.provider_id()
                );
                self.token_login(session, operation, pending, SecretString::new(String::new()))
                    .await
            }
            LoginPlan::Interactive(pending) => {
                let (request, response) = PinRequest::new(origin, &session.label(), session.provider_id());
                info!(
                    "Requesting PIN for provider '{}' on behalf of '{}' (request {})",
                    session.provider_id(),
                    origin,
                    request.id()
                );
                self.bridge.publish(Event::Notify(Notification::Pin(request)));

                match response.wait().await {
                    PinOutcome::Resolved(pin) => self.token_login(session, operation, pending, pin).await,
                    PinOutcome::Rejected(err) => Err(pending.credential_rejected(err)),
                    PinOutcome::Abandoned => Err(pending.credential_abandoned()),
                }
            }
        }
    }

    /// Calls the token and settles the pending login with its answer.
    ///
    /// The pending login and the operation guard move to the blocking pool
    /// together with the token call.
    async fn token_login(
        &self,
        session: &ProviderSession,
        operation: OwnedMutexGuard<()>,
        pending: PendingLogin,
        pin: SecretString,
    ) -> Result<LoginOutcome, Error> {
        let token = session.token();
        let res = run_blocking(move || {
            let res = match token.login(&pin) {
                Ok(()) => {
                    pending.login_succeeded();
                    Ok(())
                }
                Err(err) => Err(pending.login_failed(err)),
            };
            drop(operation);
            res
        })
        .await;

        match res {
            Ok(Ok(())) => {
                info!("Logged in to provider '{}'", session.provider_id());
                self.bridge.publish(Event::info(format!(
                    "Logged in to provider '{}'",
                    session.provider_id()
                )));
                Ok(LoginOutcome::LoggedIn)
            }
            Ok(Err(err)) => {
                if matches!(err, Error::Token(..)) {
                    self.bridge.publish(Event::error(&err));
                }
                Err(err)
            }
            Err(err) => {
                warn!("Login for provider '{}' aborted: {}", session.provider_id(), err);
                Err(err.into())
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::token::{Capabilities, SoftToken, TokenFlags};

    fn session(flags: TokenFlags) -> ProviderSession {
        ProviderSession::open("p1", Arc::new(SoftToken::new("Token A", flags).with_pin("1234")))
    }

    #[test]
    fn no_login_required_keeps_logged_out() {
        let session = session(TokenFlags::NONE);

        assert!(matches!(
            AuthStateMachine::begin_login(&session).unwrap(),
            LoginPlan::NotRequired
        ));
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
    }

    #[test]
    fn token_without_login_capability_needs_no_login() {
        let token = SoftToken::new("Token A", TokenFlags::LOGIN_REQUIRED).with_capabilities(Capabilities {
            login: false,
            logout: true,
            reset: true,
        });
        let session = ProviderSession::open("p1", Arc::new(token));

        assert!(matches!(
            AuthStateMachine::begin_login(&session).unwrap(),
            LoginPlan::NotRequired
        ));
    }

    #[test]
    fn protected_path_goes_pending_then_logged_in() {
        let session = session(TokenFlags::LOGIN_REQUIRED | TokenFlags::PROTECTED_AUTHENTICATION_PATH);

        let pending = match AuthStateMachine::begin_login(&session).unwrap() {
            LoginPlan::ProtectedPath(pending) => pending,
            other => panic!("unexpected plan: {:?}", other),
        };
        assert_eq!(session.auth_state(), AuthState::LoginPending);

        pending.login_succeeded();
        assert_eq!(session.auth_state(), AuthState::LoggedIn);

        assert!(matches!(
            AuthStateMachine::begin_login(&session).unwrap(),
            LoginPlan::AlreadyLoggedIn
        ));
    }

    #[test]
    fn second_login_while_pending_is_refused() {
        let session = session(TokenFlags::LOGIN_REQUIRED);

        let pending = match AuthStateMachine::begin_login(&session).unwrap() {
            LoginPlan::Interactive(pending) => pending,
            other => panic!("unexpected plan: {:?}", other),
        };

        assert!(matches!(
            AuthStateMachine::begin_login(&session),
            Err(Error::AuthenticationInProgress(_))
        ));
        assert!(matches!(
            AuthStateMachine::logged_out(session.provider_id(), session.auth()),
            Err(Error::AuthenticationInProgress(_))
        ));

        let err = pending.credential_rejected(NotifyError::new("cancelled"));
        assert_eq!(err.to_string(), "cancelled");
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
    }

    #[test]
    fn rejected_pin_returns_to_logged_out() {
        let session = session(TokenFlags::LOGIN_REQUIRED);

        let pending = match AuthStateMachine::begin_login(&session).unwrap() {
            LoginPlan::Interactive(pending) => pending,
            other => panic!("unexpected plan: {:?}", other),
        };
        let err = pending.login_failed(TokenError::PinIncorrect);

        assert!(matches!(err, Error::AuthenticationRejected(_)));
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
    }

    #[test]
    fn device_failure_is_a_token_error() {
        let session = session(TokenFlags::LOGIN_REQUIRED);

        let pending = match AuthStateMachine::begin_login(&session).unwrap() {
            LoginPlan::Interactive(pending) => pending,
            other => panic!("unexpected plan: {:?}", other),
        };
        let err = pending.login_failed(TokenError::Device("reader unplugged".into()));

        assert!(matches!(err, Error::Token(..)));
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
    }

    #[test]
    fn dropped_pending_login_returns_to_logged_out() {
        let session = session(TokenFlags::LOGIN_REQUIRED);

        match AuthStateMachine::begin_login(&session).unwrap() {
            LoginPlan::Interactive(pending) => drop(pending),
            other => panic!("unexpected plan: {:?}", other),
        }
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
    }

    #[test]
    fn pending_login_settles_on_another_thread() {
        let session = session(TokenFlags::LOGIN_REQUIRED | TokenFlags::PROTECTED_AUTHENTICATION_PATH);

        let pending = match AuthStateMachine::begin_login(&session).unwrap() {
            LoginPlan::ProtectedPath(pending) => pending,
            other => panic!("unexpected plan: {:?}", other),
        };
        assert_eq!(pending.provider_id(), "p1");

        std::thread::spawn(move || pending.login_succeeded()).join().unwrap();
        assert_eq!(session.auth_state(), AuthState::LoggedIn);
    }

    #[tokio::test]
    async fn login_without_observer_is_abandoned() {
        let session = session(TokenFlags::LOGIN_REQUIRED);
        let authenticator = Authenticator::new(Arc::new(NotificationBridge::new()));

        let res = authenticator.login(&session, "cli").await;
        assert!(matches!(res, Err(Error::PinRequestAbandoned(_))));
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn protected_path_logs_in_with_empty_credential() {
        use secrecy::ExposeSecret;

        let token = Arc::new(
            SoftToken::new(
                "Pad",
                TokenFlags::LOGIN_REQUIRED | TokenFlags::PROTECTED_AUTHENTICATION_PATH,
            )
            .with_pin("1234"),
        );
        let session = ProviderSession::open("p1", token.clone());
        let bridge = Arc::new(NotificationBridge::new());
        let (_, mut notifications) = bridge.subscribe_channel(crate::notify::EventKind::Notify);
        let authenticator = Authenticator::new(bridge);

        let outcome = authenticator.login(&session, "cli").await.unwrap();

        assert_eq!(outcome, LoginOutcome::LoggedIn);
        assert!(session.is_logged_in());
        assert_eq!(token.login_calls(), 1);
        assert_eq!(token.last_credential().unwrap().expose_secret(), "");
        assert!(notifications.try_recv().is_err());
    }
}
