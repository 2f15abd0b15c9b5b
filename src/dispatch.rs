//! Routes actions to their handlers.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::api::{ActionKind, ActionRequest, ActionResult};
use crate::auth::{AuthStateMachine, Authenticator, LoginOutcome};
use crate::error::Error;
use crate::notify::{Event, NotificationBridge};
use crate::registry::{ProviderRegistry, ProviderSession};
use crate::runtime::run_blocking;
use crate::token::{Token, TokenError};

//------------ ActionRouter --------------------------------------------------

/// Dispatches actions against the sessions of a [`ProviderRegistry`].
///
/// The router keeps no state of its own. All actions can be dispatched
/// concurrently; a login waiting for its PIN only holds up actions that
/// change the state of the same session.
#[derive(Clone, Debug)]
pub struct ActionRouter {
    registry: Arc<ProviderRegistry>,
    bridge: Arc<NotificationBridge>,
    authenticator: Authenticator,
}

impl ActionRouter {
    pub fn new(registry: Arc<ProviderRegistry>, bridge: Arc<NotificationBridge>) -> Self {
        ActionRouter {
            registry,
            authenticator: Authenticator::new(bridge.clone()),
            bridge,
        }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<NotificationBridge> {
        &self.bridge
    }

    /// Handles an action and packages the outcome as its result.
    ///
    /// Every request gets exactly one result, failures included.
    pub async fn handle(&self, origin: &str, request: ActionRequest) -> ActionResult {
        match self.dispatch(origin, &request).await {
            Ok(data) => ActionResult::success(&request, data),
            Err(err) => {
                debug!(
                    "Action '{}' for provider '{}' from '{}' failed: {}",
                    request.action, request.provider_id, origin, err
                );
                ActionResult::failure(&request, err.to_error_response())
            }
        }
    }

    /// Carries out an action and returns its payload.
    pub async fn dispatch(&self, origin: &str, request: &ActionRequest) -> Result<Vec<u8>, Error> {
        let kind = request.kind()?;
        debug!(
            "Dispatching '{}' for provider '{}' from '{}'",
            kind, request.provider_id, origin
        );

        let session = self.registry.resolve(&request.provider_id)?;

        match kind {
            ActionKind::IsLoggedIn => Ok(vec![u8::from(session.is_logged_in())]),
            ActionKind::Login => self.login(&session, origin).await,
            ActionKind::Logout => self.logout(&session).await,
            ActionKind::Reset => self.reset(&session).await,
        }
    }

    async fn login(&self, session: &ProviderSession, origin: &str) -> Result<Vec<u8>, Error> {
        let outcome = self.authenticator.login(session, origin).await?;
        if outcome == LoginOutcome::NotRequired {
            debug!("Provider '{}' does not gate on login", session.provider_id());
        }
        Ok(vec![])
    }

    async fn logout(&self, session: &ProviderSession) -> Result<Vec<u8>, Error> {
        if !session.capabilities().logout {
            debug!("Provider '{}' has no logout, nothing to do", session.provider_id());
            return Ok(vec![]);
        }
        self.end_session(session, "logout", |token| token.logout()).await
    }

    async fn reset(&self, session: &ProviderSession) -> Result<Vec<u8>, Error> {
        if !session.capabilities().reset {
            debug!("Provider '{}' has no reset, nothing to do", session.provider_id());
            return Ok(vec![]);
        }
        self.end_session(session, "reset", |token| token.reset()).await
    }

    /// Runs a token call that leaves the session logged out.
    ///
    /// Waits for a pending login on the session to finish first. The state
    /// is updated on the blocking pool right after the token call returns,
    /// so it stays in line with the token if this future is dropped.
    async fn end_session<F>(&self, session: &ProviderSession, what: &str, op: F) -> Result<Vec<u8>, Error>
    where
        F: FnOnce(&dyn Token) -> Result<(), TokenError> + Send + 'static,
    {
        let operation = session.lock_operations().await;

        let token = session.token();
        let auth = session.auth().clone();
        let provider_id = session.provider_id().to_string();
        let res = run_blocking(move || {
            let res = op(token.as_ref())
                .map_err(|err| Error::token(&provider_id, err))
                .and_then(|()| AuthStateMachine::logged_out(&provider_id, &auth));
            drop(operation);
            res
        })
        .await?;

        match res {
            Ok(()) => {
                info!("Provider '{}': {} done", session.provider_id(), what);
                self.bridge
                    .publish(Event::info(format!("Provider '{}': {} done", session.provider_id(), what)));
                Ok(vec![])
            }
            Err(err) => {
                warn!("Provider '{}': {} failed: {}", session.provider_id(), what, err);
                if matches!(err, Error::Token(..)) {
                    self.bridge.publish(Event::error(&err));
                }
                Err(err)
            }
        }
    }
}

//------------ Tests ---------------------------------------------------------
