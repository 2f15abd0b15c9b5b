//! The registry of open provider sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::auth::{AuthCell, AuthState};
use crate::config::{Config, ProviderConfig};
use crate::error::Error;
use crate::token::{Capabilities, SoftToken, Token, TokenFlags};

#[cfg(feature = "hsm")]
use crate::token::Pkcs11Token;

//------------ ProviderSession -----------------------------------------------

/// The live session to the token of one provider.
///
/// The flags and capabilities of the token are captured when the session is
/// opened. The authentication state can be read by anyone but is changed
/// only by the authentication state machine.
pub struct ProviderSession {
    provider_id: String,
    flags: TokenFlags,
    capabilities: Capabilities,
    auth: AuthCell,

    /// Serialises the actions that change the authentication state.
    ///
    /// Token calls take the guard along to the blocking pool, so it stays
    /// held until the token has returned even if the action is dropped.
    operations: Arc<Mutex<()>>,

    token: Arc<dyn Token>,
}

impl ProviderSession {
    pub fn open(provider_id: impl Into<String>, token: Arc<dyn Token>) -> Self {
        let initial = if token.is_logged_in() {
            AuthState::LoggedIn
        } else {
            AuthState::LoggedOut
        };
        ProviderSession {
            provider_id: provider_id.into(),
            flags: token.flags(),
            capabilities: token.capabilities(),
            auth: AuthCell::new(initial),
            operations: Arc::new(Mutex::new(())),
            token,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// The current label of the token.
    pub fn label(&self) -> String {
        self.token.label()
    }

    pub fn flags(&self) -> TokenFlags {
        self.flags
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.get()
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth_state() == AuthState::LoggedIn
    }

    pub(crate) fn auth(&self) -> &AuthCell {
        &self.auth
    }

    pub(crate) fn token(&self) -> Arc<dyn Token> {
        self.token.clone()
    }

    /// Waits until no other state changing action runs on this session.
    pub(crate) async fn lock_operations(&self) -> OwnedMutexGuard<()> {
        self.operations.clone().lock_owned().await
    }
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ProviderSession")
            .field("provider_id", &self.provider_id)
            .field("flags", &self.flags)
            .field("capabilities", &self.capabilities)
            .field("auth_state", &self.auth_state())
            .field("token", &self.token)
            .finish()
    }
}

//------------ ProviderRegistry ----------------------------------------------

/// Maps provider ids to their open sessions.
///
/// Sessions are added and removed by whoever manages the providers; the
/// authentication core only resolves them.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    sessions: RwLock<HashMap<String, Arc<ProviderSession>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        ProviderRegistry::default()
    }

    /// Opens the sessions for all providers in the configuration.
    pub fn build(config: &Config) -> Result<Self, Error> {
        let registry = ProviderRegistry::new();

        for provider in &config.providers {
            match provider {
                ProviderConfig::Soft(soft) => {
                    let token = SoftToken::from_config(soft);
                    registry.add_session(ProviderSession::open(soft.id.clone(), Arc::new(token)))?;
                }
                #[cfg(feature = "hsm")]
                ProviderConfig::Pkcs11(pkcs11) => {
                    let tokens = Pkcs11Token::open_all(pkcs11).map_err(|e| Error::token(&pkcs11.name, e))?;
                    for (provider_id, token) in tokens {
                        registry.add_session(ProviderSession::open(provider_id, Arc::new(token)))?;
                    }
                }
            }
        }

        info!("Opened {} provider session(s)", registry.len());
        Ok(registry)
    }

    /// Adds a newly opened session.
    pub fn add_session(&self, session: ProviderSession) -> Result<Arc<ProviderSession>, Error> {
        let mut sessions = self.write();
        if sessions.contains_key(session.provider_id()) {
            return Err(Error::ProviderExists(session.provider_id().to_string()));
        }

        debug!(
            "Adding provider '{}' with token '{}', flags {:?}",
            session.provider_id(),
            session.label(),
            session.flags()
        );
        let session = Arc::new(session);
        sessions.insert(session.provider_id().to_string(), session.clone());
        Ok(session)
    }

    /// Removes a session, e.g. because its token went away.
    pub fn remove_session(&self, provider_id: &str) -> Option<Arc<ProviderSession>> {
        let removed = self.write().remove(provider_id);
        if removed.is_some() {
            debug!("Removed provider '{}'", provider_id);
        }
        removed
    }

    /// Finds the session for a provider.
    pub fn resolve(&self, provider_id: &str) -> Result<Arc<ProviderSession>, Error> {
        self.read()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(provider_id.to_string()))
    }

    /// Returns the ids of all providers, sorted.
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ProviderSession>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<ProviderSession>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn soft_session(id: &str, flags: TokenFlags) -> ProviderSession {
        ProviderSession::open(id, Arc::new(SoftToken::new("Token A", flags)))
    }

    #[test]
    fn resolve_known_and_unknown_providers() {
        let registry = ProviderRegistry::new();
        registry.add_session(soft_session("p1", TokenFlags::LOGIN_REQUIRED)).unwrap();

        let session = registry.resolve("p1").unwrap();
        assert_eq!(session.provider_id(), "p1");
        assert_eq!(session.label(), "Token A");
        assert_eq!(session.auth_state(), AuthState::LoggedOut);
        assert!(session.flags().login_required());

        match registry.resolve("p2") {
            Err(Error::ProviderNotFound(id)) => assert_eq!(id, "p2"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn duplicate_provider_ids_are_refused() {
        let registry = ProviderRegistry::new();
        registry.add_session(soft_session("p1", TokenFlags::NONE)).unwrap();

        assert!(matches!(
            registry.add_session(soft_session("p1", TokenFlags::NONE)),
            Err(Error::ProviderExists(_))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removed_provider_no_longer_resolves() {
        let registry = ProviderRegistry::new();
        registry.add_session(soft_session("b", TokenFlags::NONE)).unwrap();
        registry.add_session(soft_session("a", TokenFlags::NONE)).unwrap();
        assert_eq!(registry.provider_ids(), vec!["a".to_string(), "b".to_string()]);

        assert!(registry.remove_session("a").is_some());
        assert!(registry.remove_session("a").is_none());
        assert!(registry.resolve("a").is_err());
        assert_eq!(registry.provider_ids(), vec!["b".to_string()]);
    }

    #[test]
    fn session_of_logged_in_token_starts_logged_in() {
        let token = SoftToken::new("Token A", TokenFlags::LOGIN_REQUIRED);
        token.login(&secrecy::SecretString::new(String::new())).unwrap();

        let session = ProviderSession::open("p1", Arc::new(token));
        assert!(session.is_logged_in());
    }
}
