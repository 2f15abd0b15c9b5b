//! Tokens in the slots of a PKCS#11 library.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CryptokiError, RvError};
use cryptoki::session::{Session, SessionState, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use log::{debug, error, trace, warn};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{Capabilities, Token, TokenError, TokenFlags};

/// Loaded PKCS#11 libraries by file name.
///
/// A library must be initialized only once per process, no matter how many
/// providers use slots of it. The file name rather than the full path is
/// used as the key so that two copies of the same library are not loaded
/// side by side.
static LIBRARIES: OnceLock<Mutex<HashMap<String, Pkcs11>>> = OnceLock::new();

//------------ Pkcs11ProviderConfig ------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct Pkcs11ProviderConfig {
    /// Prefix for the provider ids, one provider per slot is registered as
    /// `<name>-<slot id>`.
    pub name: String,

    /// Path to the PKCS#11 library.
    pub lib: PathBuf,

    /// The slot ids to open. All slots with a token present when empty.
    #[serde(default)]
    pub slots: Vec<u64>,

    /// Library specific initialization parameters, e.g. the configuration
    /// string of NSS.
    ///
    /// These would have to be passed in the `pReserved` field of the
    /// `C_Initialize` arguments which cannot be set through `cryptoki`.
    /// A provider that sets them is refused rather than loaded without them.
    #[serde(default)]
    pub library_parameters: Option<String>,
}

//------------ Pkcs11Token ---------------------------------------------------

pub struct Pkcs11Token {
    pkcs11: Pkcs11,
    slot: Slot,
    label: String,
    flags: TokenFlags,
    session: Mutex<Option<Session>>,
}

impl Pkcs11Token {
    /// Opens one token per configured slot, returning them with their
    /// provider ids.
    pub fn open_all(config: &Pkcs11ProviderConfig) -> Result<Vec<(String, Pkcs11Token)>, TokenError> {
        if config.library_parameters.is_some() {
            return Err(TokenError::Device(format!(
                "PKCS#11 provider '{}': library parameters are not supported",
                config.name
            )));
        }
        let pkcs11 = Self::get_or_load(&config.lib)?;

        let mut tokens = Vec::new();
        for slot in pkcs11.get_slots_with_token()? {
            if !config.slots.is_empty() && !config.slots.contains(&slot.id()) {
                continue;
            }
            let provider_id = format!("{}-{}", config.name, slot.id());
            match Self::open(pkcs11.clone(), slot) {
                Ok(token) => tokens.push((provider_id, token)),
                Err(err) => error!("Unable to open PKCS#11 slot {} of '{}': {}", slot.id(), config.name, err),
            }
        }

        for wanted in &config.slots {
            if !tokens.iter().any(|(_, token)| token.slot.id() == *wanted) {
                warn!("No token present in PKCS#11 slot {} of '{}'", wanted, config.name);
            }
        }

        Ok(tokens)
    }

    fn open(pkcs11: Pkcs11, slot: Slot) -> Result<Self, TokenError> {
        let info = pkcs11.get_token_info(slot)?;
        trace!("C_GetTokenInfo({}): {:?}", slot.id(), info);

        let mut flags = TokenFlags::NONE;
        if info.rng() {
            flags |= TokenFlags::RNG;
        }
        if info.write_protected() {
            flags |= TokenFlags::WRITE_PROTECTED;
        }
        if info.login_required() {
            flags |= TokenFlags::LOGIN_REQUIRED;
        }
        if info.user_pin_initialized() {
            flags |= TokenFlags::USER_PIN_INITIALIZED;
        }
        if info.protected_authentication_path() {
            flags |= TokenFlags::PROTECTED_AUTHENTICATION_PATH;
        }
        if info.token_initialized() {
            flags |= TokenFlags::TOKEN_INITIALIZED;
        }

        let session = pkcs11.open_rw_session(slot)?;
        debug!("Opened PKCS#11 session for slot {} ({})", slot.id(), info.label().trim());

        Ok(Pkcs11Token {
            label: info.label().trim().to_string(),
            pkcs11,
            slot,
            flags,
            session: Mutex::new(Some(session)),
        })
    }

    fn get_or_load(lib_path: &Path) -> Result<Pkcs11, TokenError> {
        let lib_file_name = lib_path
            .file_name()
            .ok_or_else(|| {
                TokenError::Device(format!(
                    "PKCS#11 library path '{}' does not point to a file",
                    lib_path.display()
                ))
            })?
            .to_string_lossy()
            .to_string();

        let mut libraries = LIBRARIES
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(pkcs11) = libraries.get(&lib_file_name) {
            return Ok(pkcs11.clone());
        }

        let pkcs11 = Pkcs11::new(lib_path)?;
        pkcs11.initialize(CInitializeArgs::OsThreads)?;
        debug!("Loaded PKCS#11 library '{}'", lib_path.display());

        libraries.insert(lib_file_name, pkcs11.clone());
        Ok(pkcs11)
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Pkcs11Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pkcs11Token")
            .field("slot", &self.slot.id())
            .field("label", &self.label)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Token for Pkcs11Token {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn flags(&self) -> TokenFlags {
        self.flags
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::all()
    }

    /// Login state is shared by all sessions of an application with the
    /// token, so another provider on the same library may have logged in
    /// already.
    fn is_logged_in(&self) -> bool {
        match self.session().as_ref().map(Session::get_session_info) {
            Some(Ok(info)) => user_logged_in(info.session_state()),
            Some(Err(err)) => {
                warn!("Cannot read PKCS#11 session state of slot {}: {}", self.slot.id(), err);
                false
            }
            None => false,
        }
    }

    fn login(&self, pin: &SecretString) -> Result<(), TokenError> {
        let mut session = self.session();
        if session.is_none() {
            *session = Some(self.pkcs11.open_rw_session(self.slot)?);
        }
        let session = session.as_ref().ok_or(TokenError::Device("no session".to_string()))?;

        // With a protected authentication path the PIN must be NULL.
        let res = if pin.expose_secret().is_empty() {
            session.login(UserType::User, None)
        } else {
            let pin = AuthPin::new(pin.expose_secret().clone().into());
            session.login(UserType::User, Some(&pin))
        };

        match res {
            Ok(()) => Ok(()),
            Err(CryptokiError::Pkcs11(RvError::UserAlreadyLoggedIn, _)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn logout(&self) -> Result<(), TokenError> {
        match self.session().as_ref() {
            None => Ok(()),
            Some(session) => match session.logout() {
                Ok(()) => Ok(()),
                Err(CryptokiError::Pkcs11(RvError::UserNotLoggedIn, _)) => Ok(()),
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Closes the session and opens a fresh one. Closing the last session of
    /// the application returns the token to the public login state.
    fn reset(&self) -> Result<(), TokenError> {
        let mut session = self.session();
        drop(session.take());
        *session = Some(self.pkcs11.open_rw_session(self.slot)?);
        Ok(())
    }
}

fn user_logged_in(state: SessionState) -> bool {
    matches!(
        state,
        SessionState::RoUser | SessionState::RwUser | SessionState::RwSecurityOfficer
    )
}

impl From<CryptokiError> for TokenError {
    fn from(err: CryptokiError) -> Self {
        match err {
            CryptokiError::Pkcs11(RvError::PinIncorrect, _) => TokenError::PinIncorrect,
            CryptokiError::Pkcs11(RvError::PinLocked, _) => TokenError::PinLocked,
            CryptokiError::Pkcs11(RvError::FunctionCanceled, _) => TokenError::LoginCancelled,
            err => TokenError::Pkcs11(err),
        }
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_authenticated_session_states_count_as_logged_in() {
        assert!(!user_logged_in(SessionState::RoPublic));
        assert!(!user_logged_in(SessionState::RwPublic));
        assert!(user_logged_in(SessionState::RoUser));
        assert!(user_logged_in(SessionState::RwUser));
        assert!(user_logged_in(SessionState::RwSecurityOfficer));
    }

    #[test]
    fn library_parameters_are_refused() {
        let config: Pkcs11ProviderConfig = toml::from_str(
            r#"
            name = "nss"
            lib = "/usr/lib/libsoftokn3.so"
            library_parameters = "configdir='sql:/tmp/nss' flags=readOnly"
            "#,
        )
        .unwrap();
        assert!(config.slots.is_empty());

        match Pkcs11Token::open_all(&config) {
            Err(TokenError::Device(msg)) => assert!(msg.contains("library parameters")),
            other => panic!("unexpected: {:?}", other.map(|tokens| tokens.len())),
        }
    }
}
