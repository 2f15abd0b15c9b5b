//! Access to the cryptographic tokens behind the providers.
//!
//! A [`Token`] is the live handle to one slot of a PKCS#11 library, or to a
//! software equivalent. The authentication core only needs a small part of
//! what a token can do: its label, its flags, and the optional login, logout
//! and reset calls. Which of the optional calls a token supports is declared
//! up front through its [`Capabilities`], rather than probed on every call.

pub mod soft;

#[cfg(feature = "hsm")]
pub mod pkcs11;

use std::{fmt, ops};

use secrecy::SecretString;
use serde::de;
use serde::{Deserialize, Deserializer};

pub use self::soft::SoftToken;

#[cfg(feature = "hsm")]
pub use self::pkcs11::Pkcs11Token;

//------------ TokenFlags ----------------------------------------------------

/// The capability bits a token reports about itself.
///
/// The bit values are those of the PKCS#11 `CK_TOKEN_INFO` flags so that
/// flags read from a PKCS#11 library can be used as is.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct TokenFlags(u64);

impl TokenFlags {
    pub const NONE: TokenFlags = TokenFlags(0);
    pub const RNG: TokenFlags = TokenFlags(0x0000_0001);
    pub const WRITE_PROTECTED: TokenFlags = TokenFlags(0x0000_0002);
    pub const LOGIN_REQUIRED: TokenFlags = TokenFlags(0x0000_0004);
    pub const USER_PIN_INITIALIZED: TokenFlags = TokenFlags(0x0000_0008);
    pub const PROTECTED_AUTHENTICATION_PATH: TokenFlags = TokenFlags(0x0000_0100);
    pub const TOKEN_INITIALIZED: TokenFlags = TokenFlags(0x0000_0400);

    const NAMES: &'static [(&'static str, TokenFlags)] = &[
        ("rng", Self::RNG),
        ("write_protected", Self::WRITE_PROTECTED),
        ("login_required", Self::LOGIN_REQUIRED),
        ("user_pin_initialized", Self::USER_PIN_INITIALIZED),
        ("protected_authentication_path", Self::PROTECTED_AUTHENTICATION_PATH),
        ("token_initialized", Self::TOKEN_INITIALIZED),
    ];

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, other: TokenFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn login_required(self) -> bool {
        self.contains(Self::LOGIN_REQUIRED)
    }

    pub fn protected_authentication_path(self) -> bool {
        self.contains(Self::PROTECTED_AUTHENTICATION_PATH)
    }

    /// Looks up a single flag by its configuration name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(flag_name, _)| *flag_name == name)
            .map(|(_, flag)| *flag)
    }
}

impl ops::BitOr for TokenFlags {
    type Output = TokenFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        TokenFlags(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for TokenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0
    }
}

impl fmt::Debug for TokenFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(_, flag)| self.contains(*flag))
            .map(|(name, _)| *name)
            .collect();
        write!(f, "TokenFlags({:#x} [{}])", self.0, names.join(", "))
    }
}

/// Flags are configured as a list of names, e.g. `["login_required"]`.
impl<'de> Deserialize<'de> for TokenFlags {
    fn deserialize<D>(d: D) -> Result<TokenFlags, D::Error>
    where
        D: Deserializer<'de>,
    {
        let names = Vec::<String>::deserialize(d)?;
        let mut flags = TokenFlags::NONE;
        for name in names {
            match TokenFlags::from_name(&name) {
                Some(flag) => flags |= flag,
                None => return Err(de::Error::custom(format!("unknown token flag: \"{}\"", name))),
            }
        }
        Ok(flags)
    }
}

//------------ Capabilities --------------------------------------------------

/// The optional operations a token supports.
///
/// Absence of an operation is a valid configuration: the corresponding
/// action then succeeds without doing anything.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub login: bool,
    pub logout: bool,
    pub reset: bool,
}

impl Capabilities {
    pub fn all() -> Self {
        Capabilities {
            login: true,
            logout: true,
            reset: true,
        }
    }

    pub fn none() -> Self {
        Capabilities::default()
    }
}

//------------ Token ---------------------------------------------------------

/// The live handle to one token.
///
/// Implementations are called from the blocking thread pool and are allowed
/// to block.
pub trait Token: fmt::Debug + Send + Sync {
    /// The current human readable label of the token.
    fn label(&self) -> String;

    fn flags(&self) -> TokenFlags;

    /// The optional operations this token supports.
    ///
    /// This is read once when a provider session is opened.
    fn capabilities(&self) -> Capabilities;

    /// Whether the token already considers the user logged in.
    ///
    /// Only used to seed the authentication state when a session is opened.
    fn is_logged_in(&self) -> bool {
        false
    }

    /// Logs the user in. An empty PIN is used for tokens that collect the
    /// credential through their protected authentication path.
    fn login(&self, _pin: &SecretString) -> Result<(), TokenError> {
        Err(TokenError::Unsupported("login"))
    }

    fn logout(&self) -> Result<(), TokenError> {
        Err(TokenError::Unsupported("logout"))
    }

    /// Clears all credential state held for this token.
    fn reset(&self) -> Result<(), TokenError> {
        Err(TokenError::Unsupported("reset"))
    }
}

//------------ TokenError ----------------------------------------------------

#[derive(Debug)]
pub enum TokenError {
    /// The token does not support the operation.
    Unsupported(&'static str),

    /// The token rejected the PIN.
    PinIncorrect,

    /// The PIN is blocked after too many failed attempts.
    PinLocked,

    /// The token or the user aborted the login, e.g. on a PIN pad.
    LoginCancelled,

    /// Any other failure reported by the token or its library.
    Device(String),

    #[cfg(feature = "hsm")]
    Pkcs11(cryptoki::error::Error),
}

impl TokenError {
    /// Whether the token declined the credential rather than failing.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            TokenError::PinIncorrect | TokenError::PinLocked | TokenError::LoginCancelled
        )
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TokenError::Unsupported(op) => write!(f, "Token does not support {}", op),
            TokenError::PinIncorrect => write!(f, "Incorrect PIN"),
            TokenError::PinLocked => write!(f, "PIN is locked"),
            TokenError::LoginCancelled => write!(f, "Login was cancelled"),
            TokenError::Device(e) => write!(f, "Device error: {}", e),
            #[cfg(feature = "hsm")]
            TokenError::Pkcs11(e) => write!(f, "PKCS#11 error: {}", e),
        }
    }
}

impl std::error::Error for TokenError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_test() {
        let flags = TokenFlags::LOGIN_REQUIRED | TokenFlags::PROTECTED_AUTHENTICATION_PATH;

        assert!(flags.login_required());
        assert!(flags.protected_authentication_path());
        assert!(!flags.contains(TokenFlags::RNG));
        assert_eq!(flags.bits(), 0x104);
        assert!(!TokenFlags::NONE.login_required());
    }

    #[test]
    fn flags_deserialize_from_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            flags: TokenFlags,
        }

        let w: Wrapper = toml::from_str(r#"flags = ["login_required", "rng"]"#).unwrap();
        assert_eq!(w.flags, TokenFlags::LOGIN_REQUIRED | TokenFlags::RNG);

        assert!(toml::from_str::<Wrapper>(r#"flags = ["fingerprint"]"#).is_err());
    }

    #[test]
    fn only_credential_refusals_count_as_rejection() {
        assert!(TokenError::PinIncorrect.is_rejection());
        assert!(TokenError::PinLocked.is_rejection());
        assert!(!TokenError::Device("gone".into()).is_rejection());
        assert!(!TokenError::Unsupported("login").is_rejection());
    }
}
