//! Various hsmgate-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `hsmgate` binary.
pub const HSMGATE_APP: &str = "hsmgate";


//------------ Config Files Paths -------------------------------------------

/// The default path to the hsmgate config file.
pub const HSMGATE_DEFAULT_CONFIG_FILE: &str = "/etc/hsmgate.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable overriding the config file path.
pub const HSMGATE_ENV_CONFIG: &str = "HSMGATE_CONFIG";

/// The environment variable overriding the default log level.
pub const HSMGATE_ENV_LOG_LEVEL: &str = "HSMGATE_LOG_LEVEL";


//------------ Actions ------------------------------------------------------

/// The action tag for querying the authentication state of a provider.
pub const ACTION_IS_LOGGED_IN: &str = "crypto/isLoggedIn";

/// The action tag for logging in to a provider.
pub const ACTION_LOGIN: &str = "crypto/login";

/// The action tag for logging out of a provider.
pub const ACTION_LOGOUT: &str = "crypto/logout";

/// The action tag for resetting a provider session.
pub const ACTION_RESET: &str = "crypto/reset";


//------------ Origins ------------------------------------------------------

/// The origin used for actions initiated from the local command line.
pub const CLI_ORIGIN: &str = "cli";
