//! The command line front-end.
//!
//! Runs a single action against the configured providers. PIN requests are
//! answered from the console.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::{fmt, thread};

use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;

use crate::api::{ActionKind, ActionRequest, ActionResult, ActionStatus};
use crate::auth::AuthState;
use crate::config::Config;
use crate::constants::*;
use crate::dispatch::ActionRouter;
use crate::error::Error;
use crate::notify::{Event, EventKind, NotificationBridge, NotifyError, PinRequest, SubscriptionId};
use crate::registry::{ProviderRegistry, ProviderSession};

//------------ Options -------------------------------------------------------

/// The command line options for hsmgate.
#[derive(clap::Parser)]
#[command(
    version,
    about = "Runs token actions against the configured providers.",
)]
pub struct Options {
    #[command(flatten)]
    pub general: GeneralOptions,

    #[command(subcommand)]
    pub command: Command,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won't result in usable options, exits the process.
    pub fn from_args() -> Self {
        Self::parse()
    }
}

//------------ GeneralOptions ------------------------------------------------

#[derive(clap::Args)]
pub struct GeneralOptions {
    /// The configuration file.
    #[arg(
        short, long,
        env = HSMGATE_ENV_CONFIG,
        default_value = HSMGATE_DEFAULT_CONFIG_FILE,
    )]
    pub config: PathBuf,

    /// The origin reported with PIN requests.
    #[arg(long, default_value = CLI_ORIGIN)]
    pub origin: String,

    /// Report format
    #[arg(
        short, long,
        env = "HSMGATE_CLI_FORMAT",
        default_value = "text",
    )]
    pub format: ReportFormat,
}

//------------ Command -------------------------------------------------------

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the configured providers and their login state.
    Providers,

    /// Show whether a provider is logged in.
    Status(ProviderArg),

    /// Log in to a provider, asking for the PIN if needed.
    Login(ProviderArg),

    /// Log out of a provider.
    Logout(ProviderArg),

    /// Reset the session of a provider.
    Reset(ProviderArg),
}

#[derive(clap::Args)]
pub struct ProviderArg {
    /// The provider id.
    pub provider: String,
}

impl Command {
    pub async fn run(self, router: &ActionRouter, origin: &str) -> Result<Report, Error> {
        let (kind, provider) = match self {
            Command::Providers => {
                let registry = router.registry();
                let mut list = Vec::new();
                for id in registry.provider_ids() {
                    list.push(ProviderStatus::from(registry.resolve(&id)?.as_ref()));
                }
                return Ok(Report::Providers(list));
            }
            Command::Status(arg) => (ActionKind::IsLoggedIn, arg.provider),
            Command::Login(arg) => (ActionKind::Login, arg.provider),
            Command::Logout(arg) => (ActionKind::Logout, arg.provider),
            Command::Reset(arg) => (ActionKind::Reset, arg.provider),
        };

        let request = ActionRequest::new(kind, provider).with_id(uuid::Uuid::new_v4().to_string());
        Ok(Report::Action(router.handle(origin, request).await))
    }
}

//------------ run -----------------------------------------------------------

/// Sets up the providers from the configuration and runs the command.
pub async fn run(options: Options) -> Result<Report, Error> {
    let config = Config::create(&options.general.config)?;
    config.init_logging()?;

    let registry = Arc::new(ProviderRegistry::build(&config)?);
    let bridge = Arc::new(NotificationBridge::new());
    ConsolePrompt::attach(&bridge);
    log_events(&bridge);

    let router = ActionRouter::new(registry, bridge);
    options.command.run(&router, &options.general.origin).await
}

fn log_events(bridge: &NotificationBridge) {
    bridge.subscribe(EventKind::Error, |event| {
        if let Event::Error(err) = event {
            warn!("{}", err);
        }
    });
    bridge.subscribe(EventKind::Info, |event| {
        if let Event::Info(msg) = event {
            info!("{}", msg);
        }
    });
}

//------------ ConsolePrompt -------------------------------------------------

/// Answers PIN requests by asking on the terminal.
pub struct ConsolePrompt;

impl ConsolePrompt {
    pub fn attach(bridge: &NotificationBridge) -> SubscriptionId {
        bridge.subscribe(EventKind::Notify, |event| {
            if let Some(request) = event.pin_request() {
                let request = request.clone();
                // Reading from the terminal blocks, the bridge expects its
                // callbacks to return right away.
                thread::spawn(move || Self::prompt(request));
            }
        })
    }

    fn prompt(request: PinRequest) {
        debug!("Prompting for PIN request {}", request.id());
        let prompt = format!(
            "PIN for '{}' ({}, requested by {}): ",
            request.label(),
            request.provider_id(),
            request.origin()
        );
        match rpassword::prompt_password(prompt) {
            Ok(pin) if pin.is_empty() => {
                request.reject(NotifyError::new("cancelled"));
            }
            Ok(pin) => {
                request.resolve(pin);
            }
            Err(err) => {
                request.reject(NotifyError::new(format!("Cannot read PIN: {}", err)));
            }
        }
    }
}

//------------ ProviderStatus ------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub label: String,
    pub state: AuthState,
    pub login_required: bool,
    pub protected_authentication_path: bool,
}

impl From<&ProviderSession> for ProviderStatus {
    fn from(session: &ProviderSession) -> Self {
        ProviderStatus {
            provider_id: session.provider_id().to_string(),
            label: session.label(),
            state: session.auth_state(),
            login_required: session.flags().login_required(),
            protected_authentication_path: session.flags().protected_authentication_path(),
        }
    }
}

//------------ Report --------------------------------------------------------

/// The outcome of a command, ready to be shown to the user.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum Report {
    Providers(Vec<ProviderStatus>),
    Action(ActionResult),
}

impl Report {
    /// Whether the command achieved what it was asked to do.
    pub fn is_success(&self) -> bool {
        match self {
            Report::Providers(_) => true,
            Report::Action(result) => result.is_success(),
        }
    }

    pub fn format(&self, format: ReportFormat) -> Result<String, ReportError> {
        match format {
            ReportFormat::Json => serde_json::to_string_pretty(self).map_err(ReportError::Json),
            ReportFormat::Text => Ok(self.text()),
        }
    }

    fn text(&self) -> String {
        match self {
            Report::Providers(list) => {
                let mut res = String::new();
                for status in list {
                    res.push_str(&format!(
                        "{}\t{}\t{}\n",
                        status.provider_id, status.state, status.label
                    ));
                }
                res
            }
            Report::Action(result) => match &result.status {
                ActionStatus::Success { data } => {
                    if result.action == ACTION_IS_LOGGED_IN {
                        match data.first() {
                            Some(1) => AuthState::LoggedIn.to_string(),
                            _ => AuthState::LoggedOut.to_string(),
                        }
                    } else {
                        "ok".to_string()
                    }
                }
                ActionStatus::Failure { error } => format!("Error: {}", error),
            },
        }
    }
}

//------------ ReportFormat --------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportFormat {
    Json,
    Text,
}

impl FromStr for ReportFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, ReportError> {
        match s {
            "json" => Ok(ReportFormat::Json),
            "text" => Ok(ReportFormat::Text),
            _ => Err(ReportError::UnrecognisedFormat(s.to_string())),
        }
    }
}

//------------ ReportError ---------------------------------------------------

#[derive(Debug)]
pub enum ReportError {
    UnrecognisedFormat(String),
    Json(serde_json::Error),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReportError::UnrecognisedFormat(s) => write!(f, "This report format is not recognised: {}", s),
            ReportError::Json(e) => write!(f, "Cannot format report as JSON: {}", e),
        }
    }
}

impl std::error::Error for ReportError {}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::token::{SoftToken, TokenFlags};

    fn router() -> ActionRouter {
        let registry = ProviderRegistry::new();
        let flags = TokenFlags::LOGIN_REQUIRED | TokenFlags::PROTECTED_AUTHENTICATION_PATH;
        registry
            .add_session(ProviderSession::open("pad", Arc::new(SoftToken::new("Pad", flags))))
            .unwrap();
        registry
            .add_session(ProviderSession::open(
                "open",
                Arc::new(SoftToken::new("Open", TokenFlags::NONE)),
            ))
            .unwrap();
        ActionRouter::new(Arc::new(registry), Arc::new(NotificationBridge::new()))
    }

    #[test]
    fn parse_command_line() {
        let options = Options::try_parse_from([
            "hsmgate",
            "--config",
            "./defaults/hsmgate.conf",
            "--format",
            "json",
            "login",
            "soft0",
        ])
        .unwrap();

        assert_eq!(options.general.config, PathBuf::from("./defaults/hsmgate.conf"));
        assert_eq!(options.general.origin, CLI_ORIGIN);
        assert_eq!(options.general.format, ReportFormat::Json);
        assert!(matches!(options.command, Command::Login(ProviderArg { ref provider }) if provider == "soft0"));
    }

    #[test]
    fn unknown_format_is_refused() {
        assert!(Options::try_parse_from(["hsmgate", "--format", "xml", "providers"]).is_err());
    }

    #[tokio::test]
    async fn status_follows_login() {
        let router = router();

        let report = Command::Status(ProviderArg { provider: "pad".into() })
            .run(&router, "test")
            .await
            .unwrap();
        assert_eq!(report.format(ReportFormat::Text).unwrap(), "logged out");

        let report = Command::Login(ProviderArg { provider: "pad".into() })
            .run(&router, "test")
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.format(ReportFormat::Text).unwrap(), "ok");

        let report = Command::Status(ProviderArg { provider: "pad".into() })
            .run(&router, "test")
            .await
            .unwrap();
        assert_eq!(report.format(ReportFormat::Text).unwrap(), "logged in");
    }

    #[tokio::test]
    async fn providers_are_listed_in_order() {
        let report = Command::Providers.run(&router(), "test").await.unwrap();

        assert_eq!(
            report.format(ReportFormat::Text).unwrap(),
            "open\tlogged out\tOpen\npad\tlogged out\tPad\n"
        );

        let json: serde_json::Value = serde_json::from_str(&report.format(ReportFormat::Json).unwrap()).unwrap();
        assert_eq!(json[1]["provider_id"], "pad");
        assert_eq!(json[1]["state"], "logged-out");
        assert_eq!(json[1]["protected_authentication_path"], true);
    }

    #[tokio::test]
    async fn failed_action_is_reported() {
        let report = Command::Logout(ProviderArg { provider: "nope".into() })
            .run(&router(), "test")
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(report.format(ReportFormat::Text).unwrap().starts_with("Error: prov-unknown (2000): "));
    }
}
