//! The notification bridge between the authentication core and observers.
//!
//! Observers attach to one of three event kinds: `notify` events ask the
//! observer for something, currently only a PIN, and carry a completion that
//! the observer fires once it has an answer; `error` and `info` events are
//! purely informational.
//!
//! Observers are either callbacks, invoked synchronously while an event is
//! published, or channels which receive a clone of every matching event.
//! Callbacks must not block: an observer that needs time to obtain a PIN
//! keeps a clone of the [`PinRequest`] and answers it later.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use log::{debug, trace};
use secrecy::SecretString;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::api::ErrorResponse;
use crate::error::Error;

//------------ EventKind -----------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    Notify,
    Error,
    Info,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventKind::Notify => write!(f, "notify"),
            EventKind::Error => write!(f, "error"),
            EventKind::Info => write!(f, "info"),
        }
    }
}

//------------ Event ---------------------------------------------------------

#[derive(Clone, Debug)]
pub enum Event {
    Notify(Notification),
    Error(ErrorResponse),
    Info(String),
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Notify(_) => EventKind::Notify,
            Event::Error(_) => EventKind::Error,
            Event::Info(_) => EventKind::Info,
        }
    }

    pub fn error(error: &Error) -> Self {
        Event::Error(error.to_error_response())
    }

    pub fn info(msg: impl Into<String>) -> Self {
        Event::Info(msg.into())
    }

    /// Returns the PIN request carried by a `notify` event.
    pub fn pin_request(&self) -> Option<&PinRequest> {
        match self {
            Event::Notify(Notification::Pin(request)) => Some(request),
            _ => None,
        }
    }
}

//------------ Notification --------------------------------------------------

/// The payload of a `notify` event.
#[derive(Clone, Debug)]
pub enum Notification {
    Pin(PinRequest),
}

impl Notification {
    /// The type of the notification as shown to observers.
    pub fn notification_type(&self) -> &'static str {
        match self {
            Notification::Pin(_) => "pin",
        }
    }
}

//------------ PinRequest ----------------------------------------------------

/// An outstanding request for the PIN of a token.
///
/// Clones share the same completion: whichever clone resolves or rejects
/// first decides the outcome, later attempts are ignored.
#[derive(Clone)]
pub struct PinRequest {
    id: Uuid,
    origin: String,
    label: String,
    provider_id: String,
    completion: Arc<Mutex<Option<PinSender>>>,
}

type PinSender = oneshot::Sender<Result<SecretString, NotifyError>>;

impl PinRequest {
    /// Creates a new request and the receiving end that the login waits on.
    pub fn new(origin: &str, label: &str, provider_id: &str) -> (Self, PinResponse) {
        let (tx, rx) = oneshot::channel();
        let request = PinRequest {
            id: Uuid::new_v4(),
            origin: origin.to_string(),
            label: label.to_string(),
            provider_id: provider_id.to_string(),
            completion: Arc::new(Mutex::new(Some(tx))),
        };
        (request, PinResponse(rx))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The caller on whose behalf the PIN is requested.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The label of the token to show to the user.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Answers the request with a PIN.
    ///
    /// Returns whether this call settled the request.
    pub fn resolve(&self, pin: impl Into<String>) -> bool {
        self.complete(Ok(SecretString::new(pin.into())))
    }

    /// Declines the request. The error is handed to the caller of the login
    /// unchanged.
    pub fn reject(&self, error: NotifyError) -> bool {
        self.complete(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn complete(&self, outcome: Result<SecretString, NotifyError>) -> bool {
        let sender = self.completion.lock().unwrap_or_else(PoisonError::into_inner).take();
        match sender {
            Some(sender) => {
                if sender.send(outcome).is_err() {
                    debug!("PIN request {} answered after the login went away", self.id);
                }
                true
            }
            None => {
                debug!("PIN request {} was already answered", self.id);
                false
            }
        }
    }
}

impl fmt::Debug for PinRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PinRequest")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("label", &self.label)
            .field("provider_id", &self.provider_id)
            .field("settled", &self.is_settled())
            .finish()
    }
}

//------------ PinResponse ---------------------------------------------------

/// The receiving end of a [`PinRequest`].
#[derive(Debug)]
pub struct PinResponse(oneshot::Receiver<Result<SecretString, NotifyError>>);

impl PinResponse {
    /// Waits until the request is resolved or rejected.
    ///
    /// If every copy of the request is dropped without an answer this
    /// returns [`PinOutcome::Abandoned`]. As long as an observer holds on to
    /// the request, this waits.
    pub async fn wait(self) -> PinOutcome {
        match self.0.await {
            Ok(Ok(pin)) => PinOutcome::Resolved(pin),
            Ok(Err(error)) => PinOutcome::Rejected(error),
            Err(_) => PinOutcome::Abandoned,
        }
    }
}

#[derive(Debug)]
pub enum PinOutcome {
    Resolved(SecretString),
    Rejected(NotifyError),
    Abandoned,
}

//------------ NotifyError ---------------------------------------------------

/// The error an observer declines a request with.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotifyError {
    code: u16,
    label: String,
    msg: String,
}

impl NotifyError {
    pub fn new(msg: impl fmt::Display) -> Self {
        NotifyError {
            code: 2102,
            label: "auth-pin-rejected".to_string(),
            msg: msg.to_string(),
        }
    }

    /// Overrides the code and label reported to the caller.
    pub fn with_code(mut self, code: u16, label: &str) -> Self {
        self.code = code;
        self.label = label.to_string();
        self
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code, &self.label, &self.msg)
    }
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.msg)
    }
}

impl std::error::Error for NotifyError {}

//------------ SubscriptionId ------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

//------------ NotificationBridge --------------------------------------------

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

enum Observer {
    Callback(Callback),
    Channel(mpsc::UnboundedSender<Event>),
}

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    once: bool,
    observer: Observer,
}

impl Subscription {
    fn is_closed(&self) -> bool {
        match &self.observer {
            Observer::Callback(_) => false,
            Observer::Channel(tx) => tx.is_closed(),
        }
    }
}

/// Delivers events to the observers attached for their kind.
#[derive(Default)]
pub struct NotificationBridge {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl NotificationBridge {
    pub fn new() -> Self {
        NotificationBridge::default()
    }

    /// Attaches a callback for all events of the given kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, false, Observer::Callback(Arc::new(handler)))
    }

    /// Attaches a callback for the next event of the given kind only.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, true, Observer::Callback(Arc::new(handler)))
    }

    /// Attaches a channel receiving all events of the given kind.
    ///
    /// The subscription ends when the receiver is dropped.
    pub fn subscribe_channel(&self, kind: EventKind) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.add(kind, false, Observer::Channel(tx));
        (id, rx)
    }

    /// Detaches an observer. Returns whether it was still attached.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.write();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != id);
        subscriptions.len() != before
    }

    /// The number of observers currently attached for a kind.
    pub fn observer_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sub| sub.kind == kind && !sub.is_closed())
            .count()
    }

    /// Delivers an event to all observers attached for its kind.
    ///
    /// Returns whether any observer received the event.
    pub fn publish(&self, event: Event) -> bool {
        let kind = event.kind();

        // Collect the observers first so that callbacks run without the lock
        // held and may subscribe or unsubscribe themselves.
        let mut callbacks: Vec<Callback> = Vec::new();
        let mut delivered = false;
        {
            let mut subscriptions = self.write();
            subscriptions.retain(|sub| !sub.is_closed());
            subscriptions.retain(|sub| {
                if sub.kind != kind {
                    return true;
                }
                match &sub.observer {
                    Observer::Callback(callback) => {
                        callbacks.push(callback.clone());
                        delivered = true;
                    }
                    Observer::Channel(tx) => {
                        if tx.send(event.clone()).is_ok() {
                            delivered = true;
                        }
                    }
                }
                !sub.once
            });
        }

        for callback in callbacks {
            callback(&event);
        }

        if delivered {
            trace!("Published {} event", kind);
        } else {
            debug!("No observer attached for {} event", kind);
        }
        delivered
    }

    fn add(&self, kind: EventKind, once: bool, observer: Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push(Subscription {
            id,
            kind,
            once,
            observer,
        });
        trace!("Observer {:?} attached for {} events", id, kind);
        id
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for NotificationBridge {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("NotificationBridge")
            .field("notify", &self.observer_count(EventKind::Notify))
            .field("error", &self.observer_count(EventKind::Error))
            .field("info", &self.observer_count(EventKind::Info))
            .finish()
    }
}

//------------ Tests ---------------------------------------------------------
