//! Authorization requests
//!
//! A request is created from an inbound call, started when the manager
//! registers it, and completed exactly once. Completion consumes the reply
//! sink, so a second reply cannot be expressed.
//!
//! ```text
//! Created --start()--> InProgress --succeed | cancel | fail--> Completed
//! ```
//!
//! Completing a request that was never started is a silent no-op: no reply
//! is sent and the state stays `Created`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::consent::ConsentGate;
use crate::error::{BrokerError, ErrorKind};
use crate::params::{
    self, Parameters, ParametersExt, KEY_APPLICATION_ID, KEY_CLIENT_DATA, KEY_CLIENT_PROVIDER_ID,
    KEY_IDENTITY, KEY_MECHANISM, KEY_METHOD, KEY_OPEN_URL, KEY_PID, KEY_PROVIDER, KEY_QUERY_PASSWORD, KEY_QUERY_USERNAME,
    KEY_REQUEST_ID, KEY_SERVICE_TYPE, KEY_WINDOW_ID,
};
use crate::trust::ApplicationInfo;
use crate::window::{NativeWindowId, WindowError, WindowHandle};

/// Process-unique request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Logical inbound interface a call arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interface {
    /// Provider/account centric access requests
    Accounts,
    /// Prompts forwarded by the credential store
    SignOn,
}

impl Interface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accounts => "accounts",
            Self::SignOn => "signon",
        }
    }
}

/// Concrete request variant, derived once at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Account settings panel
    Panel,
    /// Access to accounts of one provider
    Provider,
    /// Credentials dialog for an existing identity
    Dialog,
    /// Web authentication for an existing identity
    Browser,
}

const PROVIDER_DEDUP_KEYS: &[&str] = &[KEY_PROVIDER, KEY_APPLICATION_ID, KEY_SERVICE_TYPE];
const SIGNON_DEDUP_KEYS: &[&str] = &[KEY_IDENTITY, KEY_METHOD, KEY_MECHANISM];

impl RequestKind {
    /// Pick the variant able to handle `parameters`
    pub fn classify(interface: Interface, parameters: &Parameters) -> Result<Self, BrokerError> {
        for key in [KEY_WINDOW_ID, KEY_IDENTITY, KEY_PID] {
            if let Err(e) = parameters.u32_value(key) {
                return Err(invalid(e.to_string()));
            }
        }

        match interface {
            Interface::Accounts => {
                if let Some(value) = parameters.get(KEY_SERVICE_TYPE) {
                    if !value.is_string() {
                        return Err(invalid(format!("'{}' must be a string", KEY_SERVICE_TYPE)));
                    }
                }
                if parameters.contains_key(KEY_PROVIDER) {
                    match parameters.str_value(KEY_PROVIDER) {
                        Some(provider) if !provider.is_empty() => Ok(Self::Provider),
                        _ => Err(invalid(format!("'{}' must be a non-empty string", KEY_PROVIDER))),
                    }
                } else {
                    Ok(Self::Panel)
                }
            }
            Interface::SignOn => {
                match parameters.str_value(KEY_REQUEST_ID) {
                    Some(id) if !id.is_empty() => {}
                    _ => return Err(invalid(format!("missing '{}'", KEY_REQUEST_ID))),
                }
                if !parameters.contains_key(KEY_OPEN_URL) {
                    return Ok(Self::Dialog);
                }
                match parameters.str_value(KEY_OPEN_URL) {
                    Some(url) if !url.is_empty() => {}
                    _ => return Err(invalid(format!("'{}' must be a non-empty string", KEY_OPEN_URL))),
                }
                let wants_dialog = [KEY_QUERY_USERNAME, KEY_QUERY_PASSWORD]
                    .iter()
                    .any(|key| parameters.get(*key).and_then(|v| v.as_bool()) == Some(true));
                if wants_dialog {
                    return Err(invalid(
                        "a web authentication cannot also query credentials".to_string(),
                    ));
                }
                Ok(Self::Browser)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Panel => "panel",
            Self::Provider => "provider",
            Self::Dialog => "dialog",
            Self::Browser => "browser",
        }
    }

    pub fn interface(&self) -> Interface {
        match self {
            Self::Panel | Self::Provider => Interface::Accounts,
            Self::Dialog | Self::Browser => Interface::SignOn,
        }
    }

    /// Whether equivalent requests may be outstanding at the same time
    pub fn allow_multiple(&self) -> bool {
        matches!(self, Self::Panel)
    }

    /// Keys whose values identify equivalent requests
    pub fn dedup_keys(&self) -> &'static [&'static str] {
        match self {
            Self::Panel => &[],
            Self::Provider => PROVIDER_DEDUP_KEYS,
            Self::Dialog | Self::Browser => SIGNON_DEDUP_KEYS,
        }
    }

    /// Whether a window may only be shown after explicit user consent
    pub fn requires_consent(&self) -> bool {
        self.interface() == Interface::SignOn
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn invalid(message: String) -> BrokerError {
    BrokerError::InvalidParameters(message)
}

/// Reply delivered to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Result(Parameters),
    Error { kind: ErrorKind, message: String },
}

impl Reply {
    /// Empty acknowledgment
    pub fn empty() -> Self {
        Self::Result(Parameters::new())
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }
}

/// The single reply channel back to a caller
#[derive(Debug)]
pub struct ReplySink(oneshot::Sender<Reply>);

impl ReplySink {
    /// Create a sink and the receiver its reply arrives on
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Deliver the reply. A caller that has gone away is not an error.
    pub fn send(self, reply: Reply) {
        if self.0.send(reply).is_err() {
            debug!("Caller went away before the reply was sent");
        }
    }
}

/// Who sent a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    /// Unique connection identifier on the bus
    pub connection: String,
    /// Resolved confinement profile; empty when unknown
    pub profile: String,
}

impl Caller {
    pub fn new(connection: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            connection: connection.into(),
            profile: profile.into(),
        }
    }
}

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Canceled,
    Failed(ErrorKind),
}

/// Request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    Created,
    InProgress,
    Completed(Outcome),
}

/// One in-flight authorization request
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    kind: RequestKind,
    parameters: Parameters,
    caller: Caller,
    created_at: DateTime<Utc>,
    state: RequestState,
    reply: Option<ReplySink>,
    window: Option<WindowHandle>,
    consent: Option<ConsentGate>,
    application: Option<ApplicationInfo>,
}

impl Request {
    pub fn new(
        id: RequestId,
        kind: RequestKind,
        parameters: Parameters,
        caller: Caller,
        reply: ReplySink,
    ) -> Self {
        Self {
            id,
            kind,
            parameters,
            caller,
            created_at: Utc::now(),
            state: RequestState::Created,
            reply: Some(reply),
            window: None,
            consent: None,
            application: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn interface(&self) -> Interface {
        self.kind.interface()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn caller(&self) -> &Caller {
        &self.caller
    }

    /// Confinement profile the request is attributed to
    pub fn caller_profile(&self) -> &str {
        &self.caller.profile
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == RequestState::InProgress
    }

    pub fn allow_multiple(&self) -> bool {
        self.kind.allow_multiple()
    }

    /// Subset of the parameters identifying equivalent requests
    pub fn dedup_key(&self) -> Parameters {
        params::subset(&self.parameters, self.kind.dedup_keys())
    }

    /// Caller-supplied native window, if any
    pub fn window_id(&self) -> Option<NativeWindowId> {
        match self.parameters.u32_value(KEY_WINDOW_ID) {
            Ok(Some(id)) if id != 0 => Some(NativeWindowId(id)),
            _ => None,
        }
    }

    /// Credentials identity targeted by a sign-on request; 0 when absent
    pub fn identity(&self) -> u32 {
        self.parameters
            .u32_value(KEY_IDENTITY)
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Provider the credential store named in `clientData`
    pub fn client_provider(&self) -> Option<&str> {
        self.parameters
            .get(KEY_CLIENT_DATA)?
            .get(KEY_CLIENT_PROVIDER_ID)?
            .as_str()
    }

    pub fn window(&self) -> Option<WindowHandle> {
        self.window
    }

    pub fn application(&self) -> Option<&ApplicationInfo> {
        self.application.as_ref()
    }

    pub fn set_application(&mut self, application: ApplicationInfo) {
        self.application = Some(application);
    }

    pub fn consent(&self) -> Option<&ConsentGate> {
        self.consent.as_ref()
    }

    pub fn consent_mut(&mut self) -> Option<&mut ConsentGate> {
        self.consent.as_mut()
    }

    /// Whether a consent session is waiting for the user
    pub fn consent_pending(&self) -> bool {
        self.consent.as_ref().map_or(false, ConsentGate::is_pending)
    }

    pub fn open_consent(&mut self, gate: ConsentGate) {
        self.consent = Some(gate);
    }

    /// Record the window shown for this request. Valid once, while in
    /// progress.
    pub fn set_window(&mut self, window: WindowHandle) -> Result<(), WindowError> {
        if !self.is_in_progress() {
            return Err(WindowError::NotInProgress(self.id));
        }
        if self.window.is_some() {
            return Err(WindowError::AlreadyShown(self.id));
        }
        self.window = Some(window);
        Ok(())
    }

    pub fn start(&mut self) {
        if self.state != RequestState::Created {
            warn!(request = %self.id, state = ?self.state, "Request already started!");
            return;
        }
        self.state = RequestState::InProgress;
        debug!(request = %self.id, kind = %self.kind, "Request started");
    }

    /// Reply with `result`. Returns the outcome if this completed the request.
    pub fn succeed(&mut self, result: Parameters) -> Option<Outcome> {
        self.complete(Reply::Result(result), Outcome::Succeeded)
    }

    /// Reply with an error. Returns the outcome if this completed the request.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Option<Outcome> {
        let outcome = match kind {
            ErrorKind::UserCanceled => Outcome::Canceled,
            other => Outcome::Failed(other),
        };
        self.complete(Reply::error(kind, message), outcome)
    }

    pub fn cancel(&mut self) -> Option<Outcome> {
        self.fail(ErrorKind::UserCanceled, "Canceled")
    }

    /// Drop a request that was never registered, acknowledging the caller
    /// with an empty reply
    pub fn acknowledge(mut self) {
        if let Some(reply) = self.reply.take() {
            reply.send(Reply::empty());
        }
    }

    fn complete(&mut self, reply: Reply, outcome: Outcome) -> Option<Outcome> {
        if self.state != RequestState::InProgress {
            debug!(request = %self.id, state = ?self.state, "Ignoring completion");
            return None;
        }

        self.state = RequestState::Completed(outcome);
        self.window = None;
        self.consent = None;
        if let Some(sink) = self.reply.take() {
            sink.send(reply);
        }
        debug!(request = %self.id, ?outcome, "Request completed");
        Some(outcome)
    }
}
