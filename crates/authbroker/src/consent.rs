//! Consent gate
//!
//! Requests that would let a third party use stored credentials must be
//! approved by the user before any credential-bearing window is shown. The
//! gate holds the window back, shows a snap decision with two actions, and
//! yields exactly one [`Decision`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::Account;
use crate::request::RequestId;
use crate::window::WindowHandle;

pub const ACTION_CANCEL: &str = "cancel";
pub const ACTION_CONTINUE: &str = "continue";

const PROMPT_TITLE: &str = "Authentication request";

/// An action offered on the consent surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAction {
    pub key: String,
    pub label: String,
}

/// What the user is asked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentPrompt {
    pub title: String,
    pub summary: String,
    pub actions: Vec<PromptAction>,
    /// Modal decision that stays until the user acts on it
    pub snap_decision: bool,
}

impl ConsentPrompt {
    pub fn new(application: &str, provider: &str, account: &str) -> Self {
        Self {
            title: PROMPT_TITLE.to_string(),
            summary: format!(
                "Please authorize {} to access your {} account {}",
                application, provider, account
            ),
            actions: vec![
                PromptAction {
                    key: ACTION_CANCEL.to_string(),
                    label: "Cancel".to_string(),
                },
                PromptAction {
                    key: ACTION_CONTINUE.to_string(),
                    label: "Authorize...".to_string(),
                },
            ],
            snap_decision: true,
        }
    }
}

/// Gate lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentState {
    Pending,
    Granted,
    Denied,
}

/// Outcome of a consent session, produced once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Show the held window
    Granted(WindowHandle),
    Denied,
}

/// Consent session bound to a single request
#[derive(Debug, Clone)]
pub struct ConsentGate {
    state: ConsentState,
    window: WindowHandle,
    account: Account,
}

impl ConsentGate {
    /// Open a pending session holding `window` back
    pub fn open(account: Account, window: WindowHandle) -> Self {
        Self {
            state: ConsentState::Pending,
            window,
            account,
        }
    }

    pub fn state(&self) -> ConsentState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == ConsentState::Pending
    }

    /// Account the user is asked about
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// React to an action invoked on the surface.
    ///
    /// Anything but "continue" denies. Returns `None` once decided.
    pub fn on_action(&mut self, action: &str) -> Option<Decision> {
        if !self.is_pending() {
            return None;
        }

        if action == ACTION_CONTINUE {
            self.state = ConsentState::Granted;
            Some(Decision::Granted(self.window))
        } else {
            self.state = ConsentState::Denied;
            Some(Decision::Denied)
        }
    }

    /// The surface went away without an action
    pub fn on_closed(&mut self) -> Option<Decision> {
        if !self.is_pending() {
            return None;
        }
        self.state = ConsentState::Denied;
        Some(Decision::Denied)
    }
}

/// Errors rendering a consent prompt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("Consent surface unavailable: {0}")]
    Unavailable(String),
}

/// What happened on the surface for a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentEvent {
    Action { request: RequestId, action: String },
    Closed { request: RequestId },
}

/// Renders consent prompts. Outcomes are delivered later as
/// [`ConsentEvent`]s through whatever channel the implementation was built
/// with.
pub trait ConsentSurface: Send + Sync {
    fn show(&self, request: RequestId, prompt: &ConsentPrompt) -> Result<(), SurfaceError>;

    /// Withdraw a prompt that no longer needs an answer
    fn close(&self, request: RequestId);
}
