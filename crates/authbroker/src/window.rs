//! Window routing
//!
//! Once a request may show UI, the window created for it is handed to the
//! [`WindowHost`]. If the caller told us which of its own windows it was
//! invoked from, ours is stacked above it as a transient child.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::request::{Request, RequestId};

/// Window created by the dialog renderer for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowHandle(pub u64);

/// Native window of the caller, used only as a transient parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeWindowId(pub u32);

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Errors showing a request's window
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("Window already set for request {0}")]
    AlreadyShown(RequestId),

    #[error("Request {0} is not in progress")]
    NotInProgress(RequestId),

    #[error("Window host failed: {0}")]
    Host(String),
}

/// Whatever actually maps windows on screen
pub trait WindowHost: Send + Sync {
    fn show(&self, window: WindowHandle, transient_parent: Option<NativeWindowId>)
        -> Result<(), WindowError>;
}

/// Host for headless runs: records the decision in the log only
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingWindowHost;

impl WindowHost for LoggingWindowHost {
    fn show(
        &self,
        window: WindowHandle,
        transient_parent: Option<NativeWindowId>,
    ) -> Result<(), WindowError> {
        match transient_parent {
            Some(parent) => info!(%window, parent = parent.0, "Showing window as transient child"),
            None => info!(%window, "Showing top-level window"),
        }
        Ok(())
    }
}

/// Associates requests with their windows
#[derive(Clone)]
pub struct WindowRouter {
    host: Arc<dyn WindowHost>,
}

impl WindowRouter {
    pub fn new(host: Arc<dyn WindowHost>) -> Self {
        Self { host }
    }

    /// Show `window` for `request`. Valid once per request.
    pub fn show(&self, request: &mut Request, window: WindowHandle) -> Result<(), WindowError> {
        if let Err(e) = request.set_window(window) {
            warn!(request = %request.id(), error = %e, "Rejected window");
            return Err(e);
        }

        let parent = request.window_id();
        if parent.is_some() {
            debug!(request = %request.id(), "Requesting window reparenting");
        }
        self.host.show(window, parent)
    }
}
