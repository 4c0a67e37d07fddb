//! Consent prompts as desktop notifications
//!
//! Uses `notify-send --wait` with one action per prompt action. The key of
//! the invoked action is printed on stdout; a notification that closes
//! without output was dismissed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::consent::{ConsentEvent, ConsentPrompt, ConsentSurface, SurfaceError};
use crate::request::RequestId;

const NOTIFY_SEND: &str = "notify-send";
const APP_NAME: &str = "authbroker";

/// [`ConsentSurface`] backed by `notify-send`
pub struct NotifySendSurface {
    program: String,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<ConsentEvent>,
    prompts: Mutex<HashMap<RequestId, JoinHandle<()>>>,
}

impl NotifySendSurface {
    /// Decisions are delivered on `events`
    pub fn new(events: mpsc::UnboundedSender<ConsentEvent>) -> Self {
        Self {
            program: NOTIFY_SEND.to_string(),
            timeout: None,
            events,
            prompts: Mutex::new(HashMap::new()),
        }
    }

    /// Dismiss prompts nobody answered after `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

impl ConsentSurface for NotifySendSurface {
    fn show(&self, request: RequestId, prompt: &ConsentPrompt) -> Result<(), SurfaceError> {
        let mut child = Command::new(&self.program)
            .args(notify_send_args(prompt, self.timeout))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SurfaceError::Unavailable(format!("{}: {}", self.program, e)))?;

        let stdout = child.stdout.take();
        let events = self.events.clone();
        let keys: Vec<String> = prompt.actions.iter().map(|a| a.key.clone()).collect();

        let task = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(mut stdout) = stdout {
                use tokio::io::AsyncReadExt;
                if let Err(e) = stdout.read_to_string(&mut output).await {
                    warn!(request = %request, error = %e, "Failed to read notification output");
                }
            }
            match child.wait().await {
                Ok(status) if !status.success() => {
                    debug!(request = %request, %status, "Notification exited with failure");
                }
                Err(e) => warn!(request = %request, error = %e, "Failed to wait for notification"),
                Ok(_) => {}
            }
            let _ = events.send(event_for_output(request, &output, &keys));
        });

        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.retain(|_, task| !task.is_finished());
            prompts.insert(request, task);
        }
        debug!(request = %request, "Consent notification shown");
        Ok(())
    }

    fn close(&self, request: RequestId) {
        let task = self
            .prompts
            .lock()
            .ok()
            .and_then(|mut prompts| prompts.remove(&request));
        if let Some(task) = task {
            // Dropping the child kills the notification process
            task.abort();
            debug!(request = %request, "Consent notification withdrawn");
        }
    }
}

/// Command line for showing `prompt`
fn notify_send_args(prompt: &ConsentPrompt, timeout: Option<Duration>) -> Vec<String> {
    let mut args = vec![format!("--app-name={}", APP_NAME), "--wait".to_string()];
    if prompt.snap_decision {
        args.push("--urgency=critical".to_string());
    }
    if let Some(timeout) = timeout {
        args.push(format!("--expire-time={}", timeout.as_millis()));
    }
    for action in &prompt.actions {
        args.push(format!("--action={}={}", action.key, action.label));
    }
    args.push(prompt.title.clone());
    args.push(prompt.summary.clone());
    args
}

/// Anything but a known action key means the notification was dismissed
fn event_for_output(request: RequestId, output: &str, keys: &[String]) -> ConsentEvent {
    let action = output.trim();
    if keys.iter().any(|key| key == action) {
        ConsentEvent::Action {
            request,
            action: action.to_string(),
        }
    } else {
        ConsentEvent::Closed { request }
    }
}
