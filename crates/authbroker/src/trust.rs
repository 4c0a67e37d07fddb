//! Caller trust resolution
//!
//! Answers two questions for every inbound call: which confinement profile
//! does the calling process really run under, and does an application
//! identity claimed in the request parameters belong to that profile.
//!
//! Absence of data resolves to the more restrictive outcome. The one
//! exception is an application whose desktop entry declares no identifier at
//! all: such legacy applications cannot be confined and are not restricted.

use authbroker_core::process::{self, ConfinementError, UNCONFINED};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::catalog::{Application, Catalog};
use crate::params::{Parameters, ParametersExt, KEY_PID};

/// Desktop entry key declaring the confinement identity of an application
pub const DESKTOP_APP_ID_KEY: &str = "X-Ubuntu-Application-ID";

const DESKTOP_ENTRY_GROUP: &str = "[Desktop Entry]";

/// Default bound on the security-context round-trip
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(2000);

/// Errors from the bus security-context facility
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Unknown connection: {0}")]
    NoSuchConnection(String),

    #[error("Security context unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Confinement(#[from] ConfinementError),
}

/// Bus facility mapping a unique connection identifier to the confinement
/// label of the process behind it.
///
/// Implementations may block; the resolver runs them off the event loop
/// with a bounded timeout.
pub trait SecurityContextLookup: Send + Sync + 'static {
    fn connection_security_context(&self, unique_name: &str) -> Result<String, LookupError>;
}

/// OS-level lookup of the confinement label of a process id
pub trait ProcessProfileLookup: Send + Sync {
    fn profile_for_pid(&self, pid: u32) -> Result<String, ConfinementError>;
}

/// Reads labels from procfs
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcfsProfiles;

impl ProcessProfileLookup for ProcfsProfiles {
    fn profile_for_pid(&self, pid: u32) -> Result<String, ConfinementError> {
        process::profile_for_pid(pid)
    }
}

/// Verified information about the application behind a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub id: String,
    pub display_name: String,
    pub icon: Option<String>,
    pub profile: String,
    pub services: Vec<String>,
}

/// Resolves caller profiles and verifies claimed application identities
pub struct TrustResolver {
    bus: Arc<dyn SecurityContextLookup>,
    processes: Arc<dyn ProcessProfileLookup>,
    catalog: Arc<dyn Catalog>,
    lookup_timeout: Duration,
}

impl TrustResolver {
    pub fn new(
        bus: Arc<dyn SecurityContextLookup>,
        processes: Arc<dyn ProcessProfileLookup>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            bus,
            processes,
            catalog,
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Resolve the confinement profile of the caller behind a connection.
    ///
    /// Returns an empty string when the caller has no label, when the
    /// lookup fails, or when it does not answer within the lookup timeout.
    /// An empty profile is never treated as unconfined.
    pub async fn resolve_caller_profile(&self, unique_name: &str) -> String {
        // Only in-process callers (tests) come without a connection name
        if unique_name.is_empty() {
            return String::new();
        }

        let bus = Arc::clone(&self.bus);
        let name = unique_name.to_string();
        let lookup =
            tokio::task::spawn_blocking(move || bus.connection_security_context(&name));

        match tokio::time::timeout(self.lookup_timeout, lookup).await {
            Ok(Ok(Ok(profile))) => {
                debug!(caller = unique_name, profile = %profile, "Resolved caller profile");
                profile
            }
            Ok(Ok(Err(e))) => {
                warn!(caller = unique_name, error = %e, "Error getting caller profile");
                String::new()
            }
            Ok(Err(e)) => {
                warn!(caller = unique_name, error = %e, "Profile lookup task failed");
                String::new()
            }
            Err(_) => {
                warn!(
                    caller = unique_name,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "Profile lookup timed out"
                );
                String::new()
            }
        }
    }

    /// Resolve the profile of an arbitrary process; empty on failure
    pub fn resolve_profile_for_process(&self, pid: u32) -> String {
        match self.processes.profile_for_pid(pid) {
            Ok(profile) => profile,
            Err(e) => {
                warn!(pid, error = %e, "Couldn't get confinement profile of process");
                String::new()
            }
        }
    }

    /// Profile a request is attributed to.
    ///
    /// An unconfined caller may forward a request on behalf of another
    /// process by passing its `pid`; the profile of that process is used.
    /// If it cannot be resolved the caller's own profile is kept.
    pub fn effective_profile(&self, caller_profile: &str, parameters: &Parameters) -> String {
        if caller_profile != UNCONFINED {
            return caller_profile.to_string();
        }

        let pid = match parameters.u32_value(KEY_PID) {
            Ok(Some(pid)) if pid != 0 => pid,
            _ => return caller_profile.to_string(),
        };

        let profile = self.resolve_profile_for_process(pid);
        if profile.is_empty() {
            caller_profile.to_string()
        } else {
            debug!(pid, profile = %profile, "Request forwarded on behalf of process");
            profile
        }
    }

    /// Check that an application really runs under `profile`
    pub fn application_matches_profile(&self, application: &Application, profile: &str) -> bool {
        application_matches_profile(application, profile)
    }

    /// Verified metadata for an application claimed by a caller
    pub fn application_info(&self, claimed_app_id: &str, profile: &str) -> Option<ApplicationInfo> {
        if profile.is_empty() {
            return None;
        }

        // Packages may claim just their package name; the profile carries
        // the complete application id
        let application_id = if profile.starts_with(claimed_app_id) {
            profile
        } else {
            claimed_app_id
        };

        let application = match self.catalog.application(application_id) {
            Some(app) => app,
            None if profile == UNCONFINED => Application {
                id: application_id.to_string(),
                display_name: String::new(),
                icon: None,
                desktop_file: None,
                profile: None,
                services: Vec::new(),
            },
            None => {
                debug!(application_id, "Unknown application");
                return None;
            }
        };

        if !application_matches_profile(&application, profile) {
            debug!(application_id, profile, "Given application id doesn't match profile");
            return None;
        }

        Some(ApplicationInfo {
            id: application_id.to_string(),
            display_name: application.display_name,
            icon: application.icon,
            profile: profile.to_string(),
            services: application.services,
        })
    }

    /// Display metadata of the application running under `profile`
    pub fn application_for_profile(&self, profile: &str) -> Option<Application> {
        self.catalog.application_for_profile(profile)
    }
}

/// Check an application's declared identity against a confinement profile
pub fn application_matches_profile(application: &Application, profile: &str) -> bool {
    // Unconfined callers are not restricted
    if profile == UNCONFINED {
        return true;
    }

    // Every installed application ships a desktop entry; without one we
    // cannot tell who the caller is
    let desktop_file = match &application.desktop_file {
        Some(path) if path.exists() => path,
        other => {
            debug!(application = %application.id, desktop_file = ?other, "Desktop file not found");
            return false;
        }
    };

    match declared_application_id(desktop_file) {
        Ok(Some(app_id)) => app_id == profile,
        // Not a confinable package
        Ok(None) => true,
        Err(e) => {
            warn!(path = %desktop_file.display(), error = %e, "Failed to read desktop file");
            false
        }
    }
}

/// Read the declared application id from a desktop entry
pub fn declared_application_id(path: &Path) -> io::Result<Option<String>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut in_entry = false;
    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == DESKTOP_ENTRY_GROUP;
            continue;
        }
        if !in_entry {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == DESKTOP_APP_ID_KEY {
                let value = value.trim();
                return Ok((!value.is_empty()).then(|| value.to_string()));
            }
        }
    }

    Ok(None)
}
