//! Account, provider and application metadata
//!
//! The broker never stores credentials. It only needs display metadata for
//! the consent summary and the packaged metadata of applications to verify
//! their identity. Both come from a [`Catalog`].
//!
//! The bundled [`FileCatalog`] reads a YAML document:
//!
//! ```yaml
//! providers:
//!   - id: google
//!     display_name: Google
//! accounts:
//!   - id: 3
//!     provider: google
//!     display_name: alice@example.com
//!     credentials_id: 17
//! applications:
//!   - id: mail.client_mail
//!     display_name: Mail
//!     desktop_file: /usr/share/applications/mail.client_mail.desktop
//!     profile: mail.client_mail_2.1
//!     services: [google-imap]
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A configured account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u32,
    pub provider: String,
    pub display_name: String,
    /// Id of the stored credentials used by this account
    #[serde(default)]
    pub credentials_id: u32,
}

/// An account provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub icon: Option<String>,
}

/// An installed application that may use accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub icon: Option<String>,
    /// Desktop entry declaring the application's confinement identity
    #[serde(default)]
    pub desktop_file: Option<PathBuf>,
    /// Confinement profile the application runs under, when known
    #[serde(default)]
    pub profile: Option<String>,
    /// Services this application uses
    #[serde(default)]
    pub services: Vec<String>,
}

/// Source of account and application metadata
pub trait Catalog: Send + Sync {
    /// Find the account whose stored credentials have the given id
    fn account_for_credentials(&self, credentials_id: u32) -> Option<Account>;

    /// Look up a provider by id
    fn provider(&self, id: &str) -> Option<Provider>;

    /// Look up an application by id
    fn application(&self, id: &str) -> Option<Application>;

    /// Find the application running under a confinement profile
    fn application_for_profile(&self, profile: &str) -> Option<Application>;
}

/// YAML-backed catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileCatalog {
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub applications: Vec<Application>,
}

impl FileCatalog {
    /// Load the catalog; a missing file yields an empty catalog
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No catalog file, starting empty");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog from {:?}", path))?;
        let catalog: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse catalog from {:?}", path))?;
        Ok(catalog)
    }
}

impl Catalog for FileCatalog {
    fn account_for_credentials(&self, credentials_id: u32) -> Option<Account> {
        if credentials_id == 0 {
            return None;
        }
        // More than one account may share credentials; the first one wins
        self.accounts
            .iter()
            .find(|a| a.credentials_id == credentials_id)
            .cloned()
    }

    fn provider(&self, id: &str) -> Option<Provider> {
        self.providers.iter().find(|p| p.id == id).cloned()
    }

    fn application(&self, id: &str) -> Option<Application> {
        self.applications.iter().find(|a| a.id == id).cloned()
    }

    fn application_for_profile(&self, profile: &str) -> Option<Application> {
        if profile.is_empty() {
            return None;
        }
        self.applications
            .iter()
            .find(|a| a.profile.as_deref() == Some(profile))
            .or_else(|| self.applications.iter().find(|a| a.id == profile))
            .cloned()
    }
}
