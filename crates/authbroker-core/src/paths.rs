//! Standard paths used by authbroker

use std::path::PathBuf;

/// Name of the per-user directories owned by the service
const APP_DIR: &str = "authbroker";

/// Standard authbroker paths
pub struct Paths {
    /// Data directory (~/.local/share/authbroker)
    pub data: PathBuf,
    /// Config directory (~/.config/authbroker)
    pub config: PathBuf,
    /// Runtime directory ($XDG_RUNTIME_DIR/authbroker, or the data dir)
    pub runtime: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join(APP_DIR);

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join(APP_DIR);

        // Sockets belong in the session runtime dir; fall back to data dir
        let runtime = dirs::runtime_dir()
            .map(|dir| dir.join(APP_DIR))
            .unwrap_or_else(|| data.clone());

        Self {
            data,
            config,
            runtime,
        }
    }

    /// Get socket path for a service
    pub fn socket(&self, service: &str) -> PathBuf {
        self.runtime.join(format!("{}.sock", service))
    }

    /// Get the path of a config file
    pub fn config_file(&self, name: &str) -> PathBuf {
        self.config.join(name)
    }
}
