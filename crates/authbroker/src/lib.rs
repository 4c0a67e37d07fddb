//! authbroker - account access broker for confined applications
//!
//! Applications ask for access to stored accounts; the broker decides who
//! is really asking, keeps at most one equivalent request outstanding, and
//! holds credential dialogs back until the user has agreed to them.
//!
//! Every request is answered exactly once: with a result, or with one of
//! the errors in [`error::ErrorKind`].

pub mod broker;
pub mod catalog;
pub mod config;
pub mod consent;
pub mod error;
pub mod idle;
pub mod manager;
pub mod notify;
pub mod params;
pub mod protocol;
pub mod request;
pub mod server;
pub mod trust;
pub mod window;

pub use broker::{Broker, BrokerHandle};
pub use config::BrokerConfig;
pub use error::{BrokerError, ErrorKind};
pub use manager::RequestManager;
pub use request::{Request, RequestId, RequestKind};
pub use trust::TrustResolver;
