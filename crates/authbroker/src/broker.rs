//! Broker event loop
//!
//! A single task owns the [`RequestManager`]; everything else talks to it
//! through a [`BrokerHandle`]. Commands are applied one at a time, so the
//! dedup check and registration of a request can never interleave with
//! another enqueue.
//!
//! Caller profiles are resolved on the handle side, before the command is
//! queued. A slow security-context lookup delays only the call that needs
//! it.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::consent::ConsentEvent;
use crate::error::{BrokerError, ErrorKind};
use crate::manager::{RequestManager, RequestSummary};
use crate::params::{Parameters, KEY_REQUEST_ID};
use crate::request::{Caller, Interface, Reply, ReplySink, RequestId};
use crate::trust::TrustResolver;
use crate::window::WindowHandle;

type Respond<T> = oneshot::Sender<Result<T, BrokerError>>;

/// Work queued for the event loop
#[derive(Debug)]
pub enum Command {
    RequestAccess {
        interface: Interface,
        caller: Caller,
        parameters: Parameters,
        reply: ReplySink,
    },
    CancelUiRequest {
        connection: String,
        request_id: String,
    },
    List {
        respond: oneshot::Sender<Vec<RequestSummary>>,
    },
    Present {
        request: RequestId,
        window: WindowHandle,
        respond: Respond<()>,
    },
    Complete {
        request: RequestId,
        result: Parameters,
        respond: Respond<()>,
    },
    Fail {
        request: RequestId,
        kind: ErrorKind,
        message: String,
        respond: Respond<()>,
    },
    Cancel {
        request: RequestId,
        respond: Respond<()>,
    },
    Disconnected {
        connection: String,
    },
}

/// Owner of the request registry
pub struct Broker {
    manager: RequestManager,
    commands: mpsc::UnboundedReceiver<Command>,
    consent: mpsc::UnboundedReceiver<ConsentEvent>,
}

/// Cloneable entry point into the event loop
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<Command>,
    trust: Arc<TrustResolver>,
}

impl Broker {
    /// Create the loop and its handle. `consent` carries decisions taken on
    /// the consent surface.
    pub fn new(
        manager: RequestManager,
        trust: Arc<TrustResolver>,
        consent: mpsc::UnboundedReceiver<ConsentEvent>,
    ) -> (Self, BrokerHandle) {
        let (tx, commands) = mpsc::unbounded_channel();
        let broker = Self {
            manager,
            commands,
            consent,
        };
        (broker, BrokerHandle { tx, trust })
    }

    /// Process commands until `shutdown` resolves or every handle is gone.
    /// Requests still live at that point are canceled.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!("Broker started");

        loop {
            tokio::select! {
                // Decisions go before commands queued after them
                biased;

                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
                Some(event) = self.consent.recv() => {
                    self.manager.on_consent_event(event);
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => {
                        debug!("All handles dropped");
                        break;
                    }
                },
            }
        }

        let canceled = self.manager.cancel_all();
        if canceled > 0 {
            info!(canceled, "Canceled outstanding requests");
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::RequestAccess {
                interface,
                caller,
                parameters,
                reply,
            } => {
                // Rejections are answered by the manager
                if let Ok(request) = self.manager.construct(interface, caller, parameters, reply) {
                    self.manager.enqueue(request);
                }
            }
            Command::CancelUiRequest {
                connection,
                request_id,
            } => {
                let mut pattern = Parameters::new();
                pattern.insert(KEY_REQUEST_ID.to_string(), Value::String(request_id.clone()));
                match self.manager.cancel_matching(&connection, &pattern) {
                    Some(id) => info!(request = %id, request_id = %request_id, "Canceled on behalf of the credential store"),
                    None => debug!(request_id = %request_id, "No request to cancel"),
                }
            }
            Command::List { respond } => {
                let _ = respond.send(self.manager.snapshot());
            }
            Command::Present {
                request,
                window,
                respond,
            } => {
                let _ = respond.send(self.manager.present(request, window));
            }
            Command::Complete {
                request,
                result,
                respond,
            } => {
                let _ = respond.send(self.manager.succeed(request, result).map(|_| ()));
            }
            Command::Fail {
                request,
                kind,
                message,
                respond,
            } => {
                let _ = respond.send(self.manager.fail(request, kind, message).map(|_| ()));
            }
            Command::Cancel { request, respond } => {
                let _ = respond.send(self.manager.cancel(request).map(|_| ()));
            }
            Command::Disconnected { connection } => {
                self.manager.cancel_for_connection(&connection);
            }
        }
    }
}

impl BrokerHandle {
    /// Submit a `requestAccess` call. The reply arrives on the returned
    /// receiver once the request completes.
    pub async fn request_access(
        &self,
        connection: &str,
        interface: Interface,
        parameters: Parameters,
    ) -> Result<oneshot::Receiver<Reply>, BrokerError> {
        let mut profile = self.trust.resolve_caller_profile(connection).await;
        if interface == Interface::SignOn {
            profile = self.trust.effective_profile(&profile, &parameters);
        }

        let (reply, rx) = ReplySink::channel();
        self.send(Command::RequestAccess {
            interface,
            caller: Caller::new(connection, profile),
            parameters,
            reply,
        })?;
        Ok(rx)
    }

    /// Cancel a sign-on request the credential store issued on `connection`
    pub fn cancel_ui_request(
        &self,
        connection: &str,
        request_id: impl Into<String>,
    ) -> Result<(), BrokerError> {
        self.send(Command::CancelUiRequest {
            connection: connection.to_string(),
            request_id: request_id.into(),
        })
    }

    pub async fn list(&self) -> Result<Vec<RequestSummary>, BrokerError> {
        let (respond, rx) = oneshot::channel();
        self.send(Command::List { respond })?;
        rx.await.map_err(|_| BrokerError::ShuttingDown)
    }

    pub async fn present(&self, request: RequestId, window: WindowHandle) -> Result<(), BrokerError> {
        self.call(|respond| Command::Present {
            request,
            window,
            respond,
        })
        .await
    }

    pub async fn complete(&self, request: RequestId, result: Parameters) -> Result<(), BrokerError> {
        self.call(|respond| Command::Complete {
            request,
            result,
            respond,
        })
        .await
    }

    pub async fn fail(
        &self,
        request: RequestId,
        kind: ErrorKind,
        message: String,
    ) -> Result<(), BrokerError> {
        self.call(|respond| Command::Fail {
            request,
            kind,
            message,
            respond,
        })
        .await
    }

    pub async fn cancel(&self, request: RequestId) -> Result<(), BrokerError> {
        self.call(|respond| Command::Cancel { request, respond }).await
    }

    /// A caller connection went away
    pub fn disconnected(&self, connection: impl Into<String>) {
        let _ = self.send(Command::Disconnected {
            connection: connection.into(),
        });
    }

    async fn call(&self, command: impl FnOnce(Respond<()>) -> Command) -> Result<(), BrokerError> {
        let (respond, rx) = oneshot::channel();
        self.send(command(respond))?;
        rx.await.map_err(|_| BrokerError::ShuttingDown)?
    }

    fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.tx.send(command).map_err(|_| BrokerError::ShuttingDown)
    }
}
