//! Socket front-end
//!
//! Serves newline-delimited JSON-RPC 2.0 on two Unix sockets:
//!
//! - the caller socket, for `accounts.*` and `signon.*`
//! - the renderer socket, for the `ui.*` methods that list, present and
//!   complete requests
//!
//! A connection's channel is decided by the socket that accepted it, never
//! by anything the peer sends. Confined applications are only ever granted
//! the caller socket, so they cannot see or answer other callers' requests.
//!
//! Every accepted connection gets a unique id (`:1.<n>`) which is what the
//! broker knows the caller by. The confinement label of a caller is read
//! from its socket credentials once, when it connects, so a later reuse of
//! its pid cannot change who the connection is attributed to.
//!
//! Calls are handled on their own tasks: a `requestAccess` reply may arrive
//! long after later calls on the same connection were answered.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerHandle;
use crate::error::{BrokerError, ErrorKind};
use crate::params::Parameters;
use crate::protocol::{
    CancelUiRequestParams, Channel, CompleteParams, FailParams, JsonRpcRequest, JsonRpcResponse,
    Method, PresentParams, RequestParams, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR,
};
use crate::request::Reply;
use crate::trust::{LookupError, ProcessProfileLookup, SecurityContextLookup};

/// Sockets are private to the session user
const SOCKET_MODE: u32 = 0o600;
const DIRECTORY_MODE: u32 = 0o700;

/// Confinement labels of connected callers, read when they connect
pub struct PeerTable {
    processes: Arc<dyn ProcessProfileLookup>,
    /// Label of each connection, or why it couldn't be read
    labels: Mutex<HashMap<String, Result<String, String>>>,
}

impl PeerTable {
    pub fn new(processes: Arc<dyn ProcessProfileLookup>) -> Self {
        Self {
            processes,
            labels: Mutex::new(HashMap::new()),
        }
    }

    /// Record the process behind `connection` and read its label. Blocks on
    /// procfs.
    pub fn admit(&self, connection: &str, pid: u32) {
        let label = self
            .processes
            .profile_for_pid(pid)
            .map_err(|e| e.to_string());
        match &label {
            Ok(label) => debug!(connection, pid, label = %label, "Peer admitted"),
            Err(e) => debug!(connection, pid, error = %e, "Peer has no readable label"),
        }
        if let Ok(mut labels) = self.labels.lock() {
            labels.insert(connection.to_string(), label);
        }
    }

    pub fn remove(&self, connection: &str) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.remove(connection);
        }
    }
}

impl SecurityContextLookup for PeerTable {
    fn connection_security_context(&self, unique_name: &str) -> Result<String, LookupError> {
        let labels = self
            .labels
            .lock()
            .map_err(|_| LookupError::Unavailable("peer table poisoned".to_string()))?;
        labels
            .get(unique_name)
            .ok_or_else(|| LookupError::NoSuchConnection(unique_name.to_string()))?
            .clone()
            .map_err(LookupError::Unavailable)
    }
}

/// Listening sockets of the service
pub struct Server {
    callers: UnixListener,
    renderer: UnixListener,
    caller_path: PathBuf,
    renderer_path: PathBuf,
}

impl Server {
    /// Bind both sockets, replacing stale ones left by a previous run
    pub fn bind(caller_path: &Path, renderer_path: &Path) -> Result<Self> {
        if caller_path == renderer_path {
            bail!("Caller and renderer sockets must differ: {}", caller_path.display());
        }
        for path in [caller_path, renderer_path] {
            if let Some(parent) = path.parent() {
                ensure_directory(parent)?;
            }
            cleanup_socket(path)?;
        }

        let callers = listen(caller_path)?;
        let renderer = match listen(renderer_path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = std::fs::remove_file(caller_path);
                return Err(e);
            }
        };

        info!(
            callers = %caller_path.display(),
            renderer = %renderer_path.display(),
            "Listening"
        );
        Ok(Self {
            callers,
            renderer,
            caller_path: caller_path.to_path_buf(),
            renderer_path: renderer_path.to_path_buf(),
        })
    }

    /// Socket callers connect to
    pub fn path(&self) -> &Path {
        &self.caller_path
    }

    pub fn renderer_path(&self) -> &Path {
        &self.renderer_path
    }

    /// Accept connections until a listener fails
    pub async fn run(self, handle: BrokerHandle, peers: Arc<PeerTable>) -> Result<()> {
        let mut next_connection: u64 = 1;

        loop {
            let (stream, channel) = tokio::select! {
                accepted = self.callers.accept() => {
                    let (stream, _addr) = accepted.context("Failed to accept caller connection")?;
                    (stream, Channel::Caller)
                }
                accepted = self.renderer.accept() => {
                    let (stream, _addr) = accepted.context("Failed to accept renderer connection")?;
                    (stream, Channel::Renderer)
                }
            };

            let connection = format!(":1.{}", next_connection);
            next_connection += 1;

            let pid = match stream.peer_cred() {
                Ok(cred) => {
                    let pid = cred.pid().and_then(|pid| u32::try_from(pid).ok());
                    debug!(%connection, %channel, pid = ?pid, uid = cred.uid(), "Accepted connection");
                    pid
                }
                Err(e) => {
                    warn!(%connection, %channel, error = %e, "Couldn't read peer credentials");
                    None
                }
            };

            let handle = handle.clone();
            let peers = Arc::clone(&peers);
            tokio::spawn(async move {
                if channel == Channel::Caller {
                    if let Some(pid) = pid {
                        let table = Arc::clone(&peers);
                        let admitted = connection.clone();
                        if let Err(e) =
                            tokio::task::spawn_blocking(move || table.admit(&admitted, pid)).await
                        {
                            warn!(%connection, error = %e, "Failed to read peer label");
                        }
                    }
                }

                serve_connection(stream, &connection, channel, &handle).await;

                if channel == Channel::Caller {
                    handle.disconnected(connection.as_str());
                    peers.remove(&connection);
                }
            });
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        for path in [&self.caller_path, &self.renderer_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove socket");
                }
            }
        }
    }
}

fn listen(path: &Path) -> Result<UnixListener> {
    let listener = UnixListener::bind(path)
        .with_context(|| format!("Failed to bind socket {}", path.display()))?;
    set_permissions(path, SOCKET_MODE)?;
    Ok(listener)
}

fn ensure_directory(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => bail!("{} exists but is not a directory", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::create_dir_all(path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            // Only restrict directories we created
            set_permissions(path, DIRECTORY_MODE)
        }
        Err(e) => Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

fn cleanup_socket(path: &Path) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
    };
    if !metadata.file_type().is_socket() {
        bail!("{} exists but is not a socket", path.display());
    }

    std::fs::remove_file(path)
        .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    debug!(path = %path.display(), "Removed stale socket file");
    Ok(())
}

fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

async fn serve_connection(
    stream: UnixStream,
    connection: &str,
    channel: Channel,
    handle: &BrokerHandle,
) {
    let (read, mut write) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

    let writer = tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            let line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to serialize response");
                    continue;
                }
            };
            debug!("Sending: {}", line);
            if let Err(e) = write.write_all(format!("{}\n", line).as_bytes()).await {
                debug!(error = %e, "Peer went away");
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(connection, error = %e, "Read failed");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(connection, "Received: {}", line);

        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                let _ = out_tx.send(JsonRpcResponse::error(
                    None,
                    PARSE_ERROR,
                    format!("Parse error: {}", e),
                ));
                continue;
            }
        };

        let out = out_tx.clone();
        let handle = handle.clone();
        let connection = connection.to_string();
        tokio::spawn(async move {
            let id = request.id.clone();
            let response = handle_request(&handle, &connection, channel, request).await;
            // No id means no response expected
            if id.is_some() {
                let _ = out.send(response);
            }
        });
    }

    debug!(connection, "Connection closed");
    drop(out_tx);
    // Outstanding replies still hold senders; the writer ends with them
    drop(writer);
}

async fn handle_request(
    handle: &BrokerHandle,
    connection: &str,
    channel: Channel,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let id = request.id;
    if request.jsonrpc != "2.0" {
        return JsonRpcResponse::error(id, INVALID_REQUEST, "Expected JSON-RPC 2.0".to_string());
    }

    let Some(method) = Method::parse(&request.method) else {
        warn!(method = %request.method, "Unknown method");
        return JsonRpcResponse::error(
            id,
            METHOD_NOT_FOUND,
            format!("Method not found: {}", request.method),
        );
    };

    if method.channel() != channel {
        warn!(connection, method = %request.method, %channel, "Method not served on this socket");
        return JsonRpcResponse::broker_error(
            id,
            ErrorKind::Forbidden,
            format!("{} is not available on the {} socket", request.method, channel),
        );
    }

    match call(handle, connection, method, request.params).await {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(CallError::Rpc(code, message)) => JsonRpcResponse::error(id, code, message),
        Err(CallError::Broker(e)) => JsonRpcResponse::broker_error(id, e.kind(), e.to_string()),
        Err(CallError::Reply(reply)) => JsonRpcResponse::from_reply(id, reply),
    }
}

enum CallError {
    Rpc(i32, String),
    Broker(BrokerError),
    /// A request completed with an error reply
    Reply(Reply),
}

impl From<BrokerError> for CallError {
    fn from(e: BrokerError) -> Self {
        Self::Broker(e)
    }
}

async fn call(
    handle: &BrokerHandle,
    connection: &str,
    method: Method,
    params: Option<Value>,
) -> Result<Value, CallError> {
    match method {
        Method::RequestAccess(interface) => {
            let parameters = parameter_map(params)?;
            let rx = handle
                .request_access(connection, interface, parameters)
                .await?;
            match rx.await {
                Ok(Reply::Result(result)) => Ok(Value::Object(result)),
                Ok(reply) => Err(CallError::Reply(reply)),
                Err(_) => Err(CallError::Broker(BrokerError::Forbidden(
                    "Request abandoned".to_string(),
                ))),
            }
        }
        Method::CancelUiRequest => {
            let params: CancelUiRequestParams = parse_params(params)?;
            handle.cancel_ui_request(connection, params.request_id)?;
            Ok(json!({}))
        }
        Method::List => {
            let requests = handle.list().await?;
            serde_json::to_value(requests)
                .map_err(|e| CallError::Rpc(INTERNAL_ERROR, format!("Serialization error: {}", e)))
        }
        Method::Present => {
            let params: PresentParams = parse_params(params)?;
            handle.present(params.request, params.window).await?;
            Ok(json!({}))
        }
        Method::Complete => {
            let params: CompleteParams = parse_params(params)?;
            handle.complete(params.request, params.result).await?;
            Ok(json!({}))
        }
        Method::Fail => {
            let params: FailParams = parse_params(params)?;
            let kind = ErrorKind::from_name(&params.error).ok_or_else(|| {
                CallError::Rpc(INVALID_PARAMS, format!("Unknown error name: {}", params.error))
            })?;
            handle.fail(params.request, kind, params.message).await?;
            Ok(json!({}))
        }
        Method::Cancel => {
            let params: RequestParams = parse_params(params)?;
            handle.cancel(params.request).await?;
            Ok(json!({}))
        }
    }
}

fn parameter_map(params: Option<Value>) -> Result<Parameters, CallError> {
    match params {
        None | Some(Value::Null) => Ok(Parameters::new()),
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(CallError::Rpc(
            INVALID_PARAMS,
            "Parameters must be an object".to_string(),
        )),
    }
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, CallError> {
    let params = params.ok_or_else(|| CallError::Rpc(INVALID_PARAMS, "Missing params".to_string()))?;
    serde_json::from_value(params)
        .map_err(|e| CallError::Rpc(INVALID_PARAMS, format!("Invalid params: {}", e)))
}
