//! JSON-RPC 2.0 protocol layer
//!
//! Implements JSON-RPC 2.0 request/response matching over any [`Transport`],
//! with per-request timeouts and cleanup of pending requests when the
//! connection goes away.

use crate::io::transport::Transport;
use crate::log_rpc_message;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, trace, warn};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// JSON-RPC 2.0 request message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier
    pub id: Value,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Request identifier (matches the request)
    pub id: Value,

    /// Result; a JSON `null` result also deserializes to None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error (present if failed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC 2.0 notification message (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name
    pub method: String,

    /// Optional parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data (the backend puts tracebacks here)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ============================================================================
// JSON-RPC Errors
// ============================================================================

/// JSON-RPC error type
#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("JSON-RPC server error ({code}): {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Serialization error: {0}")]
    Serialization(serde_json::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Connection lost before a response arrived")]
    ConnectionLost,
}

// ============================================================================
// JSON-RPC Client
// ============================================================================

type PendingRequests = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// JSON-RPC client with request/response correlation
///
/// A single background task owns the transport. When the transport fails or
/// the client is closed, every pending request resolves with
/// [`JsonRpcError::ConnectionLost`].
pub struct JsonRpcClient {
    /// Channel for sending outbound messages
    outbound_sender: mpsc::UnboundedSender<String>,

    /// Request ID counter
    request_id: AtomicU64,

    /// Pending requests waiting for responses
    pending_requests: PendingRequests,

    /// Cleared when the transport task exits
    connected: Arc<AtomicBool>,

    transport_task: Mutex<Option<JoinHandle<()>>>,
}

impl JsonRpcClient {
    /// Create a new JSON-RPC client driving `transport`
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        let transport = Arc::new(tokio::sync::Mutex::new(transport));
        let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel::<String>();
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let pending_clone = Arc::clone(&pending_requests);
        let connected_clone = Arc::clone(&connected);

        let transport_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    // Outbound messages first
                    Some(message) = outbound_receiver.recv() => {
                        let mut transport = transport.lock().await;
                        if let Err(e) = transport.send(&message).await {
                            error!("Failed to send message: {}", e);
                            break;
                        }
                    }
                    // Inbound messages
                    result = async {
                        let mut transport = transport.lock().await;
                        transport.receive().await
                    } => {
                        match result {
                            Ok(message) => Self::process_inbound_message(message, &pending_clone),
                            Err(e) => {
                                debug!("JsonRpcClient: Transport closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            connected_clone.store(false, Ordering::SeqCst);
            Self::drain_pending(&pending_clone);
            trace!("Transport handler task finished");
        });

        Self {
            outbound_sender,
            request_id: AtomicU64::new(1),
            pending_requests,
            connected,
            transport_task: Mutex::new(Some(transport_task)),
        }
    }

    /// Route an inbound message to its pending request
    fn process_inbound_message(message: String, pending_requests: &PendingRequests) {
        trace!("JsonRpcClient: Received message: {}", message);

        if let Ok(response) = serde_json::from_str::<JsonRpcResponse>(&message) {
            let Some(id) = response.id.as_u64() else {
                debug!("Received response with non-numeric id: {}", response.id);
                return;
            };

            let sender = pending_requests
                .lock()
                .ok()
                .and_then(|mut pending| pending.remove(&id));

            match sender {
                Some(sender) => {
                    if sender.send(response).is_err() {
                        debug!("Response receiver dropped for request {}", id);
                    }
                }
                None => debug!("Received response for unknown request {}", id),
            }
        } else if let Ok(notification) = serde_json::from_str::<JsonRpcNotification>(&message) {
            debug!("Ignoring notification from backend: {}", notification.method);
        } else {
            warn!("Received unparseable message: {}", message);
        }
    }

    /// Drop every pending sender so waiting requests see a lost connection
    fn drain_pending(pending_requests: &PendingRequests) {
        if let Ok(mut pending) = pending_requests.lock() {
            for (id, _) in pending.drain() {
                debug!("JsonRpcClient: Cleaning up pending request ID {}", id);
            }
        }
    }

    fn remove_pending(&self, id: u64) {
        if let Ok(mut pending) = self.pending_requests.lock() {
            pending.remove(&id);
        }
    }

    /// Send a JSON-RPC request with the default timeout
    pub async fn request<P>(&self, method: &str, params: P) -> Result<Value, JsonRpcError>
    where
        P: Serialize,
    {
        self.request_with_timeout(method, params, DEFAULT_REQUEST_TIMEOUT)
            .await
    }

    /// Send a JSON-RPC request with custom timeout
    ///
    /// A `null` or absent result resolves to `Value::Null`.
    pub async fn request_with_timeout<P>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Result<Value, JsonRpcError>
    where
        P: Serialize,
    {
        if !self.is_connected() {
            return Err(JsonRpcError::ConnectionLost);
        }

        let id = self.request_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: Some(serde_json::to_value(params).map_err(JsonRpcError::Serialization)?),
        };
        let request_json = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;

        let (response_sender, response_receiver) = oneshot::channel();
        match self.pending_requests.lock() {
            Ok(mut pending) => {
                pending.insert(id, response_sender);
            }
            Err(_) => return Err(JsonRpcError::ConnectionLost),
        }

        log_rpc_message!(Level::DEBUG, "outgoing", method, &request_json);

        if self.outbound_sender.send(request_json).is_err() {
            self.remove_pending(id);
            return Err(JsonRpcError::ConnectionLost);
        }

        let response = match tokio::time::timeout(timeout, response_receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(JsonRpcError::ConnectionLost),
            Err(_) => {
                self.remove_pending(id);
                return Err(JsonRpcError::Timeout);
            }
        };

        if let Some(error) = response.error {
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Check if the transport task is still running
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound_sender.is_closed()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.pending_requests
            .lock()
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    /// Close the connection, failing all pending requests with `ConnectionLost`
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut task) = self.transport_task.lock()
            && let Some(task) = task.take()
        {
            task.abort();
        }
        Self::drain_pending(&self.pending_requests);
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        self.close();
    }
}
