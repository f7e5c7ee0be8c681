//! Mediator over the supervised backend's JSON-RPC socket
//!
//! All RPC mediators created by one factory share a single [`RpcChannel`]: one
//! connection per backend generation, opened lazily on the first request after
//! the backend announced its port and dropped whenever the supervisor restarts
//! or stops the process.

use super::{
    DEFAULT_MEDIATOR, FailureTracker, Feature, Mediator, MediatorError, MediatorFactory,
    MediatorMeta, Method, capabilities_for,
};
use crate::io::TcpTransport;
use crate::process::{EventKind, ProcessStatus, Supervisor};
use crate::rpc::{DEFAULT_REQUEST_TIMEOUT, JsonRpcClient, JsonRpcError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

type Connection = (u64, Arc<JsonRpcClient>);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection to the current backend generation
pub struct RpcChannel {
    supervisor: Supervisor,
    connection: Mutex<Option<Connection>>,
    request_timeout: Duration,
}

impl RpcChannel {
    /// Create a channel that follows `supervisor` across restarts
    pub fn new(supervisor: Supervisor, request_timeout: Duration) -> Arc<Self> {
        let channel = Arc::new(Self {
            supervisor: supervisor.clone(),
            connection: Mutex::new(None),
            request_timeout,
        });

        for kind in [EventKind::Restarting, EventKind::Stopped] {
            let weak = Arc::downgrade(&channel);
            supervisor.on(kind, move |event| {
                if let Some(channel) = weak.upgrade() {
                    debug!("RpcChannel: dropping connection on {:?}", event);
                    channel.disconnect();
                }
            });
        }

        channel
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Close the open connection; pending requests fail with `ConnectionLost`
    pub fn disconnect(&self) {
        if let Some((generation, client)) = lock(&self.connection).take() {
            info!("Closing RPC connection to backend generation {}", generation);
            client.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.connection)
            .as_ref()
            .is_some_and(|(_, client)| client.is_connected())
    }

    /// Client for the current generation, connecting if needed
    async fn client(&self) -> Result<Arc<JsonRpcClient>, MediatorError> {
        let snapshot = self.supervisor.snapshot();
        if snapshot.status != ProcessStatus::Started {
            return Err(MediatorError::NotReady);
        }
        let Some(port) = snapshot.port else {
            return Err(MediatorError::NotReady);
        };
        let generation = snapshot.generation;

        {
            let mut connection = lock(&self.connection);
            if let Some((current, client)) = connection.as_ref()
                && *current == generation
                && client.is_connected()
            {
                return Ok(Arc::clone(client));
            }
            if let Some((stale, client)) = connection.take() {
                debug!("Discarding RPC connection to generation {}", stale);
                client.close();
            }
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let transport = TcpTransport::connect(addr).await.map_err(|e| {
            warn!("Failed to connect to backend at {}: {}", addr, e);
            MediatorError::ConnectionLost
        })?;
        let client = Arc::new(JsonRpcClient::new(transport));

        let mut connection = lock(&self.connection);
        if let Some((current, existing)) = connection.as_ref()
            && *current == generation
            && existing.is_connected()
        {
            client.close();
            return Ok(Arc::clone(existing));
        }
        if self.supervisor.generation() != generation {
            client.close();
            return Err(MediatorError::ConnectionLost);
        }

        info!("Connected to backend at {} (generation {})", addr, generation);
        *connection = Some((generation, Arc::clone(&client)));
        Ok(client)
    }

    /// Send one request to the backend
    pub async fn request(&self, method: Method, args: Value) -> Result<Value, MediatorError> {
        let client = self.client().await?;
        client
            .request_with_timeout(method.as_str(), args, self.request_timeout)
            .await
            .map_err(|e| Self::map_error(method, e))
    }

    fn map_error(method: Method, e: JsonRpcError) -> MediatorError {
        match e {
            JsonRpcError::Server {
                code,
                message,
                data,
            } => {
                error!("{} failed: {} ({})", method, message, code);
                if let Some(data) = data {
                    debug!("Backend error data: {}", data);
                }
                MediatorError::Transport { message, code }
            }
            JsonRpcError::Timeout => MediatorError::Timeout,
            JsonRpcError::ConnectionLost => MediatorError::ConnectionLost,
            JsonRpcError::Serialization(e) => MediatorError::Decode(e.to_string()),
        }
    }
}

/// Mediator speaking JSON-RPC to the supervised backend
pub struct RpcMediator {
    channel: Arc<RpcChannel>,
    meta: Option<MediatorMeta>,
    capabilities: HashSet<Feature>,
    failures: FailureTracker,
}

impl RpcMediator {
    pub fn new(
        channel: Arc<RpcChannel>,
        meta: Option<MediatorMeta>,
        capabilities: HashSet<Feature>,
    ) -> Self {
        Self {
            channel,
            meta,
            capabilities,
            failures: FailureTracker::default(),
        }
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failures = FailureTracker::new(threshold);
        self
    }
}

#[async_trait]
impl Mediator for RpcMediator {
    fn id(&self) -> &str {
        DEFAULT_MEDIATOR
    }

    fn meta(&self) -> Option<&MediatorMeta> {
        self.meta.as_ref()
    }

    fn capabilities(&self) -> &HashSet<Feature> {
        &self.capabilities
    }

    fn is_ready(&self) -> bool {
        self.channel.supervisor.is_ready()
    }

    fn is_failing(&self) -> bool {
        self.channel.supervisor.is_failing() || self.failures.is_tripped()
    }

    async fn request(&self, method: Method, args: Value) -> Result<Value, MediatorError> {
        if !self.is_ready() {
            return Err(MediatorError::NotReady);
        }

        let result = self.channel.request(method, args).await;
        match &result {
            Ok(_) => self.failures.record_success(),
            Err(MediatorError::NotReady) => {}
            Err(e) => {
                let failures = self.failures.record_failure();
                debug!("{} failed ({} in a row): {}", method, failures, e);
            }
        }
        result
    }

    fn stop(&self) {
        self.channel.disconnect();
    }
}

/// Creates [`RpcMediator`]s sharing one [`RpcChannel`]
pub struct RpcMediatorFactory {
    channel: Arc<RpcChannel>,
    capabilities: HashSet<Feature>,
}

impl RpcMediatorFactory {
    /// `capabilities` are those of the language-less master instance
    pub fn new(channel: Arc<RpcChannel>, capabilities: HashSet<Feature>) -> Self {
        Self {
            channel,
            capabilities,
        }
    }

    /// Factory with the default request timeout whose master supports every feature
    pub fn for_supervisor(supervisor: Supervisor) -> Self {
        Self::new(
            RpcChannel::new(supervisor, DEFAULT_REQUEST_TIMEOUT),
            Feature::ALL.into_iter().collect(),
        )
    }

    pub fn channel(&self) -> &Arc<RpcChannel> {
        &self.channel
    }
}

impl MediatorFactory for RpcMediatorFactory {
    fn create(&self, meta: Option<MediatorMeta>) -> Arc<dyn Mediator> {
        let capabilities = capabilities_for(meta.as_ref(), &self.capabilities);
        Arc::new(RpcMediator::new(Arc::clone(&self.channel), meta, capabilities))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::rpc::protocol::{JsonRpcErrorObject, JsonRpcResponse};
    use crate::test_utils::backend::{FakeBackend, backend_announcing};
    use crate::test_utils::rpc_server::{FakeRpcServer, ok};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn started_supervisor(backend: &FakeBackend) -> Supervisor {
        let supervisor = Supervisor::new(backend.config().build().unwrap());
        supervisor.start().await.unwrap();
        supervisor
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();
        supervisor
    }

    #[tokio::test]
    async fn test_not_ready_rejects_immediately() {
        let backend = FakeBackend::new("exec sleep 30\n");
        let supervisor = Supervisor::new(backend.config().build().unwrap());
        let factory = RpcMediatorFactory::for_supervisor(supervisor);
        let mediator = factory.create(None);

        assert!(!mediator.is_ready());
        assert!(matches!(
            mediator.request(Method::GetLanguages, json!([])).await,
            Err(MediatorError::NotReady)
        ));
        assert!(!mediator.is_failing());
    }

    #[tokio::test]
    async fn test_requests_share_one_connection_per_generation() {
        let server = FakeRpcServer::start(|request| {
            ok(request, json!({"method": &request.method, "args": &request.params}))
        })
        .await;
        let backend = backend_announcing(server.port);
        let supervisor = started_supervisor(&backend).await;
        let factory = RpcMediatorFactory::for_supervisor(supervisor.clone());

        let master = factory.create(None);
        let first = master
            .request(Method::GetDefinition, json!(["buf", 12]))
            .await
            .unwrap();
        assert_eq!(first, json!({"method": "getDefinition", "args": ["buf", 12]}));

        let second = factory
            .create(None)
            .request(Method::Keepalive, json!([]))
            .await
            .unwrap();
        assert_eq!(second["method"], "keepalive");
        assert_eq!(server.connections(), 1);
        assert!(factory.channel().is_connected());

        supervisor.shutdown().await;
        assert!(!factory.channel().is_connected());
    }

    #[tokio::test]
    async fn test_server_error_settles_as_transport_error() {
        let server = FakeRpcServer::start(|request| {
            Some(JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id.clone(),
                result: None,
                error: Some(JsonRpcErrorObject {
                    code: 504,
                    message: "timeout".to_string(),
                    data: Some(json!("Traceback (most recent call last): ...")),
                }),
            })
        })
        .await;
        let backend = backend_announcing(server.port);
        let supervisor = started_supervisor(&backend).await;
        let mediator = RpcMediator::new(
            RpcChannel::new(supervisor.clone(), Duration::from_secs(5)),
            None,
            HashSet::new(),
        )
        .with_failure_threshold(2);

        let pending = mediator.request(Method::GetDefinition, json!([]));
        match pending.await {
            Err(MediatorError::Transport { message, code }) => {
                assert_eq!(message, "timeout");
                assert_eq!(code, 504);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!mediator.is_failing());

        let _ = mediator.request(Method::GetDefinition, json!([])).await;
        assert!(mediator.is_failing());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_dropped_connection_is_retryable_and_reconnects() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let server = FakeRpcServer::start(move |request| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                None
            } else {
                ok(request, json!("pong"))
            }
        })
        .await;
        let backend = backend_announcing(server.port);
        let supervisor = started_supervisor(&backend).await;
        let factory = RpcMediatorFactory::for_supervisor(supervisor.clone());
        let mediator = factory.create(None);

        let error = mediator
            .request(Method::Keepalive, json!([]))
            .await
            .unwrap_err();
        assert!(matches!(error, MediatorError::ConnectionLost));
        assert!(error.is_retryable());

        let result = mediator.request(Method::Keepalive, json!([])).await.unwrap();
        assert_eq!(result, json!("pong"));
        assert_eq!(server.connections(), 2);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_drops_the_connection() {
        let server = FakeRpcServer::start(|request| ok(request, Value::Null)).await;
        let backend = backend_announcing(server.port);
        let supervisor = started_supervisor(&backend).await;
        let factory = RpcMediatorFactory::for_supervisor(supervisor.clone());
        let mediator = factory.create(None);

        mediator.request(Method::Keepalive, json!([])).await.unwrap();
        assert!(factory.channel().is_connected());

        supervisor.restart().await.unwrap();
        assert!(!factory.channel().is_connected());

        supervisor
            .wait_until_ready(Duration::from_secs(5))
            .await
            .unwrap();
        mediator.request(Method::Keepalive, json!([])).await.unwrap();
        assert_eq!(server.connections(), 2);

        supervisor.shutdown().await;
    }
}
