//! Test utilities and global setup
//!
//! Provides centralized test logging configuration and a scriptable fake
//! backend for supervisor tests.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Respects `RUST_LOG`, defaulting to debug for this crate.
    ///
    /// ```bash
    /// RUST_LOG=codeintel_supervisor=trace cargo test --features test-logging
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("debug,tokio=info"));

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok();
        });
    }

    #[ctor::ctor]
    fn init_test_logging() {
        init();
    }
}

/// Fake backend processes driven by `sh`
#[cfg(all(test, unix))]
pub mod backend {
    use crate::process::SupervisorConfigBuilder;
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    /// A shell script standing in for the backend entry script
    ///
    /// The script appends its arguments to `invocations.log` on every run and
    /// exposes the 1-based run number as `$RUN` before executing `body`.
    pub struct FakeBackend {
        _temp_dir: TempDir,
        root: PathBuf,
        script: PathBuf,
        invocations: PathBuf,
    }

    impl FakeBackend {
        pub fn new(body: &str) -> Self {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path().to_path_buf();
            let script = root.join("server.sh");
            let invocations = root.join("invocations.log");

            let contents = format!(
                "echo \"$@\" >> '{log}'\nRUN=$(wc -l < '{log}' | tr -d ' ')\n{body}",
                log = invocations.display(),
                body = body
            );
            std::fs::write(&script, contents).unwrap();

            Self {
                _temp_dir: temp_dir,
                root,
                script,
                invocations,
            }
        }

        /// Directory holding the script; also the backend's working directory
        pub fn dir(&self) -> &Path {
            &self.root
        }

        /// Supervisor configuration running the script with `sh`
        pub fn config(&self) -> SupervisorConfigBuilder {
            SupervisorConfigBuilder::new()
                .interpreter("sh")
                .entry_script(&self.script)
                .log_path(self.root.join("codeintel3.log"))
                .db_path(self.root.join("codeintel3.db"))
                .stop_timeout(Duration::from_secs(2))
        }

        /// Argument lines of every run so far
        pub fn invocations(&self) -> Vec<String> {
            std::fs::read_to_string(&self.invocations)
                .map(|contents| contents.lines().map(str::to_string).collect())
                .unwrap_or_default()
        }
    }

    /// Backend announcing `port` and idling until stopped
    pub fn backend_announcing(port: u16) -> FakeBackend {
        FakeBackend::new(&format!(
            "echo \"port:{}\"\necho \"pid:$$\"\nexec sleep 30\n",
            port
        ))
    }
}

/// Loopback JSON-RPC server standing in for the backend's socket
#[cfg(all(test, unix))]
pub mod rpc_server {
    use crate::io::{TcpTransport, Transport};
    use crate::rpc::protocol::{JsonRpcRequest, JsonRpcResponse};
    use serde_json::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Answers each request through a handler; a handler returning None
    /// closes the connection without answering.
    pub struct FakeRpcServer {
        pub port: u16,
        connections: Arc<AtomicUsize>,
    }

    impl FakeRpcServer {
        pub async fn start<F>(handler: F) -> Self
        where
            F: Fn(&JsonRpcRequest) -> Option<JsonRpcResponse> + Send + Sync + 'static,
        {
            let handler = Arc::new(handler);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let connections = Arc::new(AtomicUsize::new(0));

            let counter = Arc::clone(&connections);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        let mut transport = TcpTransport::from_stream(stream);
                        while let Ok(message) = transport.receive().await {
                            let request: JsonRpcRequest = serde_json::from_str(&message).unwrap();
                            match handler(&request) {
                                Some(response) => {
                                    let reply = serde_json::to_string(&response).unwrap();
                                    if transport.send(&reply).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    });
                }
            });

            Self { port, connections }
        }

        pub fn connections(&self) -> usize {
            self.connections.load(Ordering::SeqCst)
        }
    }

    pub fn ok(request: &JsonRpcRequest, result: Value) -> Option<JsonRpcResponse> {
        Some(JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id: request.id.clone(),
            result: Some(result),
            error: None,
        })
    }
}
