//! JSON-RPC plumbing for the out-of-process backend
//!
//! - **framing**: length-prefixed message codec used on the backend socket
//! - **protocol**: JSON-RPC 2.0 client with request correlation and timeouts

pub mod framing;
pub mod protocol;

pub use framing::{FramingError, RpcFrameCodec};
pub use protocol::{DEFAULT_REQUEST_TIMEOUT, JsonRpcClient, JsonRpcError};
