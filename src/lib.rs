//! Supervision and request mediation for an out-of-process code intelligence
//! backend
//!
//! - **process**: spawns the backend, parses its readiness handshake and
//!   restarts it when it crashes
//! - **rpc**: JSON-RPC over the backend's loopback socket
//! - **mediator**: uniform request facade over the RPC backend and in-process
//!   legacy components, plus the service locator picking one per language
//! - **service**: typed endpoints with caching and routing defaults
//! - **feature**: editor-facing clients built on the service
//! - **codeintel**: the runtime tying it together

pub mod codeintel;
pub mod feature;
pub mod io;
pub mod logging;
pub mod mediator;
pub mod process;
pub mod rpc;
pub mod service;

#[cfg(test)]
mod test_utils;

pub use codeintel::{Codeintel, CodeintelConfig};
pub use service::CodeintelService;
