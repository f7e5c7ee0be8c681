//! Backend process supervision
//!
//! - **config**: supervisor configuration, builder and restart policy
//! - **handshake**: readiness marker parsing
//! - **supervisor**: the lifecycle state machine
//! - **error**: supervisor and configuration errors

pub mod config;
pub mod error;
pub mod handshake;
pub mod supervisor;

pub use config::{RestartPolicy, SupervisorConfig, SupervisorConfigBuilder};
pub use error::{ConfigError, SupervisorError};
pub use handshake::{HandshakeParser, HandshakeUpdate, JsonLineParser, MarkerLineParser};
pub use supervisor::{EventKind, ProcessSnapshot, ProcessStatus, Supervisor, SupervisorEvent};
