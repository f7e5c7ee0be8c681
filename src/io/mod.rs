//! I/O layer - Generic abstractions for process management and transport
//!
//! - **Transport**: message exchange with the backend over its loopback socket
//! - **Process**: external process lifecycle management with output monitoring

pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, OutputMonitor, ProcessError, ProcessExitEvent, ProcessExitHandler,
    ProcessManager, ProcessState, StopMode, send_signal,
};
pub use transport::{MockTransport, MockTransportHandle, TcpTransport, Transport, TransportError};
