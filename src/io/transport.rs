//! Transport layer - Pure I/O abstraction for message exchange
//!
//! This module provides the core transport abstraction that handles
//! bidirectional message exchange without knowledge of message content
//! or process management.

use crate::rpc::framing::RpcFrameCodec;
use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, trace};

/// Size of the read buffer for socket reads
const READ_BUFFER_SIZE: usize = 8192;

/// Core transport trait for bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message (raw string)
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive a message (raw string)
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

// ============================================================================
// TCP Transport Implementation
// ============================================================================

/// Error types for the socket transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over the backend's loopback socket
///
/// Messages are framed with [`RpcFrameCodec`] by a writer task and a reader
/// task; `receive()` returns `Disconnected` once the peer closes the socket.
#[derive(Debug)]
pub struct TcpTransport {
    /// Channel for queueing outgoing messages
    write_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel for receiving decoded messages
    read_receiver: Option<mpsc::UnboundedReceiver<String>>,

    reader_task: Option<JoinHandle<()>>,

    /// Connection status
    connected: bool,
}

impl TcpTransport {
    /// Connect to the backend at `addr`
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        debug!("TcpTransport: Connecting to {}", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream
    pub fn from_stream(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (write_sender, write_receiver) = mpsc::unbounded_channel();
        let (read_sender, read_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(write_half, write_receiver));
        let reader_task = tokio::spawn(Self::reader_task(read_half, read_sender));

        Self {
            write_sender: Some(write_sender),
            read_receiver: Some(read_receiver),
            reader_task: Some(reader_task),
            connected: true,
        }
    }

    /// Background task that frames and writes queued messages
    async fn writer_task(
        mut writer: OwnedWriteHalf,
        mut receiver: mpsc::UnboundedReceiver<String>,
    ) {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::new();

        while let Some(message) = receiver.recv().await {
            trace!("TcpTransport: Writing message (length: {})", message.len());

            buffer.clear();
            if let Err(e) = codec.encode(message, &mut buffer) {
                error!("Failed to frame outgoing message: {}", e);
                continue;
            }

            if let Err(e) = writer.write_all(&buffer).await {
                error!("Failed to write to socket: {}", e);
                break;
            }
        }

        let _ = writer.shutdown().await;
        trace!("TcpTransport: writer task finished");
    }

    /// Background task that reads and decodes frames from the socket
    async fn reader_task(mut reader: OwnedReadHalf, sender: mpsc::UnboundedSender<String>) {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        'read: loop {
            match reader.read_buf(&mut buffer).await {
                Ok(0) => {
                    trace!("TcpTransport: socket reached EOF");
                    if !buffer.is_empty() {
                        debug!(
                            "TcpTransport: {} undecoded bytes left at EOF",
                            buffer.len()
                        );
                    }
                    break;
                }
                Ok(_) => loop {
                    match codec.decode(&mut buffer) {
                        Ok(Some(message)) => {
                            if sender.send(message).is_err() {
                                trace!("TcpTransport: receiver dropped, stopping reader");
                                break 'read;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!("TcpTransport: Framing error, dropping connection: {}", e);
                            break 'read;
                        }
                    }
                },
                Err(e) => {
                    error!("Failed to read from socket: {}", e);
                    break;
                }
            }
        }

        trace!("TcpTransport: reader task finished");
    }
}

#[async_trait]
impl Transport for TcpTransport {
    type Error = TransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let sender = self
            .write_sender
            .as_ref()
            .ok_or(TransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| TransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let receiver = self
            .read_receiver
            .as_mut()
            .ok_or(TransportError::Disconnected)?;

        match receiver.recv().await {
            Some(message) => Ok(message),
            None => {
                self.connected = false;
                Err(TransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        // Dropping the sender ends the writer task, which shuts the socket down
        self.write_sender.take();
        self.read_receiver.take();
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// Mock Transport Implementation
// ============================================================================

/// Error type for mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("Transport is disconnected")]
    Disconnected,
}

/// Mock transport for testing
///
/// Sent messages are recorded; `receive()` yields queued responses and then
/// waits until more are pushed through a [`MockTransportHandle`] or the
/// handle disconnects the peer.
pub struct MockTransport {
    /// Messages that were sent via this transport
    sent_messages: Arc<Mutex<Vec<String>>>,

    /// Incoming messages
    incoming: mpsc::UnboundedReceiver<String>,

    /// Responses queued before the first receive
    responses: VecDeque<String>,

    /// Connection status
    connected: bool,
}

/// Test-side handle used to feed a [`MockTransport`] and inspect its output
#[derive(Clone)]
pub struct MockTransportHandle {
    sent_messages: Arc<Mutex<Vec<String>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl MockTransport {
    /// Create a new mock transport together with its control handle
    pub fn new() -> (Self, MockTransportHandle) {
        let sent_messages = Arc::new(Mutex::new(Vec::new()));
        let (sender, incoming) = mpsc::unbounded_channel();

        let transport = Self {
            sent_messages: Arc::clone(&sent_messages),
            incoming,
            responses: VecDeque::new(),
            connected: true,
        };
        let handle = MockTransportHandle {
            sent_messages,
            incoming: Arc::new(Mutex::new(Some(sender))),
        };
        (transport, handle)
    }

    /// Create a mock transport with predefined responses
    pub fn with_responses(responses: Vec<String>) -> (Self, MockTransportHandle) {
        let (mut transport, handle) = Self::new();
        transport.responses.extend(responses);
        (transport, handle)
    }
}

impl MockTransportHandle {
    /// Deliver a message to the transport's `receive()`
    pub fn push_response(&self, response: impl Into<String>) {
        if let Ok(guard) = self.incoming.lock()
            && let Some(sender) = guard.as_ref()
        {
            let _ = sender.send(response.into());
        }
    }

    /// Simulate the peer closing the connection
    pub fn disconnect(&self) {
        if let Ok(mut guard) = self.incoming.lock() {
            guard.take();
        }
    }

    /// Get all messages that were sent via the transport
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages
            .lock()
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        if let Ok(mut sent) = self.sent_messages.lock() {
            sent.push(message.to_string());
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        if let Some(response) = self.responses.pop_front() {
            return Ok(response);
        }

        match self.incoming.recv().await {
            Some(response) => Ok(response),
            None => {
                self.connected = false;
                Err(MockTransportError::Disconnected)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_transport_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = vec![0u8; 64];
            let n = socket.read(&mut received).await.unwrap();
            received.truncate(n);

            // Reply with two frames in a single write
            socket.write_all(b"5\nfirst6\nsecond").await.unwrap();
            received
        });

        let mut transport = TcpTransport::connect(addr).await.unwrap();
        transport.send("hello").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), "first");
        assert_eq!(transport.receive().await.unwrap(), "second");

        let received = server.await.unwrap();
        assert_eq!(received, b"5\nhello");

        // Server dropped its socket
        assert!(matches!(
            transport.receive().await,
            Err(TransportError::Disconnected)
        ));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_tcp_transport_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = TcpTransport::connect(addr).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let (mut transport, handle) =
            MockTransport::with_responses(vec!["response1".to_string()]);

        transport.send("message1").await.unwrap();
        transport.send("message2").await.unwrap();

        assert_eq!(transport.receive().await.unwrap(), "response1");

        handle.push_response("response2");
        assert_eq!(transport.receive().await.unwrap(), "response2");

        assert_eq!(handle.sent_messages(), vec!["message1", "message2"]);

        handle.disconnect();
        assert!(transport.receive().await.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_mock_transport_close() {
        let (mut transport, _handle) = MockTransport::new();

        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send("test").await.is_err());
        assert!(transport.receive().await.is_err());
    }
}
