//! Transport layer - Pure I/O abstraction for message exchange
//!
//! This module provides the byte-stream transport abstraction used below the
//! frame codec. A transport moves raw string chunks in both directions and
//! knows nothing about message framing or process management.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Size of the read buffer for stream reading operations
const READ_BUFFER_SIZE: usize = 4096;

/// Default capacity for UTF-8 accumulation buffer
const UTF8_ACCUMULATION_BUFFER_CAPACITY: usize = 8192;

/// Core transport trait for bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a raw chunk of data
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next available chunk of data
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check if transport is still active
    fn is_connected(&self) -> bool;
}

/// Error types for stream transports
#[derive(Debug, thiserror::Error)]
pub enum StreamTransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Channel error: {0}")]
    Channel(String),
}

/// Transport over a pair of byte-stream halves (child stdio, TCP or Unix
/// socket). Writing and reading are offloaded to background tasks connected
/// through unbounded channels, so `send` never blocks on the peer.
#[derive(Debug)]
pub struct StreamTransport {
    /// Channel feeding the writer task
    writer_sender: Option<mpsc::UnboundedSender<String>>,

    /// Channel fed by the reader task
    reader_receiver: Option<mpsc::UnboundedReceiver<String>>,

    /// Connection status
    connected: bool,
}

/// Internal state for the reader task that handles UTF-8 byte accumulation
struct ReaderState {
    /// Buffer for accumulating raw bytes before UTF-8 conversion
    byte_buffer: Vec<u8>,

    /// Buffer capacity to avoid frequent reallocations
    buffer_capacity: usize,
}

impl ReaderState {
    fn new() -> Self {
        Self {
            byte_buffer: Vec::with_capacity(UTF8_ACCUMULATION_BUFFER_CAPACITY),
            buffer_capacity: UTF8_ACCUMULATION_BUFFER_CAPACITY,
        }
    }

    fn add_bytes(&mut self, bytes: &[u8]) {
        self.byte_buffer.extend_from_slice(bytes);
    }

    /// Extract the longest valid UTF-8 prefix from the buffer.
    ///
    /// Returns `Err` if the buffer starts with bytes that can never become
    /// valid UTF-8 no matter how much more data arrives.
    fn extract_valid_utf8(&mut self) -> Result<Option<String>, std::str::Utf8Error> {
        if self.byte_buffer.is_empty() {
            return Ok(None);
        }

        match std::str::from_utf8(&self.byte_buffer) {
            Ok(_) => {
                let bytes: Vec<u8> = self.byte_buffer.drain(..).collect();
                Ok(String::from_utf8(bytes).ok())
            }
            Err(e) => {
                let valid_end = e.valid_up_to();
                if valid_end == 0 {
                    if e.error_len().is_some() {
                        // Invalid sequence at the front, not an incomplete one
                        return Err(e);
                    }
                    // Incomplete sequence, wait for more data
                    Ok(None)
                } else {
                    let bytes: Vec<u8> = self.byte_buffer.drain(..valid_end).collect();
                    Ok(String::from_utf8(bytes).ok())
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.byte_buffer.capacity() > self.buffer_capacity * 2 {
            self.byte_buffer.shrink_to(self.buffer_capacity);
        }
    }
}

impl StreamTransport {
    /// Create a transport from arbitrary read/write halves
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_sender, writer_receiver) = mpsc::unbounded_channel();
        let (reader_sender, reader_receiver) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(writer, writer_receiver));
        tokio::spawn(Self::reader_task(reader, reader_sender));

        Self {
            writer_sender: Some(writer_sender),
            reader_receiver: Some(reader_receiver),
            connected: true,
        }
    }

    /// Create a transport over a child process's piped stdio
    pub fn from_child_stdio(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self::new(stdout, stdin)
    }

    /// Create a transport over a connected TCP stream
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half)
    }

    /// Create a transport over a connected Unix domain socket
    #[cfg(unix)]
    pub fn from_unix(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self::new(read_half, write_half)
    }

    /// Background task that writes outgoing chunks to the stream
    async fn writer_task<W: AsyncWrite + Unpin>(
        mut writer: W,
        mut receiver: mpsc::UnboundedReceiver<String>,
    ) {
        while let Some(message) = receiver.recv().await {
            trace!("StreamTransport: writing chunk (length: {})", message.len());

            if let Err(e) = writer.write_all(message.as_bytes()).await {
                error!("Failed to write to stream: {}", e);
                break;
            }

            if let Err(e) = writer.flush().await {
                error!("Failed to flush stream: {}", e);
                break;
            }
        }

        trace!("StreamTransport: writer task finished");
    }

    /// Background task that reads incoming bytes with byte-safe UTF-8 handling
    async fn reader_task<R: AsyncRead + Unpin>(reader: R, sender: mpsc::UnboundedSender<String>) {
        let mut reader = BufReader::new(reader);
        let mut state = ReaderState::new();
        let mut read_buffer = Box::new([0u8; READ_BUFFER_SIZE]);

        loop {
            match reader.read(read_buffer.as_mut()).await {
                Ok(0) => {
                    Self::handle_eof(&mut state, &sender);
                    break;
                }
                Ok(n) => {
                    state.add_bytes(&read_buffer[..n]);

                    loop {
                        match state.extract_valid_utf8() {
                            Ok(Some(chunk)) => {
                                if sender.send(chunk).is_err() {
                                    trace!(
                                        "StreamTransport: receiver dropped, stopping reader"
                                    );
                                    return;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!("StreamTransport: invalid UTF-8 from peer: {}", e);
                                return;
                            }
                        }
                    }

                    state.compact();
                }
                Err(e) => {
                    error!("Failed to read from stream: {}", e);
                    break;
                }
            }
        }

        trace!("StreamTransport: reader task finished");
    }

    /// Handle EOF by flushing any remaining valid UTF-8 bytes
    fn handle_eof(state: &mut ReaderState, sender: &mpsc::UnboundedSender<String>) {
        trace!("StreamTransport: reader reached EOF");

        if let Ok(Some(final_chunk)) = state.extract_valid_utf8()
            && !final_chunk.is_empty()
            && sender.send(final_chunk).is_err()
        {
            trace!("StreamTransport: receiver dropped during EOF processing");
        }

        if !state.byte_buffer.is_empty() {
            error!(
                "StreamTransport: {} incomplete bytes remaining at EOF",
                state.byte_buffer.len()
            );
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    type Error = StreamTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(StreamTransportError::Disconnected);
        }

        let sender = self
            .writer_sender
            .as_ref()
            .ok_or(StreamTransportError::Disconnected)?;

        sender
            .send(message.to_string())
            .map_err(|e| StreamTransportError::Channel(e.to_string()))?;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(StreamTransportError::Disconnected);
        }

        let receiver = self
            .reader_receiver
            .as_mut()
            .ok_or(StreamTransportError::Disconnected)?;

        receiver
            .recv()
            .await
            .ok_or(StreamTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.writer_sender.take();
        self.reader_receiver.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
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
    #[error("No more responses available")]
    NoMoreResponses,
}

/// Mock transport for testing - records sent chunks and replays scripted ones
pub struct MockTransport {
    /// Chunks that were sent via this transport
    sent_messages: Arc<Mutex<Vec<String>>>,

    /// Predefined chunks to return when receive() is called
    responses: Arc<Mutex<VecDeque<String>>>,

    /// Connection status
    connected: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            sent_messages: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            connected: true,
        }
    }

    /// Create a mock transport with predefined incoming chunks
    pub fn with_responses(responses: Vec<String>) -> Self {
        let transport = Self::new();
        transport
            .responses
            .lock()
            .unwrap()
            .extend(responses);
        transport
    }

    /// Queue a chunk to be returned by a later receive() call
    pub fn add_response(&self, response: String) {
        self.responses.lock().unwrap().push_back(response);
    }

    /// Get all chunks that were sent via this transport
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent_messages.lock().unwrap().clone()
    }

    /// Shared handle to the sent-chunk log, usable after the transport moves
    pub fn sent_messages_handle(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.sent_messages)
    }

    pub fn has_responses(&self) -> bool {
        !self.responses.lock().unwrap().is_empty()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        self.sent_messages.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }

        let mut responses = self.responses.lock().unwrap();
        responses
            .pop_front()
            .ok_or(MockTransportError::NoMoreResponses)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stream_transport_over_child_stdio() {
        let mut child = Command::new("echo")
            .arg("hello world")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to spawn echo command");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();

        let mut transport = StreamTransport::from_child_stdio(stdin, stdout);

        let output = transport.receive().await.unwrap();
        assert_eq!(output.trim(), "hello world");

        assert!(transport.is_connected());

        transport.close().await.unwrap();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_stream_transport_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut socket, &buf[..n])
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut transport = StreamTransport::from_tcp(stream);

        transport.send("ping").await.unwrap();
        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed, "ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mock_transport_send_receive() {
        let mut transport =
            MockTransport::with_responses(vec!["response1".to_string(), "response2".to_string()]);

        transport.send("message1").await.unwrap();
        transport.send("message2").await.unwrap();

        let response1 = transport.receive().await.unwrap();
        assert_eq!(response1, "response1");

        let response2 = transport.receive().await.unwrap();
        assert_eq!(response2, "response2");

        let sent = transport.sent_messages();
        assert_eq!(sent, vec!["message1", "message2"]);

        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let mut transport = MockTransport::new();

        assert!(transport.is_connected());

        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send("test").await.is_err());
        assert!(transport.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_reader_state_accumulates_partial_utf8() {
        let mut state = ReaderState::new();

        // First 2 bytes of "世"
        state.add_bytes(&[0xE4, 0xB8]);
        assert!(state.extract_valid_utf8().unwrap().is_none());

        // Final byte of "世"
        state.add_bytes(&[0x96]);
        let extracted = state.extract_valid_utf8().unwrap().expect("complete char");
        assert_eq!(extracted, "世");

        assert!(state.extract_valid_utf8().unwrap().is_none());
        assert!(state.byte_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_reader_state_mixed_boundaries() {
        let mut state = ReaderState::new();

        state.add_bytes("Hello ".as_bytes());
        assert_eq!(state.extract_valid_utf8().unwrap().unwrap(), "Hello ");

        state.add_bytes(&[0xE4, 0xB8]); // partial "世"
        assert!(state.extract_valid_utf8().unwrap().is_none());

        state.add_bytes(&[0x96, 0xE7, 0x95]); // complete "世" + partial "界"
        assert_eq!(state.extract_valid_utf8().unwrap().unwrap(), "世");

        state.add_bytes(&[0x8C, 0x20, 0xF0, 0x9F]); // complete "界" + " " + partial 🌍
        assert_eq!(state.extract_valid_utf8().unwrap().unwrap(), "界 ");

        state.add_bytes(&[0x8C, 0x8D]); // complete 🌍
        assert_eq!(state.extract_valid_utf8().unwrap().unwrap(), "🌍");

        assert!(state.byte_buffer.is_empty());
    }

    #[tokio::test]
    async fn test_reader_state_rejects_invalid_utf8() {
        let mut state = ReaderState::new();

        // 0xFF can never start a valid UTF-8 sequence
        state.add_bytes(&[0xFF, 0x41]);
        assert!(state.extract_valid_utf8().is_err());
    }
}
