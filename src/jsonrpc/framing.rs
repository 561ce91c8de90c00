//! Content-Length frame codec
//!
//! LSP messages travel as `Content-Length: <n>\r\n\r\n<body>` where `<n>`
//! counts the UTF-8 bytes of the body. This wrapper turns a chunk-oriented
//! transport into a message-oriented one: writes emit one full frame per
//! message, reads accumulate bytes until a complete frame is available.

use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::trace;

use crate::io::transport::Transport;
use crate::jsonrpc::error::RpcError;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Frame codec over any byte transport.
///
/// The receive buffer is kept as raw bytes so the body read is byte-exact:
/// `Content-Length` counts bytes, not characters, and a frame boundary may
/// land in the middle of a transport chunk.
pub struct FramedTransport<T: Transport> {
    /// Underlying transport
    transport: T,

    /// Buffer accumulating partial frames
    receive_buffer: Vec<u8>,

    /// Complete message bodies ready to be returned
    message_queue: VecDeque<String>,
}

impl<T: Transport> FramedTransport<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            receive_buffer: Vec::new(),
            message_queue: VecDeque::new(),
        }
    }

    /// Get a reference to the underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Unwrap and return the underlying transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Try to extract one complete frame from the receive buffer.
    ///
    /// Returns `Some(body)` if a full frame was available, `None` if more
    /// data is needed.
    fn try_parse_frame(&mut self) -> Result<Option<String>, RpcError> {
        let Some(header_end) = find_header_end(&self.receive_buffer) else {
            return Ok(None);
        };

        let header = std::str::from_utf8(&self.receive_buffer[..header_end])
            .map_err(|_| RpcError::parse("frame header is not valid UTF-8"))?;
        let content_length = parse_content_length(header)?;
        let content_start = header_end + 4;

        let available = self.receive_buffer.len() - content_start;
        if available < content_length {
            trace!(
                "FramedTransport: incomplete frame, need {} more bytes",
                content_length - available
            );
            return Ok(None);
        }

        let body_bytes: Vec<u8> = self
            .receive_buffer
            .drain(..content_start + content_length)
            .skip(content_start)
            .collect();
        let body = String::from_utf8(body_bytes)
            .map_err(|_| RpcError::parse("frame body is not valid UTF-8"))?;

        trace!("FramedTransport: parsed complete frame ({content_length} bytes)");
        Ok(Some(body))
    }

    /// Pull one chunk from the transport and queue any completed frames
    async fn process_transport_data(&mut self) -> Result<(), RpcError> {
        let chunk = self
            .transport
            .receive()
            .await
            .map_err(|e| RpcError::transport(format!("server connection closed: {e}")))?;

        self.receive_buffer.extend_from_slice(chunk.as_bytes());

        while let Some(body) = self.try_parse_frame()? {
            self.message_queue.push_back(body);
        }

        Ok(())
    }
}

/// Byte offset of the `\r\n\r\n` header terminator, if present
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Parse the Content-Length value from a frame header block.
///
/// Every header line must have `Key: Value` form; exactly one of them must
/// be `Content-Length`.
fn parse_content_length(header: &str) -> Result<usize, RpcError> {
    let mut content_length = None;

    for line in header.split("\r\n").filter(|l| !l.is_empty()) {
        if !line.contains(':') {
            return Err(RpcError::parse(format!("invalid header line: {line:?}")));
        }

        if let Some(length_str) = line.strip_prefix("Content-Length:") {
            let length_str = length_str.trim();
            let length = length_str.parse::<usize>().map_err(|_| {
                RpcError::parse(format!("invalid Content-Length value: {length_str:?}"))
            })?;

            if length > MAX_MESSAGE_SIZE {
                return Err(RpcError::MessageTooLarge {
                    size: length,
                    max: MAX_MESSAGE_SIZE,
                });
            }

            content_length = Some(length);
        }
    }

    content_length.ok_or_else(|| RpcError::parse("missing Content-Length header"))
}

#[async_trait]
impl<T: Transport> Transport for FramedTransport<T> {
    type Error = RpcError;

    /// Send one message body, framed
    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        let framed = format!("Content-Length: {}\r\n\r\n{}", message.len(), message);

        trace!(
            "FramedTransport: sending frame ({} bytes content)",
            message.len()
        );

        self.transport
            .send(&framed)
            .await
            .map_err(|e| RpcError::transport(format!("server connection closed: {e}")))
    }

    /// Receive the next complete message body
    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(body) = self.message_queue.pop_front() {
                return Ok(body);
            }

            self.process_transport_data().await?;
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport
            .close()
            .await
            .map_err(|e| RpcError::transport(e.to_string()))
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}
