//! Backend message framing
//!
//! The codeintel backend frames every JSON-RPC message on its socket with a
//! decimal byte length terminated by a newline:
//!
//! ```text
//! <length>\n<content>
//! ```
//!
//! [`RpcFrameCodec`] implements this as a tokio-util codec so it can be driven
//! from any byte stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Maximum message size to prevent memory exhaustion
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Longest length header we accept before giving up on finding the newline
const MAX_HEADER_DIGITS: usize = 20;

/// Error types for backend framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid length header: {0:?}")]
    InvalidLength(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Message is not valid UTF-8")]
    InvalidUtf8,
}

/// Length-prefixed framing codec
#[derive(Debug, Default)]
pub struct RpcFrameCodec {
    /// Content length of the frame being assembled, once its header is read
    pending_length: Option<usize>,
}

impl RpcFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the length header at the front of `src`
    ///
    /// Returns None if the terminating newline has not arrived yet.
    fn parse_header(src: &mut BytesMut) -> Result<Option<usize>, FramingError> {
        let newline = match src.iter().position(|b| *b == b'\n') {
            Some(position) => position,
            None if src.len() > MAX_HEADER_DIGITS => {
                return Err(FramingError::InvalidLength(
                    String::from_utf8_lossy(&src[..MAX_HEADER_DIGITS]).into_owned(),
                ));
            }
            None => return Ok(None),
        };

        let header = String::from_utf8_lossy(&src[..newline]).trim().to_string();
        let length = header
            .parse::<usize>()
            .map_err(|_| FramingError::InvalidLength(header.clone()))?;

        if length > MAX_MESSAGE_SIZE {
            return Err(FramingError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        src.advance(newline + 1);
        Ok(Some(length))
    }
}

impl Decoder for RpcFrameCodec {
    type Item = String;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length {
            Some(length) => length,
            None => match Self::parse_header(src)? {
                Some(length) => {
                    self.pending_length = Some(length);
                    length
                }
                None => return Ok(None),
            },
        };

        if src.len() < length {
            trace!(
                "RpcFrameCodec: Incomplete message - need {} more bytes",
                length - src.len()
            );
            src.reserve(length - src.len());
            return Ok(None);
        }

        self.pending_length = None;
        let content = src.split_to(length);
        let message = String::from_utf8(content.to_vec()).map_err(|_| FramingError::InvalidUtf8)?;

        trace!("RpcFrameCodec: Parsed complete message ({} bytes)", length);
        Ok(Some(message))
    }
}

impl Encoder<String> for RpcFrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.len();
        if length > MAX_MESSAGE_SIZE {
            return Err(FramingError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let header = format!("{}\n", length);
        dst.reserve(header.len() + length);
        dst.put_slice(header.as_bytes());
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(content: &str) -> String {
        format!("{}\n{}", content.len(), content)
    }

    #[test]
    fn test_encode_writes_length_header() {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::new();

        codec
            .encode(r#"{"id":1}"#.to_string(), &mut buffer)
            .unwrap();

        assert_eq!(&buffer[..], b"8\n{\"id\":1}");
    }

    #[test]
    fn test_decode_partial_message() {
        let mut codec = RpcFrameCodec::new();
        let message = r#"{"jsonrpc":"2.0","id":1,"result":null}"#;
        let framed = frame(message);
        let (first, second) = framed.split_at(10);

        let mut buffer = BytesMut::from(first);
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(second.as_bytes());
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some(message));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_decode_header_split_across_reads() {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::from("1");
        assert!(codec.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"2\n{\"line\":42}");
        assert_eq!(
            codec.decode(&mut buffer).unwrap().as_deref(),
            Some(r#"{"line":42}"#)
        );
    }

    #[test]
    fn test_decode_multiple_messages() {
        let mut codec = RpcFrameCodec::new();
        let first = r#"{"id":1}"#;
        let second = r#"{"id":2,"result":"ünïcode"}"#;
        let mut buffer = BytesMut::from(format!("{}{}", frame(first), frame(second)).as_str());

        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some(first));
        assert_eq!(codec.decode(&mut buffer).unwrap().as_deref(), Some(second));
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_decode_message_too_large() {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::from(format!("{}\n", MAX_MESSAGE_SIZE + 1).as_str());

        let result = codec.decode(&mut buffer);
        assert!(matches!(result, Err(FramingError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_decode_invalid_length() {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::from("abc\n{}");

        let result = codec.decode(&mut buffer);
        assert!(matches!(result, Err(FramingError::InvalidLength(ref h)) if h == "abc"));
    }

    #[test]
    fn test_decode_runaway_header() {
        let mut codec = RpcFrameCodec::new();
        let mut buffer = BytesMut::from("{\"no\":\"header at all\"}");

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(FramingError::InvalidLength(_))
        ));
    }
}
