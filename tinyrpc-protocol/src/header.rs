//! Connection option and request/response header.

use crate::error::ProtocolError;
use crate::{MAGIC_NUMBER, MAX_OPTION_SIZE};
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec type tag negotiated in the connection option.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodecType(Cow<'static, str>);

impl CodecType {
    /// Length-prefixed binary frames with CRC32C, JSON payloads.
    pub const BINARY: CodecType = CodecType(Cow::Borrowed("application/x-tinyrpc"));
    /// Newline-delimited JSON.
    pub const JSON: CodecType = CodecType(Cow::Borrowed("application/json"));

    pub fn new(tag: impl Into<String>) -> Self {
        Self(Cow::Owned(tag.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CodecType {
    fn default() -> Self {
        Self::BINARY
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CodecType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Option exchanged once at connection start, before any framed message.
///
/// Encoded as a single JSON document terminated by `\n`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOption {
    pub magic_number: u32,
    pub codec_type: CodecType,
}

impl Default for ConnectionOption {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::default(),
        }
    }
}

impl ConnectionOption {
    pub fn new(codec_type: CodecType) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type,
        }
    }

    /// Returns whether the magic number matches this protocol.
    pub fn has_valid_magic(&self) -> bool {
        self.magic_number == MAGIC_NUMBER
    }

    /// Encodes the option as a JSON line.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Writes the option to the stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()?).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Reads the option line from the stream.
    ///
    /// Returns the option together with any bytes that arrived after the
    /// terminating newline; those belong to the framed stream.
    pub async fn read_from<R>(reader: &mut R) -> Result<(Self, BytesMut), ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = BytesMut::with_capacity(256);
        let mut scanned = 0;

        loop {
            if let Some(pos) = buf[scanned..].iter().position(|&b| b == b'\n') {
                let line = buf.split_to(scanned + pos + 1);
                let option = serde_json::from_slice(&line[..line.len() - 1])?;
                return Ok((option, buf));
            }
            scanned = buf.len();

            if buf.len() > MAX_OPTION_SIZE {
                return Err(ProtocolError::OptionTooLarge {
                    max: MAX_OPTION_SIZE,
                });
            }

            buf.reserve(256);
            if reader.read_buf(&mut buf).await? == 0 {
                return Err(if buf.is_empty() {
                    ProtocolError::Eof
                } else {
                    ProtocolError::UnexpectedEof {
                        buffered: buf.len(),
                    }
                });
            }
        }
    }
}

/// Header carried by every request and its matching response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Target method, formatted as `"Service.Method"`.
    pub service_method: String,
    /// Sequence number chosen by the caller, unique per connection.
    pub seq: u64,
    /// Empty on success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Header {
    pub fn new(service_method: impl Into<String>, seq: u64) -> Self {
        Self {
            service_method: service_method.into(),
            seq,
            error: String::new(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_type_serialization() {
        let json = serde_json::to_string(&CodecType::JSON).unwrap();
        assert_eq!(json, "\"application/json\"");

        let parsed: CodecType = serde_json::from_str("\"application/x-tinyrpc\"").unwrap();
        assert_eq!(parsed, CodecType::BINARY);
        assert_eq!(CodecType::default(), CodecType::BINARY);
    }

    #[test]
    fn test_option_wire_format() {
        let option = ConnectionOption::new(CodecType::JSON);
        let encoded = option.encode().unwrap();
        assert_eq!(
            std::str::from_utf8(&encoded).unwrap(),
            "{\"magic_number\":3927900,\"codec_type\":\"application/json\"}\n"
        );
    }

    #[tokio::test]
    async fn test_read_option_keeps_trailing_bytes() {
        let mut data = ConnectionOption::default().encode().unwrap();
        data.extend_from_slice(b"framed-data");

        let mut reader = &data[..];
        let (option, leftover) = ConnectionOption::read_from(&mut reader).await.unwrap();

        assert!(option.has_valid_magic());
        assert_eq!(option.codec_type, CodecType::BINARY);
        assert_eq!(&leftover[..], b"framed-data");
    }

    #[tokio::test]
    async fn test_read_option_across_partial_reads() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let encoded = ConnectionOption::default().encode().unwrap();

        let writer = tokio::spawn(async move {
            for chunk in encoded.chunks(5) {
                client.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let (option, leftover) = ConnectionOption::read_from(&mut server).await.unwrap();
        assert_eq!(option, ConnectionOption::default());
        assert!(leftover.is_empty());
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_read_option_wrong_magic_still_parses() {
        let data = b"{\"magic_number\":1,\"codec_type\":\"application/json\"}\n";
        let mut reader = &data[..];
        let (option, _) = ConnectionOption::read_from(&mut reader).await.unwrap();
        assert!(!option.has_valid_magic());
    }

    #[tokio::test]
    async fn test_read_option_malformed() {
        let mut reader = &b"not json\n"[..];
        let result = ConnectionOption::read_from(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Json(_))));
    }

    #[tokio::test]
    async fn test_read_option_eof() {
        let mut reader = &b""[..];
        let result = ConnectionOption::read_from(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::Eof)));

        let mut reader = &b"{\"magic"[..];
        let result = ConnectionOption::read_from(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::UnexpectedEof { .. })));
    }

    #[tokio::test]
    async fn test_read_option_too_large() {
        let data = vec![b' '; MAX_OPTION_SIZE + 512];
        let mut reader = &data[..];
        let result = ConnectionOption::read_from(&mut reader).await;
        assert!(matches!(result, Err(ProtocolError::OptionTooLarge { .. })));
    }

    #[test]
    fn test_header_error_omitted_when_empty() {
        let header = Header::new("Arith.Sum", 7);
        let json = serde_json::to_string(&header).unwrap();
        assert_eq!(json, r#"{"service_method":"Arith.Sum","seq":7}"#);
        assert!(!header.is_error());

        let header = header.with_error("boom");
        assert!(header.is_error());
        let parsed: Header = serde_json::from_str(&serde_json::to_string(&header).unwrap()).unwrap();
        assert_eq!(parsed.error, "boom");
    }
}
