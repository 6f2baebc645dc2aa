//! Codecs: header/body readers and writers over async byte streams.

use crate::error::ProtocolError;
use crate::frame::{BinaryFraming, Framing, LineFraming};
use crate::header::{CodecType, Header};
use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Bytes reserved ahead of each socket read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads headers and bodies from a stream, one message at a time.
pub struct CodecReader<R> {
    inner: R,
    framing: Arc<dyn Framing>,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> CodecReader<R> {
    pub fn new(inner: R, framing: Arc<dyn Framing>) -> Self {
        Self::with_buffer(inner, framing, BytesMut::new())
    }

    /// Creates a reader that first consumes bytes already read from the stream.
    pub fn with_buffer(inner: R, framing: Arc<dyn Framing>, buffer: BytesMut) -> Self {
        Self {
            inner,
            framing,
            buffer,
        }
    }

    async fn next_message(&mut self) -> Result<Bytes, ProtocolError> {
        loop {
            if let Some(message) = self.framing.decode(&mut self.buffer)? {
                return Ok(message);
            }

            self.buffer.reserve(READ_CHUNK_SIZE);
            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                return Err(if self.buffer.is_empty() {
                    ProtocolError::Eof
                } else {
                    ProtocolError::UnexpectedEof {
                        buffered: self.buffer.len(),
                    }
                });
            }
        }
    }

    /// Reads the next header.
    pub async fn read_header(&mut self) -> Result<Header, ProtocolError> {
        let message = self.next_message().await?;
        Ok(serde_json::from_slice(&message)?)
    }

    /// Reads the body following a header.
    ///
    /// The body message is consumed even when it fails its checksum or fails
    /// to decode, so the next call starts on the following header.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        let message = self.next_message().await?;
        serde_json::from_slice(&message).map_err(ProtocolError::Body)
    }

    /// Returns the number of bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Writes header/body pairs to a stream.
pub struct CodecWriter<W> {
    inner: W,
    framing: Arc<dyn Framing>,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> CodecWriter<W> {
    pub fn new(inner: W, framing: Arc<dyn Framing>) -> Self {
        Self {
            inner,
            framing,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Writes one header and its body as a single buffered write.
    pub async fn write<T>(&mut self, header: &Header, body: &T) -> Result<(), ProtocolError>
    where
        T: Serialize + ?Sized,
    {
        self.buffer.clear();
        let header_bytes = serde_json::to_vec(header)?;
        let body_bytes = serde_json::to_vec(body)?;
        self.framing.encode(&header_bytes, &mut self.buffer)?;
        self.framing.encode(&body_bytes, &mut self.buffer)?;

        self.inner.write_all(&self.buffer).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Shuts down the write side of the stream.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// One codec instance serving one connection for its lifetime.
pub struct Codec<S> {
    codec_type: CodecType,
    reader: CodecReader<ReadHalf<S>>,
    writer: CodecWriter<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> Codec<S> {
    pub fn new(
        stream: S,
        codec_type: CodecType,
        framing: Arc<dyn Framing>,
        leftover: BytesMut,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            codec_type,
            reader: CodecReader::with_buffer(read_half, framing.clone(), leftover),
            writer: CodecWriter::new(write_half, framing),
        }
    }

    pub fn codec_type(&self) -> &CodecType {
        &self.codec_type
    }

    /// Splits the codec so reads and writes can be owned by different tasks.
    pub fn into_split(self) -> (CodecReader<ReadHalf<S>>, CodecWriter<WriteHalf<S>>) {
        (self.reader, self.writer)
    }
}

/// Maps codec type tags to framings.
///
/// Built once at startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    framings: HashMap<CodecType, Arc<dyn Framing>>,
}

impl CodecRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in binary and JSON codecs.
    pub fn with_defaults() -> Self {
        Self::new()
            .register(CodecType::BINARY, BinaryFraming)
            .register(CodecType::JSON, LineFraming)
    }

    /// Registers a framing under a type tag, replacing any previous entry.
    pub fn register(mut self, codec_type: CodecType, framing: impl Framing + 'static) -> Self {
        self.framings.insert(codec_type, Arc::new(framing));
        self
    }

    /// Keeps only the listed codecs. Tags not registered here are ignored.
    pub fn retain(mut self, codec_types: &[CodecType]) -> Self {
        self.framings.retain(|codec_type, _| codec_types.contains(codec_type));
        self
    }

    pub fn get(&self, codec_type: &CodecType) -> Option<Arc<dyn Framing>> {
        self.framings.get(codec_type).cloned()
    }

    pub fn contains(&self, codec_type: &CodecType) -> bool {
        self.framings.contains_key(codec_type)
    }

    /// Returns registered type tags, sorted.
    pub fn codec_types(&self) -> Vec<CodecType> {
        let mut types: Vec<_> = self.framings.keys().cloned().collect();
        types.sort();
        types
    }

    /// Builds a codec for the stream, or `None` if the tag is unknown.
    pub fn new_codec<S>(
        &self,
        codec_type: &CodecType,
        stream: S,
        leftover: BytesMut,
    ) -> Option<Codec<S>>
    where
        S: AsyncRead + AsyncWrite,
    {
        let framing = self.get(codec_type)?;
        Some(Codec::new(stream, codec_type.clone(), framing, leftover))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    fn framings() -> Vec<Arc<dyn Framing>> {
        vec![Arc::new(BinaryFraming), Arc::new(LineFraming)]
    }

    #[test]
    fn test_registry_defaults() {
        let registry = CodecRegistry::with_defaults();
        assert!(registry.contains(&CodecType::BINARY));
        assert!(registry.contains(&CodecType::JSON));
        assert!(registry.get(&CodecType::new("application/gob")).is_none());
        assert_eq!(
            registry.codec_types(),
            vec![CodecType::JSON, CodecType::BINARY]
        );
        assert!(CodecRegistry::new().codec_types().is_empty());
    }

    #[test]
    fn test_registry_retain() {
        let registry = CodecRegistry::with_defaults()
            .retain(&[CodecType::BINARY, CodecType::new("application/gob")]);
        assert_eq!(registry.codec_types(), vec![CodecType::BINARY]);
        assert!(!registry.contains(&CodecType::JSON));
    }

    #[tokio::test]
    async fn test_registry_unknown_codec() {
        let (stream, _peer) = tokio::io::duplex(64);
        let registry = CodecRegistry::with_defaults();
        let codec = registry.new_codec(&CodecType::new("text/xml"), stream, BytesMut::new());
        assert!(codec.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_each_framing() {
        for framing in framings() {
            let (client, server) = tokio::io::duplex(1024);
            let mut writer = CodecWriter::new(client, framing.clone());
            let mut reader = CodecReader::new(server, framing);

            writer
                .write(&Header::new("Arith.Sum", 1), &json!({"a": 1, "b": 2}))
                .await
                .unwrap();

            let header = reader.read_header().await.unwrap();
            assert_eq!(header.service_method, "Arith.Sum");
            assert_eq!(header.seq, 1);
            let body: Value = reader.read_body().await.unwrap();
            assert_eq!(body["b"], 2);
        }
    }

    #[tokio::test]
    async fn test_body_decode_error_keeps_stream_aligned() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = CodecWriter::new(client, Arc::new(BinaryFraming));
        let mut reader = CodecReader::new(server, Arc::new(BinaryFraming));

        writer
            .write(&Header::new("Echo.Say", 1), "not a number")
            .await
            .unwrap();
        writer.write(&Header::new("Echo.Say", 2), &42u32).await.unwrap();

        assert_eq!(reader.read_header().await.unwrap().seq, 1);
        let err = reader.read_body::<u32>().await.unwrap_err();
        assert!(err.is_recoverable());

        assert_eq!(reader.read_header().await.unwrap().seq, 2);
        assert_eq!(reader.read_body::<u32>().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_reader_eof() {
        let (client, server) = tokio::io::duplex(64);
        let mut reader = CodecReader::new(server, Arc::new(LineFraming));
        drop(client);

        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, ProtocolError::Eof));
    }

    #[tokio::test]
    async fn test_reader_unexpected_eof() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = CodecReader::new(server, Arc::new(LineFraming));
        client.write_all(b"{\"service_method\"").await.unwrap();
        drop(client);

        let err = reader.read_header().await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof { .. }));
    }

    #[tokio::test]
    async fn test_codec_uses_leftover_bytes() {
        let mut leftover = BytesMut::new();
        LineFraming
            .encode(br#"{"service_method":"A.B","seq":9}"#, &mut leftover)
            .unwrap();
        LineFraming.encode(b"null", &mut leftover).unwrap();

        let (stream, _peer) = tokio::io::duplex(64);
        let codec = CodecRegistry::with_defaults()
            .new_codec(&CodecType::JSON, stream, leftover)
            .unwrap();
        assert_eq!(codec.codec_type(), &CodecType::JSON);

        let (mut reader, _writer) = codec.into_split();
        assert_eq!(reader.read_header().await.unwrap().seq, 9);
        let body: Value = reader.read_body().await.unwrap();
        assert!(body.is_null());
        assert_eq!(reader.buffered(), 0);
    }

    proptest! {
        #[test]
        fn prop_binary_reassembles_split_messages(split in 1usize..40) {
            let mut encoded = BytesMut::new();
            BinaryFraming.encode(br#"{"service_method":"Arith.Sum","seq":3}"#, &mut encoded).unwrap();
            let split = split.min(encoded.len() - 1);

            let mut buf = BytesMut::from(&encoded[..split]);
            prop_assert!(BinaryFraming.decode(&mut buf).unwrap().is_none());
            buf.extend_from_slice(&encoded[split..]);
            let payload = BinaryFraming.decode(&mut buf).unwrap().unwrap();
            let header: Header = serde_json::from_slice(&payload).unwrap();
            prop_assert_eq!(header.seq, 3);
        }
    }
}
