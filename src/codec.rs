// src/codec.rs

//! Message codecs.
//!
//! A [`Codec`] is a pair of pure functions mapping messages to and from
//! bytes. The default is [`MsgPackCodec`], a schemaless binary encoding
//! that round-trips every [`Value`](crate::Value) shape, including byte
//! strings. [`JsonCodec`] is available for interoperability with text
//! tooling; JSON has no distinct binary type, so byte-string values do not
//! survive a JSON round trip unchanged.
//!
//! With the `encryption` feature, [`EncryptedCodec`] wraps any inner codec
//! with Fernet authenticated encryption. Keys are derived the same way on
//! every process (`urlsafe_b64(sha256(key))`), the first configured key
//! encrypts, and all keys are tried for decryption so keys can be rotated
//! without dropping in-flight messages.

use std::sync::Arc;

use bytes::Bytes;

use crate::{Error, Message, Result};

/// Message codec: `encode(message) -> bytes`, `decode(bytes) -> message`.
///
/// Implementations must be pure and panic-free; a decode failure is an
/// `Error::Serialization`, never a crash.
pub trait Codec: Send + Sync {
    /// Encode a message to bytes.
    fn encode(&self, message: &Message) -> Result<Bytes>;

    /// Decode bytes back to a message.
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// Shared codec pointer.
pub type CodecPtr = Arc<dyn Codec>;

/// Default binary codec (MessagePack).
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    // ---

    fn encode(&self, message: &Message) -> Result<Bytes> {
        // ---
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &message.to_value())
            .map_err(|err| Error::Serialization(format!("msgpack encode failed: {err}")))?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        // ---
        let mut cursor = bytes;
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|err| Error::Serialization(format!("msgpack decode failed: {err}")))?;
        Message::from_value(value)
    }
}

/// UTF-8 JSON codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    // ---

    fn encode(&self, message: &Message) -> Result<Bytes> {
        // ---
        let buf = serde_json::to_vec(&message.to_value())
            .map_err(|err| Error::Serialization(format!("json encode failed: {err}")))?;
        Ok(Bytes::from(buf))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        // ---
        let value: crate::Value = serde_json::from_slice(bytes)
            .map_err(|err| Error::Serialization(format!("json decode failed: {err}")))?;
        Message::from_value(value)
    }
}

#[cfg(feature = "encryption")]
pub use encrypted::EncryptedCodec;

#[cfg(feature = "encryption")]
mod encrypted {
    // ---
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine as _;
    use bytes::Bytes;
    use fernet::{Fernet, MultiFernet};
    use sha2::{Digest, Sha256};

    use super::{Codec, CodecPtr};
    use crate::{Error, Message, Result};

    /// Codec wrapper applying Fernet authenticated encryption.
    ///
    /// The stored form is the Fernet token (base64 text) of the inner
    /// codec's output.
    pub struct EncryptedCodec {
        inner: CodecPtr,
        crypter: MultiFernet,
    }

    impl EncryptedCodec {
        /// Wrap `inner` with the given symmetric keys.
        ///
        /// Keys may be any byte strings; each is stretched to a Fernet key
        /// via SHA-256. The first key encrypts new payloads; every key is
        /// tried during decryption, oldest configuration last.
        ///
        /// # Errors
        ///
        /// `Configuration` if `keys` is empty.
        pub fn new<K: AsRef<[u8]>>(inner: CodecPtr, keys: &[K]) -> Result<Self> {
            // ---
            if keys.is_empty() {
                return Err(Error::Configuration(
                    "symmetric_encryption_keys must not be empty".to_string(),
                ));
            }

            let fernets = keys
                .iter()
                .map(|key| {
                    let formatted = URL_SAFE.encode(Sha256::digest(key.as_ref()));
                    Fernet::new(&formatted).ok_or_else(|| {
                        Error::Configuration("could not derive encryption key".to_string())
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(Self {
                inner,
                crypter: MultiFernet::new(fernets),
            })
        }
    }

    impl Codec for EncryptedCodec {
        // ---

        fn encode(&self, message: &Message) -> Result<Bytes> {
            // ---
            let plain = self.inner.encode(message)?;
            let token = self.crypter.encrypt(&plain);
            Ok(Bytes::from(token.into_bytes()))
        }

        fn decode(&self, bytes: &[u8]) -> Result<Message> {
            // ---
            let token = std::str::from_utf8(bytes)
                .map_err(|_| Error::Serialization("encrypted payload is not a token".to_string()))?;
            let plain = self
                .crypter
                .decrypt(token)
                .map_err(|_| Error::Serialization("payload decryption failed".to_string()))?;
            self.inner.decode(&plain)
        }
    }
}
