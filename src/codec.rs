//! Pluggable payload codecs.
//!
//! A [`Codec`] turns raw record bytes into a typed payload and back. Decoding
//! is used for every live record and snapshot entry; encoding is only needed
//! when a repository of `T` values is frozen into a snapshot.

use std::marker::PhantomData;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{DecodeError, EncodeError};

/// Converts between record payload bytes and a typed value.
pub trait Codec<T>: Send + Sync {
    /// Decode a record payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the bytes are not a valid encoding of `T`.
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError>;

    /// Encode a value into payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError`] if the value cannot be represented.
    fn encode(&self, value: &T) -> Result<Vec<u8>, EncodeError>;
}

/// UTF-8 text payloads. Encoding writes the string bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn decode(&self, bytes: &[u8]) -> Result<String, DecodeError> {
        String::from_utf8(bytes.to_vec()).map_err(DecodeError::new)
    }

    fn encode(&self, value: &String) -> Result<Vec<u8>, EncodeError> {
        Ok(value.as_bytes().to_vec())
    }
}

/// Opaque byte payloads, passed through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Vec<u8>> for RawCodec {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
        Ok(bytes.to_vec())
    }

    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>, EncodeError> {
        Ok(value.clone())
    }
}

/// JSON payloads via `serde_json`.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create a JSON codec for `T`.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonCodec")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> for JsonCodec<T> {
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        serde_json::from_slice(bytes).map_err(DecodeError::new)
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(value).map_err(EncodeError::new)
    }
}

/// Decrypts text payloads before they reach the inner codec.
pub trait TextDecryptor: Send + Sync {
    /// Decrypt a cipher text.
    fn decrypt(&self, cipher_text: &str) -> Result<String, DecodeError>;

    /// Encrypt a plain text.
    fn encrypt(&self, plain_text: &str) -> Result<String, EncodeError>;
}

/// A [`TextDecryptor`] that leaves text unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpDecryptor;

impl TextDecryptor for NoOpDecryptor {
    fn decrypt(&self, cipher_text: &str) -> Result<String, DecodeError> {
        Ok(cipher_text.to_owned())
    }

    fn encrypt(&self, plain_text: &str) -> Result<String, EncodeError> {
        Ok(plain_text.to_owned())
    }
}

/// Codec adapter: payload bytes are UTF-8 cipher text, decrypted with `D`
/// and then handed to the inner codec `C`.
#[derive(Debug, Clone)]
pub struct Decrypting<C, D> {
    inner: C,
    decryptor: D,
}

impl<C, D> Decrypting<C, D> {
    /// Wrap `inner` so that payloads pass through `decryptor` first.
    pub fn new(inner: C, decryptor: D) -> Self {
        Self { inner, decryptor }
    }
}

impl<T, C, D> Codec<T> for Decrypting<C, D>
where
    C: Codec<T>,
    D: TextDecryptor,
{
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        let cipher_text = std::str::from_utf8(bytes).map_err(DecodeError::new)?;
        let plain_text = self.decryptor.decrypt(cipher_text)?;
        self.inner.decode(plain_text.as_bytes())
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        let plain = self.inner.encode(value)?;
        let plain_text = String::from_utf8(plain).map_err(EncodeError::new)?;
        Ok(self.decryptor.encrypt(&plain_text)?.into_bytes())
    }
}

type DecodeFn<T> = Box<dyn Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync>;
type EncodeFn<T> = Box<dyn Fn(&T) -> Result<Vec<u8>, EncodeError> + Send + Sync>;

/// Codec assembled from a pair of closures.
pub struct FnCodec<T> {
    decode: DecodeFn<T>,
    encode: EncodeFn<T>,
}

impl<T> FnCodec<T> {
    /// Build a codec from a decode and an encode function.
    pub fn new(
        decode: impl Fn(&[u8]) -> Result<T, DecodeError> + Send + Sync + 'static,
        encode: impl Fn(&T) -> Result<Vec<u8>, EncodeError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            decode: Box::new(decode),
            encode: Box::new(encode),
        }
    }
}

impl<T> Codec<T> for FnCodec<T> {
    fn decode(&self, bytes: &[u8]) -> Result<T, DecodeError> {
        (self.decode)(bytes)
    }

    fn encode(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        (self.encode)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_codec_decodes_multibyte_text() {
        let decoded = Utf8Codec
            .decode("ßome dätä".as_bytes())
            .expect("valid UTF-8 should decode");
        assert_eq!(decoded, "ßome dätä");
    }

    #[test]
    fn utf8_codec_rejects_invalid_bytes() {
        assert!(Utf8Codec.decode(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn json_codec_reads_text_written_by_utf8_codec() {
        let stored = Utf8Codec
            .encode(&r#"{"testValue1": "value1"}"#.to_string())
            .expect("encode should succeed");
        let value = JsonCodec::<serde_json::Value>::new()
            .decode(&stored)
            .expect("stored text is valid JSON");
        assert_eq!(value, serde_json::json!({"testValue1": "value1"}));
    }

    #[test]
    fn json_codec_reports_malformed_input() {
        let codec = JsonCodec::<serde_json::Value>::new();
        let err = codec.decode(b"{not json").expect_err("should fail");
        assert!(err.to_string().starts_with("failed to decode payload"));
    }

    struct Rot13;

    impl Rot13 {
        fn rotate(text: &str) -> String {
            text.chars()
                .map(|c| match c {
                    'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
                    'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
                    _ => c,
                })
                .collect()
        }
    }

    impl TextDecryptor for Rot13 {
        fn decrypt(&self, cipher_text: &str) -> Result<String, DecodeError> {
            Ok(Self::rotate(cipher_text))
        }

        fn encrypt(&self, plain_text: &str) -> Result<String, EncodeError> {
            Ok(Self::rotate(plain_text))
        }
    }

    #[test]
    fn decrypting_codec_decrypts_before_decoding() {
        let codec = Decrypting::new(JsonCodec::<serde_json::Value>::new(), Rot13);
        let cipher = br#"{"xrl":"inyhr"}"#;
        let value = codec.decode(cipher).expect("decrypted JSON should decode");
        assert_eq!(value, serde_json::json!({"key": "value"}));

        let encoded = codec.encode(&value).expect("encode should succeed");
        assert_eq!(encoded, cipher.to_vec());
    }

    #[test]
    fn no_op_decryptor_passes_text_through() {
        let codec = Decrypting::new(Utf8Codec, NoOpDecryptor);
        assert_eq!(codec.decode(b"plain").expect("decode"), "plain");
    }

    #[test]
    fn fn_codec_delegates_to_closures() {
        let codec = FnCodec::new(
            |bytes: &[u8]| Ok(bytes.len()),
            |len: &usize| Ok(vec![0u8; *len]),
        );
        assert_eq!(codec.decode(b"abcd").expect("decode"), 4);
        assert_eq!(codec.encode(&2).expect("encode"), vec![0, 0]);
    }
}
