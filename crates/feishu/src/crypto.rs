use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("encrypted payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("encrypted payload too short")]
    TooShort,
    #[error("decryption failed")]
    Cipher,
    #[error("decrypted payload is not valid UTF-8 JSON: {0}")]
    Decode(String),
}

/// Decrypts a channel event envelope: AES-256-CBC with the key derived as
/// SHA-256 of the configured encrypt key and the IV carried as the first 16
/// bytes of the base64 payload.
pub fn decrypt_event(encrypt_text: &str, encrypt_key: &str) -> Result<serde_json::Value, DecryptError> {
    let raw = base64::engine::general_purpose::STANDARD.decode(encrypt_text)?;
    if raw.len() <= 16 {
        return Err(DecryptError::TooShort);
    }
    let (iv, cipher_text) = raw.split_at(16);

    let key = Sha256::digest(encrypt_key.as_bytes());
    let mut buffer = cipher_text.to_vec();
    let plain = Aes256CbcDec::new(key.as_slice().into(), iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| DecryptError::Cipher)?;

    serde_json::from_slice(plain).map_err(|error| DecryptError::Decode(error.to_string()))
}
